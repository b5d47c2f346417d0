use serenity::model::id::GuildId;
use std::{
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// Directorio temporal para descargas en curso y archivos de reproducción.
#[derive(Debug, Clone)]
pub struct StagingDir {
    root: PathBuf,
}

impl StagingDir {
    /// Crea el directorio si no existe (idempotente).
    pub fn create(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Destino de una descarga; se lee al caché y luego se borra.
    pub fn download_path(&self, video_id: &str) -> PathBuf {
        self.root.join(format!("download_{video_id}"))
    }

    /// Archivo de reproducción por guild: dos guilds con el mismo video no comparten archivo.
    pub fn playback_path(&self, guild_id: GuildId, video_id: &str) -> PathBuf {
        self.root
            .join(format!("play_{}_{}.m4a", guild_id.get(), video_id))
    }

    /// Escribe `data` en `path` y devuelve el guard dueño del archivo.
    pub async fn write(&self, path: PathBuf, data: &[u8]) -> io::Result<StagedFile> {
        let guard = StagedFile::new(path);
        tokio::fs::write(guard.path(), data).await?;
        Ok(guard)
    }

    /// Borra todos los archivos temporales (usado al apagar).
    pub async fn purge(&self) -> io::Result<usize> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("No se pudo borrar archivo temporal {}: {}", path.display(), e),
            }
        }

        if removed > 0 {
            info!("🧹 Eliminados {} archivos temporales de {}", removed, self.root.display());
        }
        Ok(removed)
    }
}

/// Dueño de un archivo temporal; lo borra al hacer drop.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    armed: bool,
}

impl StagedFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Renuncia al archivo sin borrarlo.
    #[cfg(test)]
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Archivo temporal eliminado: {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("No se pudo borrar archivo temporal {}: {}", self.path.display(), e),
        }
    }
}
