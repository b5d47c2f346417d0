use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId, MessageId};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("error de E/S en storage: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON inválido en storage: {0}")]
    Json(#[from] serde_json::Error),
}

/// Mensaje persistente (dashboard) de un guild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentMessageRecord {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl PersistentMessageRecord {
    pub fn guild(&self) -> GuildId {
        GuildId::new(self.guild_id)
    }

    pub fn channel(&self) -> ChannelId {
        ChannelId::new(self.channel_id)
    }

    pub fn message(&self) -> MessageId {
        MessageId::new(self.message_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: u64,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Datos de servidor almacenados en JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildRecord {
    pub guild_id: u64,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub channels: BTreeMap<u64, ChannelRecord>,
    #[serde(default)]
    pub dashboard: Option<PersistentMessageRecord>,
}

impl GuildRecord {
    fn new(guild_id: u64, name: Option<String>) -> Self {
        Self {
            guild_id,
            name,
            created_at: Utc::now(),
            channels: BTreeMap::new(),
            dashboard: None,
        }
    }
}

/// Manager de almacenamiento basado en archivos JSON
pub struct JsonStorage {
    data_dir: PathBuf,
    servers_cache: HashMap<u64, GuildRecord>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self, StorageError> {
        // Crear directorios de datos si no existen
        let servers_dir = data_dir.join("servers");
        fs::create_dir_all(&servers_dir).await?;

        info!("📁 Storage inicializado en: {}", data_dir.display());

        let mut storage = Self {
            data_dir,
            servers_cache: HashMap::new(),
        };

        // Cargar registros existentes
        storage.load_all_servers().await?;

        Ok(storage)
    }

    /// Obtiene o crea el registro de un servidor
    pub async fn ensure_guild(
        &mut self,
        guild_id: GuildId,
        name: Option<&str>,
    ) -> Result<GuildRecord, StorageError> {
        let id = guild_id.get();
        if let Some(record) = self.servers_cache.get_mut(&id) {
            if record.name.is_none() && name.is_some() {
                record.name = name.map(str::to_string);
                let record = record.clone();
                self.save_server(&record).await?;
                return Ok(record);
            }
            return Ok(record.clone());
        }

        let record = GuildRecord::new(id, name.map(str::to_string));
        self.save_server(&record).await?;
        self.servers_cache.insert(id, record.clone());
        info!("📝 Registro creado para guild {}", guild_id);
        Ok(record)
    }

    /// Obtiene o crea el registro de un canal
    pub async fn ensure_channel(
        &mut self,
        guild_id: GuildId,
        channel_id: ChannelId,
        name: Option<&str>,
    ) -> Result<ChannelRecord, StorageError> {
        self.ensure_guild(guild_id, None).await?;
        let record = self.guild_mut(guild_id);
        let channel = record
            .channels
            .entry(channel_id.get())
            .or_insert_with(|| ChannelRecord {
                channel_id: channel_id.get(),
                name: name.map(str::to_string),
                created_at: Utc::now(),
            })
            .clone();
        let record = record.clone();
        self.save_server(&record).await?;
        Ok(channel)
    }

    pub fn guild(&self, guild_id: GuildId) -> Option<&GuildRecord> {
        self.servers_cache.get(&guild_id.get())
    }

    pub fn dashboard_for_guild(&self, guild_id: GuildId) -> Option<PersistentMessageRecord> {
        self.guild(guild_id)?.dashboard.clone()
    }

    pub fn dashboard_for_channel(&self, channel_id: ChannelId) -> Option<PersistentMessageRecord> {
        self.servers_cache
            .values()
            .filter_map(|g| g.dashboard.as_ref())
            .find(|d| d.channel_id == channel_id.get())
            .cloned()
    }

    pub fn dashboards(&self) -> Vec<PersistentMessageRecord> {
        self.servers_cache
            .values()
            .filter_map(|g| g.dashboard.clone())
            .collect()
    }

    /// Crea o reemplaza el dashboard del guild
    pub async fn set_dashboard(
        &mut self,
        guild_id: GuildId,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<PersistentMessageRecord, StorageError> {
        self.ensure_channel(guild_id, channel_id, None).await?;
        let now = Utc::now();
        let dashboard = PersistentMessageRecord {
            guild_id: guild_id.get(),
            channel_id: channel_id.get(),
            message_id: message_id.get(),
            created_at: now,
            last_updated: now,
        };

        let record = self.guild_mut(guild_id);
        record.dashboard = Some(dashboard.clone());
        let record = record.clone();
        self.save_server(&record).await?;

        info!("💾 Dashboard guardado para guild {} en canal {}", guild_id, channel_id);
        Ok(dashboard)
    }

    /// Apunta el dashboard a un mensaje nuevo, solo si sigue siendo `expected_message`
    /// en `expected_channel`. `false` si el guild no tiene dashboard o si cambió.
    pub async fn update_dashboard_message_if(
        &mut self,
        guild_id: GuildId,
        expected_channel: ChannelId,
        expected_message: MessageId,
        message_id: MessageId,
    ) -> Result<bool, StorageError> {
        let Some(record) = self.servers_cache.get_mut(&guild_id.get()) else {
            return Ok(false);
        };
        let Some(dashboard) = record
            .dashboard
            .as_mut()
            .filter(|d| d.channel() == expected_channel && d.message() == expected_message)
        else {
            return Ok(false);
        };
        dashboard.message_id = message_id.get();
        dashboard.last_updated = Utc::now();

        let record = record.clone();
        self.save_server(&record).await?;
        debug!("Dashboard de guild {} ahora es el mensaje {}", guild_id, message_id);
        Ok(true)
    }

    pub async fn remove_dashboard(
        &mut self,
        guild_id: GuildId,
    ) -> Result<Option<PersistentMessageRecord>, StorageError> {
        let Some(record) = self.servers_cache.get_mut(&guild_id.get()) else {
            return Ok(None);
        };
        let removed = record.dashboard.take();
        if removed.is_some() {
            let record = record.clone();
            self.save_server(&record).await?;
            info!("🗑️ Dashboard eliminado para guild {}", guild_id);
        }
        Ok(removed)
    }

    /// Lista todos los servidores conocidos
    pub fn list_servers(&self) -> Vec<u64> {
        self.servers_cache.keys().copied().collect()
    }

    /// Reescribe todos los registros en disco
    pub async fn flush(&self) -> Result<usize, StorageError> {
        let mut written = 0;
        for record in self.servers_cache.values() {
            self.save_server(record).await?;
            written += 1;
        }
        Ok(written)
    }

    /// Vacía a disco antes de apagar
    pub async fn close(&mut self) -> Result<(), StorageError> {
        let written = self.flush().await?;
        info!("💾 Storage cerrado ({} servidores)", written);
        self.servers_cache.clear();
        Ok(())
    }

    /// Obtiene estadísticas de almacenamiento
    pub async fn get_storage_stats(&self) -> Result<StorageStats, StorageError> {
        let servers_dir = self.data_dir.join("servers");
        let mut files = fs::read_dir(&servers_dir).await?;
        let mut file_count = 0;
        let mut total_size = 0;

        while let Some(entry) = files.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                file_count += 1;
                if let Ok(metadata) = entry.metadata().await {
                    total_size += metadata.len();
                }
            }
        }

        Ok(StorageStats {
            server_files: file_count,
            cached_servers: self.servers_cache.len(),
            dashboards: self.dashboards().len(),
            total_size_bytes: total_size,
            data_dir: self.data_dir.clone(),
        })
    }

    // Métodos privados

    fn guild_mut(&mut self, guild_id: GuildId) -> &mut GuildRecord {
        let id = guild_id.get();
        self.servers_cache
            .entry(id)
            .or_insert_with(|| GuildRecord::new(id, None))
    }

    async fn load_server(&self, guild_id: u64) -> Result<GuildRecord, StorageError> {
        let file_path = self.get_server_file_path(guild_id);
        let content = fs::read_to_string(&file_path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn save_server(&self, record: &GuildRecord) -> Result<(), StorageError> {
        let file_path = self.get_server_file_path(record.guild_id);
        let tmp_path = file_path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(record)?;
        fs::write(&tmp_path, content).await?;
        fs::rename(&tmp_path, &file_path).await?;
        Ok(())
    }

    async fn load_all_servers(&mut self) -> Result<(), StorageError> {
        let servers_dir = self.data_dir.join("servers");
        let mut files = fs::read_dir(&servers_dir).await?;
        let mut loaded_count = 0;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let Some(guild_id) = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };

            match self.load_server(guild_id).await {
                Ok(record) => {
                    self.servers_cache.insert(guild_id, record);
                    loaded_count += 1;
                }
                Err(e) => {
                    warn!("Error cargando registro para guild {}: {}", guild_id, e);
                }
            }
        }

        if loaded_count > 0 {
            info!("📂 Cargados {} registros de servidor", loaded_count);
        }

        Ok(())
    }

    fn get_server_file_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir
            .join("servers")
            .join(format!("guild_{}.json", guild_id))
    }
}

/// Estadísticas de almacenamiento
#[derive(Debug)]
pub struct StorageStats {
    pub server_files: usize,
    pub cached_servers: usize,
    pub dashboards: usize,
    pub total_size_bytes: u64,
    pub data_dir: PathBuf,
}

impl std::fmt::Display for StorageStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "📊 Storage Stats:\n\
             📁 Data Directory: {}\n\
             📝 Server Files: {} files\n\
             💾 Cached Servers: {} in memory\n\
             📌 Dashboards: {}\n\
             📦 Total Size: {} bytes ({:.2} KB)",
            self.data_dir.display(),
            self.server_files,
            self.cached_servers,
            self.dashboards,
            self.total_size_bytes,
            self.total_size_bytes as f64 / 1024.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const GUILD: GuildId = GuildId::new(100);
    const CHANNEL: ChannelId = ChannelId::new(200);

    #[tokio::test]
    async fn dashboard_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
            storage.ensure_guild(GUILD, Some("Opal HQ")).await.unwrap();
            storage
                .set_dashboard(GUILD, CHANNEL, MessageId::new(1))
                .await
                .unwrap();
            assert!(storage
                .update_dashboard_message_if(GUILD, CHANNEL, MessageId::new(1), MessageId::new(2))
                .await
                .unwrap());
            storage.close().await.unwrap();
        }

        let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        let record = storage.dashboard_for_channel(CHANNEL).unwrap();
        assert_eq!(record.message(), MessageId::new(2));
        assert_eq!(storage.guild(GUILD).unwrap().name.as_deref(), Some("Opal HQ"));
        assert!(storage.guild(GUILD).unwrap().channels.contains_key(&CHANNEL.get()));
    }

    #[tokio::test]
    async fn one_dashboard_per_guild() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();

        storage.set_dashboard(GUILD, CHANNEL, MessageId::new(1)).await.unwrap();
        storage
            .set_dashboard(GUILD, ChannelId::new(201), MessageId::new(5))
            .await
            .unwrap();

        assert_eq!(storage.dashboards().len(), 1);
        assert!(storage.dashboard_for_channel(CHANNEL).is_none());
        assert_eq!(storage.get_storage_stats().await.unwrap().dashboards, 1);
    }

    #[tokio::test]
    async fn remove_and_update_without_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();

        assert_eq!(storage.remove_dashboard(GUILD).await.unwrap(), None);
        assert!(!storage
            .update_dashboard_message_if(GUILD, CHANNEL, MessageId::new(1), MessageId::new(3))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn stale_dashboard_update_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        let moved_to = ChannelId::new(201);
        storage.set_dashboard(GUILD, CHANNEL, MessageId::new(1)).await.unwrap();
        storage.set_dashboard(GUILD, moved_to, MessageId::new(5)).await.unwrap();

        // un reenvío en el canal anterior llega tarde
        assert!(!storage
            .update_dashboard_message_if(GUILD, CHANNEL, MessageId::new(1), MessageId::new(6))
            .await
            .unwrap());
        // el mensaje esperado ya no es el actual
        assert!(!storage
            .update_dashboard_message_if(GUILD, moved_to, MessageId::new(1), MessageId::new(6))
            .await
            .unwrap());

        let record = storage.dashboard_for_guild(GUILD).unwrap();
        assert_eq!(record.channel(), moved_to);
        assert_eq!(record.message(), MessageId::new(5));
    }

    #[tokio::test]
    async fn corrupt_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let servers = dir.path().join("servers");
        std::fs::create_dir_all(&servers).unwrap();
        std::fs::write(servers.join("guild_9.json"), "{ not json").unwrap();

        let storage = JsonStorage::new(dir.path().to_path_buf()).await.unwrap();
        assert!(storage.list_servers().is_empty());
    }
}
