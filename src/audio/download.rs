use bytes::Bytes;
use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    cache::{AudioCache, CacheError, CachedAudio, StagedFile},
    sources::{ProgressFn, SourceError, VideoResolver},
};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no se pudo resolver {url}: {source}")]
    Resolution {
        url: String,
        #[source]
        source: SourceError,
    },

    #[error("{0} no tiene stream de solo audio")]
    NoAudioStream(String),

    #[error("la descarga de {id} falló: {reason}")]
    Download { id: String, reason: String },

    #[error("el archivo descargado de {0} no existe")]
    FileMissing(String),

    #[error("la descarga de {id} no terminó en {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl DownloadError {
    /// Fase en la que falló.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Resolution { .. } | Self::NoAudioStream(_) => "resolution",
            Self::Download { .. } => "download",
            Self::FileMissing(_) => "file-missing",
            Self::Timeout { .. } => "timeout",
            Self::Cache(_) => "cache",
        }
    }
}

/// Estado de una descarga en curso. Hay como máximo uno por video.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub stream: String,
    pub completed: bool,
    pub percent: f32,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadTiming {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for DownloadTiming {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Descarga audio al caché, con una sola descarga en vuelo por video.
pub struct DownloadCoordinator {
    resolver: Arc<dyn VideoResolver>,
    cache: Arc<AudioCache>,
    progress: Arc<DashMap<String, DownloadProgress>>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    timing: DownloadTiming,
}

impl DownloadCoordinator {
    pub fn new(
        resolver: Arc<dyn VideoResolver>,
        cache: Arc<AudioCache>,
        timing: DownloadTiming,
    ) -> Self {
        Self {
            resolver,
            cache,
            progress: Arc::new(DashMap::new()),
            in_flight: DashMap::new(),
            timing,
        }
    }

    #[cfg(test)]
    pub fn cache(&self) -> &Arc<AudioCache> {
        &self.cache
    }

    pub fn progress(&self, video_id: &str) -> Option<DownloadProgress> {
        self.progress.get(video_id).map(|p| p.clone())
    }

    /// Devuelve el audio cacheado, descargándolo si falta.
    ///
    /// Un segundo pedido del mismo video espera al primero y luego lee del caché.
    pub async fn ensure_cached(
        &self,
        video_id: &str,
        url: &str,
    ) -> Result<CachedAudio, DownloadError> {
        if let Some(hit) = self.cache.lookup(video_id).await {
            debug!("💾 Cache hit para {}", video_id);
            return Ok(hit);
        }

        let lock = self
            .in_flight
            .entry(video_id.to_string())
            .or_default()
            .clone();

        let result = {
            let _guard = lock.lock().await;
            match self.cache.lookup(video_id).await {
                Some(hit) => {
                    debug!("💾 {} ya fue descargado por otro pedido", video_id);
                    Ok(hit)
                }
                None => self.download(video_id, url).await,
            }
        };

        // el mapa y este lock: nadie más espera
        self.in_flight
            .remove_if(video_id, |_, l| Arc::strong_count(l) <= 2);

        result
    }

    async fn download(&self, video_id: &str, url: &str) -> Result<CachedAudio, DownloadError> {
        let video = self
            .resolver
            .resolve(url)
            .await
            .map_err(|source| DownloadError::Resolution {
                url: url.to_string(),
                source,
            })?;
        let stream = video
            .best_audio()
            .cloned()
            .ok_or_else(|| DownloadError::NoAudioStream(video_id.to_string()))?;

        info!(
            "⬇️ Descargando {} ({}) formato {}",
            video.title, video_id, stream.format_id
        );

        self.progress.insert(
            video_id.to_string(),
            DownloadProgress {
                stream: stream.format_id.clone(),
                completed: false,
                percent: 0.0,
                failure: None,
            },
        );

        let dest = self.cache.staging().download_path(video_id);
        let staged = StagedFile::new(dest.clone());

        let transfer = {
            let resolver = self.resolver.clone();
            let progress = self.progress.clone();
            let id = video_id.to_string();
            let page_url = video.webpage_url.clone();
            let format_id = stream.format_id.clone();
            let on_progress: ProgressFn = {
                let progress = progress.clone();
                let id = id.clone();
                Arc::new(move |done, total| update_progress(&progress, &id, done, total))
            };

            tokio::spawn(async move {
                let result = resolver
                    .download(&page_url, &format_id, &dest, on_progress)
                    .await;
                if let Some(mut entry) = progress.get_mut(&id) {
                    match result {
                        Ok(()) => {
                            entry.completed = true;
                            entry.percent = 100.0;
                        }
                        Err(e) => entry.failure = Some(e.to_string()),
                    }
                }
            })
        };

        let waited = self.wait_for_download(video_id).await;
        self.progress.remove(video_id);
        if let Err(e) = waited {
            transfer.abort();
            return Err(e);
        }

        let data = match tokio::fs::read(staged.path()).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DownloadError::FileMissing(video_id.to_string()))
            }
            Err(e) => {
                return Err(DownloadError::Download {
                    id: video_id.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        drop(staged);

        let bytes = Bytes::from(data);
        self.cache.put(video_id, bytes.clone()).await?;
        self.cache.put_title(video_id, &video.title).await?;

        info!("✅ {} en caché ({} bytes)", video.title, bytes.len());
        Ok(CachedAudio {
            bytes,
            title: video.title,
        })
    }

    /// Espera a que el registro de progreso quede completo o falle.
    async fn wait_for_download(&self, video_id: &str) -> Result<(), DownloadError> {
        let deadline = Instant::now() + self.timing.timeout;
        loop {
            match self.progress.get(video_id) {
                Some(p) if p.completed => return Ok(()),
                Some(p) => {
                    if let Some(reason) = &p.failure {
                        return Err(DownloadError::Download {
                            id: video_id.to_string(),
                            reason: reason.clone(),
                        });
                    }
                }
                None => {
                    return Err(DownloadError::Download {
                        id: video_id.to_string(),
                        reason: "registro de progreso perdido".to_string(),
                    })
                }
            }

            if Instant::now() >= deadline {
                warn!(
                    "⏱️ Timeout esperando la descarga de {} ({:?})",
                    video_id, self.timing.timeout
                );
                return Err(DownloadError::Timeout {
                    id: video_id.to_string(),
                    timeout: self.timing.timeout,
                });
            }
            tokio::time::sleep(self.timing.poll_interval).await;
        }
    }
}

fn update_progress(map: &DashMap<String, DownloadProgress>, id: &str, done: u64, total: u64) {
    if let Some(mut entry) = map.get_mut(id) {
        if total > 0 {
            entry.percent = (done as f64 / total as f64 * 100.0).min(100.0) as f32;
        }
        debug!("⬇️ {}: {:.1}%", id, entry.percent);
    }
}
