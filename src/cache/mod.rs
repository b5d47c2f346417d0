//! # Cache Module
//!
//! Audio cache for Opal Bot, keyed by video id.
//!
//! Every cached video is stored as two halves in a [`KvStore`]:
//!
//! - `audio:<id>` holds the raw audio bytes
//! - `title:<id>` holds the display title
//!
//! An entry with only one half present counts as a miss. Writes the store
//! rejects for memory pressure are retried with a fixed backoff; other store
//! errors propagate right away.
//!
//! ## Configuration
//!
//! ```env
//! CACHE_CAPACITY_MB=512       # Byte budget of the in-process store
//! CACHE_TTL_SECS=0            # 0 leaves eviction to memory pressure
//! CACHE_WRITE_RETRIES=3
//! CACHE_RETRY_BACKOFF_MS=500
//! ```

pub mod staging;
pub mod store;

use bytes::Bytes;
use serenity::model::id::GuildId;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use staging::{StagedFile, StagingDir};
pub use store::{KvStore, MemoryStore, StoreError, StorePolicy};

const AUDIO_PREFIX: &str = "audio:";
const TITLE_PREFIX: &str = "title:";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("escritura de {key} rechazada tras {attempts} intentos: store sin memoria")]
    WriteRejected { key: String, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no hay audio en caché para {0}")]
    Missing(String),

    #[error("error de archivo temporal: {0}")]
    Io(#[from] std::io::Error),
}

/// Ambas mitades de una entrada del caché.
#[derive(Debug, Clone)]
pub struct CachedAudio {
    pub bytes: Bytes,
    pub title: String,
}

/// Reintentos para escrituras rechazadas por falta de memoria.
#[derive(Debug, Clone, Copy)]
pub struct WriteRetry {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for WriteRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

pub struct AudioCache {
    store: Arc<dyn KvStore>,
    staging: StagingDir,
    retry: WriteRetry,
}

impl AudioCache {
    pub fn new(store: Arc<dyn KvStore>, staging: StagingDir, retry: WriteRetry) -> Self {
        Self {
            store,
            staging,
            retry,
        }
    }

    pub fn staging(&self) -> &StagingDir {
        &self.staging
    }

    /// Bytes de audio de `video_id`. Los fallos del store se registran y cuentan como miss.
    pub async fn get(&self, video_id: &str) -> Option<Bytes> {
        self.read(&audio_key(video_id)).await
    }

    pub async fn get_title(&self, video_id: &str) -> Option<String> {
        let raw = self.read(&title_key(video_id)).await?;
        match String::from_utf8(raw.to_vec()) {
            Ok(title) => Some(title),
            Err(_) => {
                warn!("Título en caché para {} no es UTF-8 válido", video_id);
                None
            }
        }
    }

    /// Ambas mitades o nada.
    pub async fn lookup(&self, video_id: &str) -> Option<CachedAudio> {
        let bytes = self.get(video_id).await?;
        let title = self.get_title(video_id).await?;
        Some(CachedAudio { bytes, title })
    }

    pub async fn put(&self, video_id: &str, bytes: Bytes) -> Result<(), CacheError> {
        self.write(audio_key(video_id), bytes).await
    }

    pub async fn put_title(&self, video_id: &str, title: &str) -> Result<(), CacheError> {
        self.write(title_key(video_id), Bytes::copy_from_slice(title.as_bytes()))
            .await
    }

    /// Borra las entradas de audio y título sin tocar otros namespaces.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for prefix in [AUDIO_PREFIX, TITLE_PREFIX] {
            for key in self.store.keys_with_prefix(prefix).await? {
                if self.store.delete(&key).await? {
                    removed += 1;
                }
            }
        }
        info!("🗑️ Caché de audio limpiado: {} claves", removed);
        Ok(removed)
    }

    /// Extrae el audio cacheado a un archivo de reproducción del guild.
    pub async fn materialize(
        &self,
        guild_id: GuildId,
        video_id: &str,
    ) -> Result<StagedFile, CacheError> {
        let bytes = self
            .get(video_id)
            .await
            .ok_or_else(|| CacheError::Missing(video_id.to_string()))?;
        let path = self.staging.playback_path(guild_id, video_id);
        Ok(self.staging.write(path, &bytes).await?)
    }

    async fn read(&self, key: &str) -> Option<Bytes> {
        match self.store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Error leyendo {} del caché, se trata como miss: {}", key, e);
                None
            }
        }
    }

    async fn write(&self, key: String, value: Bytes) -> Result<(), CacheError> {
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.store.set(&key, value.clone()).await {
                Ok(()) => return Ok(()),
                Err(StoreError::OutOfMemory { needed, capacity }) => {
                    warn!(
                        "⚠️ Escritura {} rechazada (intento {}/{}, necesita {} de {} bytes)",
                        key, attempt, attempts, needed, capacity
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.backoff).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CacheError::WriteRejected { key, attempts })
    }
}

impl std::fmt::Debug for AudioCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCache")
            .field("staging", &self.staging)
            .field("retry", &self.retry)
            .finish()
    }
}

fn audio_key(video_id: &str) -> String {
    format!("{AUDIO_PREFIX}{video_id}")
}

fn title_key(video_id: &str) -> String {
    format!("{TITLE_PREFIX}{video_id}")
}

/// Mantenimiento horario del store en memoria.
pub fn cleanup_expired(store: &MemoryStore) {
    let removed = store.cleanup_expired();
    if removed > 0 {
        info!("🧹 Limpieza de caché: {} entradas expiradas eliminadas", removed);
    } else {
        debug!(
            "Limpieza de caché: nada expirado ({} entradas, {} bytes)",
            store.len(),
            store.used_bytes()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cache_over(store: Arc<dyn KvStore>) -> (AudioCache, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingDir::create(dir.path()).unwrap();
        let retry = WriteRetry {
            attempts: 3,
            backoff: Duration::from_millis(5),
        };
        (AudioCache::new(store, staging, retry), dir)
    }

    /// Rechaza las primeras `failures` escrituras por falta de memoria.
    struct FlakyStore {
        inner: MemoryStore,
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(StoreError::OutOfMemory {
                    needed: value.len(),
                    capacity: 0,
                });
            }
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.delete(key).await
        }

        async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys_with_prefix(prefix).await
        }
    }

    #[tokio::test]
    async fn round_trip_returns_identical_bytes_and_title() {
        let (cache, _dir) = cache_over(Arc::new(MemoryStore::default()));
        let audio = Bytes::from_static(b"\x00\x01\xff binary audio");

        cache.put("dQw4w9WgXcQ", audio.clone()).await.unwrap();
        cache.put_title("dQw4w9WgXcQ", "Never Gonna").await.unwrap();

        let hit = cache.lookup("dQw4w9WgXcQ").await.unwrap();
        assert_eq!(hit.bytes, audio);
        assert_eq!(hit.title, "Never Gonna");
    }

    #[tokio::test]
    async fn half_populated_entry_is_a_miss() {
        let (cache, _dir) = cache_over(Arc::new(MemoryStore::default()));
        cache.put("abc", Bytes::from_static(b"x")).await.unwrap();

        assert!(cache.lookup("abc").await.is_none());
        assert!(cache.get_title("abc").await.is_none());
    }

    #[tokio::test]
    async fn out_of_memory_write_is_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::default(),
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let (cache, _dir) = cache_over(store.clone());

        cache.put("abc", Bytes::from_static(b"x")).await.unwrap();

        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(cache.get("abc").await.is_some());
    }

    #[tokio::test]
    async fn persistent_pressure_fails_loud() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::default(),
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let (cache, _dir) = cache_over(store);

        let err = cache.put_title("abc", "t").await.unwrap_err();
        assert!(matches!(err, CacheError::WriteRejected { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn clear_leaves_other_namespaces() {
        let store = Arc::new(MemoryStore::default());
        let (cache, _dir) = cache_over(store.clone());
        cache.put("a", Bytes::from_static(b"1")).await.unwrap();
        cache.put_title("a", "A").await.unwrap();
        store.set("session:42", Bytes::from_static(b"keep")).await.unwrap();

        assert_eq!(cache.clear().await.unwrap(), 2);
        assert!(store.get("session:42").await.unwrap().is_some());
        assert!(cache.get("a").await.is_none());
    }

    #[tokio::test]
    async fn materialize_writes_playback_file() {
        let (cache, _dir) = cache_over(Arc::new(MemoryStore::default()));
        cache.put("abc", Bytes::from_static(b"audio")).await.unwrap();

        let staged = cache.materialize(GuildId::new(7), "abc").await.unwrap();
        assert_eq!(std::fs::read(staged.path()).unwrap(), b"audio");

        let missing = cache.materialize(GuildId::new(7), "zzz").await;
        assert!(matches!(missing, Err(CacheError::Missing(_))));
    }
}
