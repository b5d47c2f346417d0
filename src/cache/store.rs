use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    /// El store rechazó la escritura por exceder su presupuesto de memoria.
    #[error("store sin memoria: necesita {needed} bytes, capacidad {capacity}")]
    OutOfMemory { needed: usize, capacity: usize },

    #[error("store no disponible: {0}")]
    Unavailable(String),
}

/// Store clave/valor binario compartido por todos los usuarios del caché.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Política de retención de un [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct StorePolicy {
    pub capacity_bytes: usize,
    /// `None` deja la expulsión solo a la presión de memoria.
    pub ttl: Option<Duration>,
    /// Máximo de entradas expulsadas por una sola escritura.
    pub eviction_batch: usize,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            capacity_bytes: 512 * 1024 * 1024,
            ttl: None,
            eviction_batch: 8,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    created_at: u64,
    seq: u64,
}

impl StoredValue {
    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        match ttl {
            Some(ttl) => current_timestamp() > self.created_at + ttl.as_secs(),
            None => false,
        }
    }
}

/// Store en memoria con presupuesto de bytes.
///
/// Una escritura que no cabe expulsa como máximo `eviction_batch` entradas (primero las
/// expiradas, luego las más antiguas) y devuelve [`StoreError::OutOfMemory`] si el valor
/// sigue sin caber. Reintentar tras una pausa corta libera otro lote.
#[derive(Debug)]
pub struct MemoryStore {
    data: DashMap<String, StoredValue>,
    used_bytes: AtomicUsize,
    next_seq: AtomicU64,
    policy: StorePolicy,
    write_gate: Mutex<()>,
}

impl MemoryStore {
    pub fn new(policy: StorePolicy) -> Self {
        Self {
            data: DashMap::new(),
            used_bytes: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            policy,
            write_gate: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn capacity_bytes(&self) -> usize {
        self.policy.capacity_bytes
    }

    /// Elimina entradas expiradas y devuelve cuántas se borraron.
    pub fn cleanup_expired(&self) -> usize {
        let _gate = self.write_gate.lock();
        let expired: Vec<String> = self
            .data
            .iter()
            .filter(|entry| entry.value().is_expired(self.policy.ttl))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if self.remove_if_expired(&key) {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("Eliminadas {} entradas expiradas", removed);
        }
        removed
    }

    fn remove_entry(&self, key: &str) -> bool {
        match self.data.remove(key) {
            Some((_, old)) => {
                self.used_bytes.fetch_sub(old.value.len(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    fn remove_if_expired(&self, key: &str) -> bool {
        let ttl = self.policy.ttl;
        match self.data.remove_if(key, |_, stored| stored.is_expired(ttl)) {
            Some((_, old)) => {
                self.used_bytes.fetch_sub(old.value.len(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Expulsa hasta un lote de entradas, nunca `keep`.
    fn evict_batch(&self, keep: &str) -> usize {
        let ttl = self.policy.ttl;
        let mut candidates: Vec<(bool, u64, String)> = self
            .data
            .iter()
            .filter(|entry| entry.key() != keep)
            .map(|entry| {
                (
                    !entry.value().is_expired(ttl),
                    entry.value().seq,
                    entry.key().clone(),
                )
            })
            .collect();
        // expiradas primero (false < true), luego las más antiguas
        candidates.sort();

        let mut evicted = 0;
        for (_, _, key) in candidates.into_iter().take(self.policy.eviction_batch) {
            if self.remove_entry(&key) {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!("Expulsadas {} entradas por presión de memoria", evicted);
        }
        evicted
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StorePolicy::default())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let Some(entry) = self.data.get(key) else {
            return Ok(None);
        };
        if entry.is_expired(self.policy.ttl) {
            drop(entry);
            let _gate = self.write_gate.lock();
            // pudo reescribirse entre la lectura y el lock
            self.remove_if_expired(key);
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        let capacity = self.policy.capacity_bytes;
        if value.len() > capacity {
            return Err(StoreError::OutOfMemory {
                needed: value.len(),
                capacity,
            });
        }

        let _gate = self.write_gate.lock();
        let replaced = self.data.get(key).map(|e| e.value.len()).unwrap_or(0);
        let needed = self.used_bytes() - replaced + value.len();
        if needed > capacity {
            self.evict_batch(key);
            let needed = self.used_bytes() - replaced + value.len();
            if needed > capacity {
                return Err(StoreError::OutOfMemory { needed, capacity });
            }
        }

        let stored = StoredValue {
            created_at: current_timestamp(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            value,
        };
        self.used_bytes.fetch_add(stored.value.len(), Ordering::Relaxed);
        if let Some(old) = self.data.insert(key.to_string(), stored) {
            self.used_bytes.fetch_sub(old.value.len(), Ordering::Relaxed);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let _gate = self.write_gate.lock();
        Ok(self.remove_entry(key))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
