use async_trait::async_trait;
use maestro_core::MaestroResult;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Tier A: a near-cache with per-entry TTL.
///
/// Any error from this tier is recoverable; the [`crate::StateStore`]
/// facade falls through to the durable tier and keeps going.
#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn get(&self, key: &str) -> MaestroResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> MaestroResult<()>;
    async fn remove(&self, key: &str) -> MaestroResult<()>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// In-memory [`CacheTier`] with lazy expiry.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheTier for MemoryCache {
    async fn get(&self, key: &str) -> MaestroResult<Option<Vec<u8>>> {
        let expired = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) => match entry.expires_at {
                    Some(deadline) if Instant::now() >= deadline => true,
                    _ => return Ok(Some(entry.value.clone())),
                },
            }
        };
        if expired {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> MaestroResult<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> MaestroResult<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}
