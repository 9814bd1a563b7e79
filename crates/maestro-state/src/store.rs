use crate::cache::CacheTier;
use crate::codec;
use crate::continuous::ContinuousAgentState;
use crate::durable::DurableTier;
use maestro_core::{ExecutionRecord, MaestroError, MaestroResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

const CACHE_BYPASS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Two-tier state facade: write-through to the durable tier, read-through
/// the cache, compression transparent at the boundary.
pub struct StateStore {
    cache: Arc<dyn CacheTier>,
    durable: Arc<dyn DurableTier>,
    default_ttl: Duration,
    /// key prefix -> last time a cache bypass was logged for it.
    bypass_log: Mutex<HashMap<String, Instant>>,
}

impl StateStore {
    pub fn new(cache: Arc<dyn CacheTier>, durable: Arc<dyn DurableTier>) -> Self {
        Self {
            cache,
            durable,
            default_ttl: Duration::from_secs(300),
            bypass_log: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Store `value` under `key`. Durable writes go to Tier B first and a
    /// Tier B failure fails the call; the cache write is best-effort.
    pub async fn put_state(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: Option<Duration>,
        durable: bool,
    ) -> MaestroResult<()> {
        let bytes = serde_json::to_vec(value)?;
        let encoded = codec::encode(&bytes)?;
        if durable {
            self.durable.kv_put(key, encoded.clone()).await?;
        }
        if let Err(e) = self
            .cache
            .put(key, encoded, Some(ttl.unwrap_or(self.default_ttl)))
            .await
        {
            self.log_cache_bypass(key, &e);
        }
        debug!(key, durable, compressed = bytes.len() > codec::COMPRESSION_THRESHOLD, "State written");
        Ok(())
    }

    /// Cache first; on miss or cache failure, read Tier B and re-populate
    /// the cache with the default TTL.
    pub async fn get_state(&self, key: &str) -> MaestroResult<Option<serde_json::Value>> {
        match self.cache.get(key).await {
            Ok(Some(encoded)) => {
                let bytes = codec::decode(&encoded)?;
                return Ok(Some(serde_json::from_slice(&bytes)?));
            }
            Ok(None) => {}
            Err(e) => self.log_cache_bypass(key, &e),
        }

        // The continuous namespace lives in its own versioned rows.
        if let Some(agent_name) = key.strip_prefix("continuous:") {
            if let Some((mut value, version)) = self.durable.load_continuous(agent_name).await? {
                if let Some(object) = value.as_object_mut() {
                    object.insert("version".to_string(), serde_json::json!(version));
                }
                return Ok(Some(value));
            }
        }

        match self.durable.kv_get(key).await? {
            Some(encoded) => {
                let bytes = codec::decode(&encoded)?;
                let value: serde_json::Value = serde_json::from_slice(&bytes)?;
                if let Err(e) = self
                    .cache
                    .put(key, encoded, Some(self.default_ttl))
                    .await
                {
                    self.log_cache_bypass(key, &e);
                }
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn log_cache_bypass(&self, key: &str, error: &MaestroError) {
        let prefix = key.split(':').next().unwrap_or(key).to_string();
        let mut log = self.bypass_log.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let should_log = log
            .get(&prefix)
            .map(|last| now.duration_since(*last) >= CACHE_BYPASS_LOG_INTERVAL)
            .unwrap_or(true);
        if should_log {
            log.insert(prefix.clone(), now);
            warn!(key_prefix = %prefix, error = %error, "Cache unavailable, bypassing to durable tier");
        }
    }

    /// Persist a freshly created QUEUED record.
    pub async fn append_execution(&self, record: &ExecutionRecord) -> MaestroResult<()> {
        self.durable.put_execution(record).await
    }

    /// Overwrite an execution record. Returns `false` without writing when
    /// the stored record is already terminal: terminal records are
    /// append-only, and redelivered events must not rewrite the audit log.
    pub async fn update_execution(&self, record: &ExecutionRecord) -> MaestroResult<bool> {
        if let Some(existing) = self.durable.get_execution(record.execution_id).await? {
            if existing.is_terminal() {
                debug!(
                    execution_id = %record.execution_id,
                    status = %existing.status,
                    "Ignoring update to terminal execution record"
                );
                return Ok(false);
            }
        }
        self.durable.put_execution(record).await?;
        Ok(true)
    }

    pub async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> MaestroResult<Option<ExecutionRecord>> {
        self.durable.get_execution(execution_id).await
    }

    pub async fn list_executions(&self, agent_name: &str) -> MaestroResult<Vec<ExecutionRecord>> {
        self.durable.list_executions(agent_name).await
    }

    pub async fn save_plan<T: Serialize>(&self, task_id: &str, plan: &T) -> MaestroResult<()> {
        self.durable
            .save_plan(task_id, &serde_json::to_value(plan)?)
            .await
    }

    pub async fn load_plan<T: DeserializeOwned>(&self, task_id: &str) -> MaestroResult<Option<T>> {
        match self.durable.load_plan(task_id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Conditional save keyed on `state.version`. On success the state's
    /// version is advanced to the stored one and the cache entry refreshed;
    /// on [`MaestroError::StaleVersion`] the caller reloads, re-applies its
    /// turn, and retries (bounded).
    pub async fn save_continuous(
        &self,
        state: &mut ContinuousAgentState,
    ) -> MaestroResult<u64> {
        let expected = state.version;
        let value = serde_json::to_value(&*state)?;
        let new_version = self
            .durable
            .save_continuous(&state.agent_name, &value, expected)
            .await?;
        state.version = new_version;

        let key = format!("continuous:{}", state.agent_name);
        match serde_json::to_vec(&*state) {
            Ok(bytes) => match codec::encode(&bytes) {
                Ok(encoded) => {
                    if let Err(e) = self
                        .cache
                        .put(&key, encoded, Some(self.default_ttl))
                        .await
                    {
                        self.log_cache_bypass(&key, &e);
                    }
                }
                Err(e) => warn!(key, error = %e, "Could not encode continuous state for cache"),
            },
            Err(e) => warn!(key, error = %e, "Could not serialize continuous state for cache"),
        }
        Ok(new_version)
    }

    pub async fn load_continuous(
        &self,
        agent_name: &str,
    ) -> MaestroResult<Option<ContinuousAgentState>> {
        match self.durable.load_continuous(agent_name).await? {
            Some((value, version)) => {
                let mut state: ContinuousAgentState = serde_json::from_value(value)?;
                state.version = version;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::durable::FileDurableStore;
    use async_trait::async_trait;

    struct BrokenCache;

    #[async_trait]
    impl CacheTier for BrokenCache {
        async fn get(&self, _key: &str) -> MaestroResult<Option<Vec<u8>>> {
            Err(MaestroError::unavailable("cache", "connection refused"))
        }
        async fn put(
            &self,
            _key: &str,
            _value: Vec<u8>,
            _ttl: Option<Duration>,
        ) -> MaestroResult<()> {
            Err(MaestroError::unavailable("cache", "connection refused"))
        }
        async fn remove(&self, _key: &str) -> MaestroResult<()> {
            Err(MaestroError::unavailable("cache", "connection refused"))
        }
    }

    async fn file_store(dir: &std::path::Path) -> Arc<FileDurableStore> {
        Arc::new(FileDurableStore::new(dir).await.unwrap())
    }

    #[tokio::test]
    async fn put_get_round_trip_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Arc::new(MemoryCache::new()), file_store(dir.path()).await);
        let value = serde_json::json!({"answer": 42});
        store.put_state("k", &value, None, true).await.unwrap();
        assert_eq!(store.get_state("k").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn broken_cache_falls_through_to_durable() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Arc::new(BrokenCache), file_store(dir.path()).await);
        let value = serde_json::json!({"resilient": true});
        store.put_state("k", &value, None, true).await.unwrap();
        assert_eq!(store.get_state("k").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn non_durable_put_is_cache_only() {
        let dir = tempfile::tempdir().unwrap();
        let durable = file_store(dir.path()).await;
        let store = StateStore::new(Arc::new(MemoryCache::new()), durable.clone());
        let value = serde_json::json!("ephemeral");
        store.put_state("k", &value, None, false).await.unwrap();
        assert_eq!(store.get_state("k").await.unwrap(), Some(value));
        assert_eq!(durable.kv_get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_through_repopulates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MemoryCache::new());
        let durable = file_store(dir.path()).await;

        // Write through a store with a broken cache, read with a good one.
        let writer = StateStore::new(Arc::new(BrokenCache), durable.clone());
        writer
            .put_state("k", &serde_json::json!(1), None, true)
            .await
            .unwrap();

        let reader = StateStore::new(cache.clone(), durable);
        assert_eq!(
            reader.get_state("k").await.unwrap(),
            Some(serde_json::json!(1))
        );
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn terminal_records_are_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Arc::new(MemoryCache::new()), file_store(dir.path()).await);

        let mut record = ExecutionRecord::new("a1", Uuid::new_v4());
        store.append_execution(&record).await.unwrap();
        record.mark_running();
        assert!(store.update_execution(&record).await.unwrap());
        record.mark_completed(serde_json::json!({"answer": "4"}));
        assert!(store.update_execution(&record).await.unwrap());

        // A redelivered event trying to fail the same execution is ignored.
        let mut replay = record.clone();
        replay.mark_failed("duplicate delivery");
        assert!(!store.update_execution(&replay).await.unwrap());
        let stored = store.get_execution(record.execution_id).await.unwrap().unwrap();
        assert_eq!(stored.status, maestro_core::ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn continuous_save_advances_version_and_get_state_sees_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Arc::new(MemoryCache::new()), file_store(dir.path()).await);

        let mut state = ContinuousAgentState::new("c1");
        state.record_turn(
            maestro_core::ChatMessage::user("A"),
            maestro_core::ChatMessage::assistant("ok"),
        );
        let v1 = store.save_continuous(&mut state).await.unwrap();
        assert_eq!(v1, 1);
        assert_eq!(state.version, 1);

        let via_get = store.get_state("continuous:c1").await.unwrap().unwrap();
        assert!(via_get["version"].as_u64().unwrap() >= v1);

        let reloaded = store.load_continuous("c1").await.unwrap().unwrap();
        assert_eq!(reloaded.version, 1);
        assert_eq!(reloaded.event_count, 1);
    }

    #[tokio::test]
    async fn stale_save_surfaces_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Arc::new(MemoryCache::new()), file_store(dir.path()).await);

        let mut ours = ContinuousAgentState::new("c1");
        store.save_continuous(&mut ours).await.unwrap();

        // Another runner instance saved meanwhile.
        let mut theirs = store.load_continuous("c1").await.unwrap().unwrap();
        store.save_continuous(&mut theirs).await.unwrap();

        let result = store.save_continuous(&mut ours).await;
        assert!(matches!(result, Err(MaestroError::StaleVersion { .. })));
    }
}
