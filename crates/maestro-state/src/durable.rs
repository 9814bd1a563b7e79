//! Tier B: the durable transactional store.

use async_trait::async_trait;
use maestro_core::{ExecutionRecord, MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Durable storage contract: opaque key/value rows, the execution audit
/// log, plan blobs, and versioned continuous state.
///
/// Every write that returns `Ok` must be recoverable after a process
/// restart.
#[async_trait]
pub trait DurableTier: Send + Sync {
    async fn kv_put(&self, key: &str, value: Vec<u8>) -> MaestroResult<()>;
    async fn kv_get(&self, key: &str) -> MaestroResult<Option<Vec<u8>>>;
    async fn kv_delete(&self, key: &str) -> MaestroResult<()>;

    /// Upsert one execution record, keyed by `execution_id`.
    async fn put_execution(&self, record: &ExecutionRecord) -> MaestroResult<()>;
    async fn get_execution(&self, execution_id: Uuid) -> MaestroResult<Option<ExecutionRecord>>;
    /// All records for one agent, newest submission first.
    async fn list_executions(&self, agent_name: &str) -> MaestroResult<Vec<ExecutionRecord>>;

    /// Upsert the plan blob for `task_id` (`UNIQUE(task_id)` semantics).
    async fn save_plan(&self, task_id: &str, plan: &serde_json::Value) -> MaestroResult<()>;
    async fn load_plan(&self, task_id: &str) -> MaestroResult<Option<serde_json::Value>>;

    /// Conditional upsert: succeeds iff the stored version equals
    /// `expected_version` (0 when nothing is stored yet), then increments
    /// and returns the new version. Fails with
    /// [`MaestroError::StaleVersion`] otherwise.
    async fn save_continuous(
        &self,
        agent_name: &str,
        state: &serde_json::Value,
        expected_version: u64,
    ) -> MaestroResult<u64>;
    async fn load_continuous(
        &self,
        agent_name: &str,
    ) -> MaestroResult<Option<(serde_json::Value, u64)>>;
}

#[derive(Serialize, Deserialize)]
struct VersionedRow {
    version: u64,
    state: serde_json::Value,
}

/// File-backed [`DurableTier`]: one JSON (or tagged binary) file per row,
/// written atomically via a temp file and rename.
pub struct FileDurableStore {
    root: PathBuf,
    /// Serializes the read-check-write cycle of the conditional upsert.
    continuous_lock: Mutex<()>,
}

impl FileDurableStore {
    pub async fn new(root: impl Into<PathBuf>) -> MaestroResult<Self> {
        let root = root.into();
        for sub in ["state", "executions", "plans", "continuous"] {
            tokio::fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self {
            root,
            continuous_lock: Mutex::new(()),
        })
    }

    fn state_path(&self, key: &str) -> PathBuf {
        self.root.join("state").join(format!("{}.bin", sanitize(key)))
    }

    fn execution_path(&self, execution_id: Uuid) -> PathBuf {
        self.root
            .join("executions")
            .join(format!("{execution_id}.json"))
    }

    fn plan_path(&self, task_id: &str) -> PathBuf {
        self.root
            .join("plans")
            .join(format!("{}.json", sanitize(task_id)))
    }

    fn continuous_path(&self, agent_name: &str) -> PathBuf {
        self.root
            .join("continuous")
            .join(format!("{}.json", sanitize(agent_name)))
    }
}

/// Map an arbitrary key to a safe file name; bytes outside `[A-Za-z0-9._-]`
/// are percent-escaped so distinct keys stay distinct.
fn sanitize(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> MaestroResult<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_optional(path: &Path) -> MaestroResult<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl DurableTier for FileDurableStore {
    async fn kv_put(&self, key: &str, value: Vec<u8>) -> MaestroResult<()> {
        write_atomic(&self.state_path(key), &value).await
    }

    async fn kv_get(&self, key: &str) -> MaestroResult<Option<Vec<u8>>> {
        read_optional(&self.state_path(key)).await
    }

    async fn kv_delete(&self, key: &str) -> MaestroResult<()> {
        let path = self.state_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_execution(&self, record: &ExecutionRecord) -> MaestroResult<()> {
        let json = serde_json::to_vec(record)?;
        write_atomic(&self.execution_path(record.execution_id), &json).await
    }

    async fn get_execution(&self, execution_id: Uuid) -> MaestroResult<Option<ExecutionRecord>> {
        match read_optional(&self.execution_path(execution_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_executions(&self, agent_name: &str) -> MaestroResult<Vec<ExecutionRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join("executions")).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            let record: ExecutionRecord = match serde_json::from_slice(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Skipping unreadable execution record");
                    continue;
                }
            };
            if record.agent_name == agent_name {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(records)
    }

    async fn save_plan(&self, task_id: &str, plan: &serde_json::Value) -> MaestroResult<()> {
        let json = serde_json::to_vec(plan)?;
        write_atomic(&self.plan_path(task_id), &json).await
    }

    async fn load_plan(&self, task_id: &str) -> MaestroResult<Option<serde_json::Value>> {
        match read_optional(&self.plan_path(task_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_continuous(
        &self,
        agent_name: &str,
        state: &serde_json::Value,
        expected_version: u64,
    ) -> MaestroResult<u64> {
        let _guard = self.continuous_lock.lock().await;
        let path = self.continuous_path(agent_name);
        let stored_version = match read_optional(&path).await? {
            Some(bytes) => serde_json::from_slice::<VersionedRow>(&bytes)?.version,
            None => 0,
        };
        if stored_version != expected_version {
            return Err(MaestroError::StaleVersion {
                key: format!("continuous:{agent_name}"),
                expected: expected_version,
                stored: stored_version,
            });
        }
        let new_version = stored_version + 1;
        let row = VersionedRow {
            version: new_version,
            state: state.clone(),
        };
        write_atomic(&path, &serde_json::to_vec(&row)?).await?;
        Ok(new_version)
    }

    async fn load_continuous(
        &self,
        agent_name: &str,
    ) -> MaestroResult<Option<(serde_json::Value, u64)>> {
        match read_optional(&self.continuous_path(agent_name)).await? {
            Some(bytes) => {
                let row: VersionedRow = serde_json::from_slice(&bytes)?;
                Ok(Some((row.state, row.version)))
            }
            None => Ok(None),
        }
    }
}
