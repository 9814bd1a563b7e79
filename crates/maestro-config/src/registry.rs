//! YAML descriptor discovery with debounced hot reload.

use crate::models::{AgentDescriptor, LlmConfig, LlmProvider};
use maestro_core::{AgentMode, MaestroError, MaestroResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Minimum quiet period between a file-system event and the reload it
/// triggers, so editor save bursts coalesce into a single reload.
pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

/// Notification published to subscribers when a descriptor changes on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadEvent {
    /// Descriptor was added or its body changed; fetch the new one via `get`.
    Updated(String),
    /// Descriptor file was deleted.
    Removed(String),
}

#[derive(Default)]
struct RegistryInner {
    descriptors: HashMap<String, Arc<AgentDescriptor>>,
    /// file stem -> last load error for that file.
    errors: HashMap<String, String>,
    /// file path -> agent name loaded from it, for delete/rename handling.
    file_index: HashMap<PathBuf, String>,
}

/// Source of truth for agent descriptors.
///
/// All read operations return snapshots; no shared mutable references are
/// handed out. The registry is the single writer of its own maps.
pub struct ConfigRegistry {
    config_dir: PathBuf,
    inner: Arc<RwLock<RegistryInner>>,
    reload_tx: broadcast::Sender<ReloadEvent>,
    /// Kept alive for the lifetime of the registry; dropping it stops the
    /// file-system watch.
    watcher: StdMutex<Option<RecommendedWatcher>>,
}

impl ConfigRegistry {
    /// Enumerate `<config_dir>/*.{yml,yaml}`, parse and validate each file,
    /// and inject provider credentials from the environment.
    ///
    /// Individual bad files are recorded in [`errors`](Self::errors) and do
    /// not block startup. Startup fails only when candidate files exist but
    /// none validates, or when every credential-requiring descriptor is
    /// missing its credentials.
    pub fn load(config_dir: impl Into<PathBuf>) -> MaestroResult<Self> {
        let config_dir = config_dir.into();
        let (reload_tx, _) = broadcast::channel(64);
        let registry = Self {
            config_dir,
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            reload_tx,
            watcher: StdMutex::new(None),
        };

        if !registry.config_dir.exists() {
            warn!(dir = %registry.config_dir.display(), "Configuration directory does not exist");
            std::fs::create_dir_all(&registry.config_dir)?;
            return Ok(registry);
        }

        let mut candidates = 0usize;
        for entry in std::fs::read_dir(&registry.config_dir)? {
            let path = entry?.path();
            if !is_descriptor_file(&path) {
                continue;
            }
            candidates += 1;
            load_file(&path, &registry.inner, None);
        }

        let loaded = {
            let inner = registry.inner.read().unwrap_or_else(|e| e.into_inner());
            if candidates > 0 && inner.descriptors.is_empty() {
                let errors = inner
                    .errors
                    .values()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(MaestroError::ConfigInvalid(format!(
                    "no descriptor validated out of {candidates} file(s): {errors}"
                )));
            }
            inner.descriptors.len()
        };

        registry.check_credentials()?;

        info!(
            dir = %registry.config_dir.display(),
            loaded,
            candidates,
            "Configuration registry loaded"
        );
        Ok(registry)
    }

    /// Abort startup when at least one descriptor requires credentials and
    /// none of the credential-requiring descriptors has them.
    fn check_credentials(&self) -> MaestroResult<()> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let requiring: Vec<&Arc<AgentDescriptor>> = inner
            .descriptors
            .values()
            .filter(|d| d.llm.requires_credentials())
            .collect();
        if !requiring.is_empty() && requiring.iter().all(|d| !d.llm.has_credentials()) {
            let providers: Vec<String> =
                requiring.iter().map(|d| d.llm.provider.to_string()).collect();
            return Err(MaestroError::ConfigInvalid(format!(
                "no credentials available for any configured provider ({})",
                providers.join(", ")
            )));
        }
        Ok(())
    }

    /// Start watching the configuration directory for create/modify/delete.
    /// Events are debounced by [`RELOAD_DEBOUNCE`] before re-parsing.
    pub fn watch(&self) -> MaestroResult<()> {
        let (tx, rx) = std_mpsc::channel::<PathBuf>();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
            })
            .map_err(|e| {
                MaestroError::ConfigInvalid(format!("failed to create file watcher: {e}"))
            })?;

        watcher
            .watch(&self.config_dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                MaestroError::ConfigInvalid(format!(
                    "failed to watch '{}': {e}",
                    self.config_dir.display()
                ))
            })?;

        let inner = Arc::clone(&self.inner);
        let reload_tx = self.reload_tx.clone();
        std::thread::spawn(move || {
            while let Ok(first) = rx.recv() {
                // Collect the burst: keep draining until the directory has
                // been quiet for the debounce window.
                let mut touched = vec![first];
                loop {
                    match rx.recv_timeout(RELOAD_DEBOUNCE) {
                        Ok(path) => touched.push(path),
                        Err(std_mpsc::RecvTimeoutError::Timeout) => break,
                        Err(std_mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                }
                touched.sort();
                touched.dedup();

                for path in touched {
                    if !is_descriptor_file(&path) {
                        continue;
                    }
                    if path.exists() {
                        load_file(&path, &inner, Some(&reload_tx));
                    } else {
                        handle_removed(&path, &inner, &reload_tx);
                    }
                }
            }
            tracing::debug!("Configuration watcher thread exiting");
        });

        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(watcher);
        info!(dir = %self.config_dir.display(), "Configuration hot reload watching");
        Ok(())
    }

    /// Subscribe to reload notifications.
    pub fn subscribe_reload(&self) -> broadcast::Receiver<ReloadEvent> {
        self.reload_tx.subscribe()
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentDescriptor>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.descriptors.get(name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<AgentDescriptor>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<Arc<AgentDescriptor>> = inner.descriptors.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn list_by_mode(&self, mode: AgentMode) -> Vec<Arc<AgentDescriptor>> {
        self.list().into_iter().filter(|d| d.mode == mode).collect()
    }

    pub fn list_enabled(&self) -> Vec<Arc<AgentDescriptor>> {
        self.list().into_iter().filter(|d| d.enabled).collect()
    }

    /// Per-file load errors, keyed by file stem.
    pub fn errors(&self) -> HashMap<String, String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.errors.clone()
    }

    /// Re-parse a single descriptor file immediately, bypassing the watcher.
    pub fn reload_path(&self, path: &Path) {
        if path.exists() {
            load_file(path, &self.inner, Some(&self.reload_tx));
        } else {
            handle_removed(path, &self.inner, &self.reload_tx);
        }
    }
}

fn is_descriptor_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    )
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Parse, validate, and store one descriptor file. On failure the previous
/// descriptor (if any) is preserved and the error is recorded.
fn load_file(
    path: &Path,
    inner: &Arc<RwLock<RegistryInner>>,
    reload_tx: Option<&broadcast::Sender<ReloadEvent>>,
) {
    let stem = file_stem(path);
    let outcome = parse_descriptor(path);

    let mut guard = inner.write().unwrap_or_else(|e| e.into_inner());
    match outcome {
        Ok(descriptor) => {
            let name = descriptor.name.clone();

            // A rename inside the file orphans the old registration.
            if let Some(previous) = guard.file_index.insert(path.to_path_buf(), name.clone()) {
                if previous != name {
                    guard.descriptors.remove(&previous);
                    if let Some(tx) = reload_tx {
                        let _ = tx.send(ReloadEvent::Removed(previous));
                    }
                }
            }

            let changed = guard
                .descriptors
                .get(&name)
                .map(|existing| !descriptor_eq(existing, &descriptor))
                .unwrap_or(true);
            guard.descriptors.insert(name.clone(), Arc::new(descriptor));
            guard.errors.remove(&stem);
            drop(guard);

            info!(agent = %name, file = %path.display(), "Descriptor loaded");
            if changed {
                if let Some(tx) = reload_tx {
                    let _ = tx.send(ReloadEvent::Updated(name));
                }
            }
        }
        Err(err) => {
            let message = err.to_string();
            warn!(file = %path.display(), error = %message, "Descriptor rejected, previous version kept");
            guard.errors.insert(stem, message);
        }
    }
}

fn handle_removed(
    path: &Path,
    inner: &Arc<RwLock<RegistryInner>>,
    reload_tx: &broadcast::Sender<ReloadEvent>,
) {
    let mut guard = inner.write().unwrap_or_else(|e| e.into_inner());
    guard.errors.remove(&file_stem(path));
    if let Some(name) = guard.file_index.remove(path) {
        guard.descriptors.remove(&name);
        drop(guard);
        info!(agent = %name, file = %path.display(), "Descriptor removed");
        let _ = reload_tx.send(ReloadEvent::Removed(name));
    }
}

fn parse_descriptor(path: &Path) -> MaestroResult<AgentDescriptor> {
    let raw = std::fs::read_to_string(path)?;
    let mut descriptor: AgentDescriptor = serde_yaml_ng::from_str(&raw)
        .map_err(|e| MaestroError::ConfigInvalid(format!("{}: {e}", path.display())))?;
    inject_secrets(&mut descriptor.llm);
    descriptor.validate()?;
    Ok(descriptor)
}

/// Compare descriptors by their serialized form; credentials are injected
/// identically on both sides so env-only differences do not count.
fn descriptor_eq(a: &AgentDescriptor, b: &AgentDescriptor) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(va), Ok(vb)) => va == vb,
        _ => false,
    }
}

/// Fill provider credentials from the ambient environment, leaving values
/// already present in the file untouched.
fn inject_secrets(llm: &mut LlmConfig) {
    match llm.provider {
        LlmProvider::OpenAi => {
            if llm.api_key.is_none() {
                llm.api_key = std::env::var("OPENAI_API_KEY").ok();
            }
        }
        LlmProvider::Anthropic => {
            if llm.api_key.is_none() {
                llm.api_key = std::env::var("ANTHROPIC_API_KEY").ok();
            }
        }
        LlmProvider::Bedrock => {
            if llm.region.is_none() {
                llm.region =
                    Some(std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()));
            }
            if llm.access_key_id.is_none() {
                llm.access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok();
            }
            if llm.secret_access_key.is_none() {
                llm.secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok();
            }
        }
        LlmProvider::Ollama => {
            if llm.base_url.is_none() {
                llm.base_url = Some(
                    std::env::var("OLLAMA_BASE_URL")
                        .unwrap_or_else(|_| "http://localhost:11434".to_string()),
                );
            }
        }
    }
}
