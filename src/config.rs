//! Configuration accessor: load/save of the [`CloudVmConfig`] record plus a
//! `config-updated` notification stream.
//!
//! Every accepted change bumps a revision counter and is broadcast as a
//! [`ConfigUpdated`]. Writers get the revision of their own write back from
//! [`ConfigStore::save`], which lets the credential refresher recognise (and
//! the controller ignore) notifications caused by its own token write-back.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::models::CloudVmConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigUpdated {
    pub revision: u64,
}

pub trait ConfigStore: Send + Sync {
    /// `Ok(None)` when nothing has been configured yet.
    fn load(&self) -> Result<Option<CloudVmConfig>>;
    /// Persist `config` and return the revision assigned to the write.
    fn save(&self, config: &CloudVmConfig) -> Result<u64>;
    fn subscribe(&self) -> broadcast::Receiver<ConfigUpdated>;
}

// ── Shared change tracking ────────────────────────────────────────────────────

struct ChangeFeed {
    current: Mutex<Option<CloudVmConfig>>,
    revision: AtomicU64,
    tx: broadcast::Sender<ConfigUpdated>,
}

impl ChangeFeed {
    fn new(initial: Option<CloudVmConfig>) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { current: Mutex::new(initial), revision: AtomicU64::new(0), tx }
    }

    fn get(&self) -> Option<CloudVmConfig> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Record `config`; returns the new revision, or `None` if nothing changed.
    fn replace(&self, config: Option<CloudVmConfig>) -> Option<u64> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if *current == config {
            return None;
        }
        *current = config;
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        // no receivers is fine
        let _ = self.tx.send(ConfigUpdated { revision });
        Some(revision)
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }
}

// ── File-backed store ─────────────────────────────────────────────────────────

pub fn default_config_path() -> PathBuf {
    let base = dirs::config_dir()
        .unwrap_or_else(|| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/root".into()))
                .join(".config")
        });
    base.join("cloudvm").join("config.json")
}

/// JSON file store. Call [`FileConfigStore::watch`] to pick up edits made by
/// other processes.
pub struct FileConfigStore {
    path: PathBuf,
    feed: ChangeFeed,
}

impl FileConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let initial = read_config(&path)?;
        Ok(Self { path, feed: ChangeFeed::new(initial) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file and notify subscribers if the parsed record changed.
    /// Our own writes land here too and are dropped by the equality check.
    pub fn reload(&self) -> Result<bool> {
        let on_disk = read_config(&self.path)?;
        match self.feed.replace(on_disk) {
            Some(revision) => {
                info!(path = %self.path.display(), revision, "Config changed on disk");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Watch the parent directory so editors that write-then-rename are seen.
    /// The watcher stops when the returned handle is dropped.
    pub fn watch(self: &Arc<Self>) -> Result<RecommendedWatcher> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| AppError::Config(format!("{} has no parent directory", self.path.display())))?
            .to_path_buf();
        std::fs::create_dir_all(&parent)?;
        let target = self.path.file_name().map(|f| f.to_os_string());
        let store = Arc::downgrade(self);

        let mut watcher = notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Config watch error");
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            let affects_target = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|f| Some(f.to_os_string()) == target).unwrap_or(false));
            if !affects_target {
                return;
            }
            let Some(store) = store.upgrade() else { return };
            if let Err(e) = store.reload() {
                // half-written file; the next event will retry
                debug!(error = %e, "Config reload skipped");
            }
        })?;
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;
        debug!(dir = %parent.display(), "Watching config directory");
        Ok(watcher)
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<Option<CloudVmConfig>> {
        Ok(self.feed.get())
    }

    fn save(&self, config: &CloudVmConfig) -> Result<u64> {
        write_config(&self.path, config)?;
        Ok(self.feed.replace(Some(config.clone())).unwrap_or_else(|| self.feed.revision()))
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigUpdated> {
        self.feed.tx.subscribe()
    }
}

fn read_config(path: &Path) -> Result<Option<CloudVmConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| AppError::Config(format!("Bad {}: {}", path.display(), e)))
}

fn write_config(path: &Path, config: &CloudVmConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, &json)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

// ── In-memory store ───────────────────────────────────────────────────────────

/// Store for embedders that keep configuration elsewhere, and for tests.
pub struct MemoryConfigStore {
    feed: ChangeFeed,
}

impl MemoryConfigStore {
    pub fn new(config: Option<CloudVmConfig>) -> Self {
        Self { feed: ChangeFeed::new(config) }
    }

    /// Simulates an edit made by another component.
    pub fn set_external(&self, config: Option<CloudVmConfig>) -> Option<u64> {
        self.feed.replace(config)
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<Option<CloudVmConfig>> {
        Ok(self.feed.get())
    }

    fn save(&self, config: &CloudVmConfig) -> Result<u64> {
        Ok(self.feed.replace(Some(config.clone())).unwrap_or_else(|| self.feed.revision()))
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigUpdated> {
        self.feed.tx.subscribe()
    }
}
