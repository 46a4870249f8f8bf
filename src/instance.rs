//! Identity and liveness of the local editor instance.
//!
//! One [`EditorInstance`] exists per running process. The registry owns it
//! behind a lock and hands out copies, so callers never observe a mutation
//! halfway through a read.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Which editor flavour is hosting the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditorType {
    Vscode,
    Cursor,
    Windsurf,
    Unknown,
}

impl EditorType {
    /// Derive the editor type from the host application name.
    ///
    /// Matching is case-insensitive and checked in order: Cursor, then
    /// Windsurf (including its Codeium branding), then VS Code.
    pub fn detect(app_name: &str) -> Self {
        let name = app_name.to_lowercase();
        if name.contains("cursor") {
            EditorType::Cursor
        } else if name.contains("windsurf") || name.contains("codeium") {
            EditorType::Windsurf
        } else if name.contains("visual studio code") || name.contains("vscode") {
            EditorType::Vscode
        } else {
            EditorType::Unknown
        }
    }
}

/// Identity record for the running editor instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorInstance {
    pub id: String,
    pub machine_id: String,
    pub session_id: String,
    pub workspace_folders: Vec<String>,
    #[serde(rename = "type")]
    pub editor_type: EditorType,
    pub start_time: u64,
    pub last_heartbeat: u64,
}

/// Metadata supplied by the host when the registry is created.
#[derive(Debug, Clone)]
pub struct HostMetadata {
    pub app_name: String,
    pub machine_id: String,
    pub session_id: String,
    pub workspace_folders: Vec<String>,
}

impl HostMetadata {
    /// Metadata for a host running on this machine.
    ///
    /// Falls back to the system hostname when no machine id is given and
    /// mints a fresh session id.
    pub fn local(app_name: impl Into<String>, machine_id: Option<String>) -> Self {
        let machine_id = machine_id.unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string())
        });
        Self {
            app_name: app_name.into(),
            machine_id,
            session_id: uuid::Uuid::new_v4().to_string(),
            workspace_folders: Vec::new(),
        }
    }

    pub fn with_workspace_folders(mut self, folders: Vec<String>) -> Self {
        self.workspace_folders = folders;
        self
    }
}

/// Persistence for the stable instance id.
pub trait IdStore: Send + Sync {
    fn load(&self) -> Option<String>;
    fn store(&self, id: &str) -> std::io::Result<()>;
}

/// Stores the instance id in a plain text file.
pub struct FileIdStore {
    path: PathBuf,
}

impl FileIdStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$XDG_DATA_HOME/editor-control/instance-id`, or a path in the
    /// temp dir when no data dir is known.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("editor-control")
            .join("instance-id")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdStore for FileIdStore {
    fn load(&self) -> Option<String> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        let id = contents.trim();
        if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        }
    }

    fn store(&self, id: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, id)
    }
}

/// Keeps the id in memory. Used when nothing should touch the disk.
#[derive(Default)]
pub struct MemoryIdStore {
    id: Mutex<Option<String>>,
}

impl IdStore for MemoryIdStore {
    fn load(&self) -> Option<String> {
        self.id.lock().clone()
    }

    fn store(&self, id: &str) -> std::io::Result<()> {
        *self.id.lock() = Some(id.to_string());
        Ok(())
    }
}

/// Owner of the single [`EditorInstance`] for this process.
#[derive(Clone)]
pub struct InstanceRegistry {
    inner: Arc<RwLock<EditorInstance>>,
}

impl InstanceRegistry {
    /// Build the instance record, reusing a persisted id when one exists.
    ///
    /// A store that fails to persist a freshly minted id only costs id
    /// stability across restarts, so the failure is logged and creation
    /// carries on.
    pub fn create(metadata: HostMetadata, store: &dyn IdStore) -> Self {
        let id = match store.load() {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                if let Err(e) = store.store(&id) {
                    tracing::warn!(error = %e, "failed to persist instance id");
                }
                id
            }
        };

        let now = now_millis();
        let instance = EditorInstance {
            id,
            machine_id: metadata.machine_id,
            session_id: metadata.session_id,
            workspace_folders: metadata.workspace_folders,
            editor_type: EditorType::detect(&metadata.app_name),
            start_time: now,
            last_heartbeat: now,
        };
        tracing::debug!(id = %instance.id, editor = ?instance.editor_type, "instance registered");

        Self {
            inner: Arc::new(RwLock::new(instance)),
        }
    }

    /// A copy of the current instance record.
    pub fn snapshot(&self) -> EditorInstance {
        self.inner.read().clone()
    }

    /// Replace the workspace folder list.
    pub fn on_workspace_changed(&self, folders: Vec<String>) {
        self.inner.write().workspace_folders = folders;
    }

    /// Bump `last_heartbeat` to now. Never moves it backwards.
    pub fn refresh_heartbeat(&self) {
        let now = now_millis();
        let mut instance = self.inner.write();
        instance.last_heartbeat = instance.last_heartbeat.max(now);
    }

    /// Refresh the heartbeat on a fixed period until the returned handle
    /// is stopped or dropped.
    pub fn spawn_heartbeat(&self, period: Duration) -> HeartbeatTask {
        let registry = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.refresh_heartbeat();
                tracing::trace!("instance heartbeat");
            }
        });
        HeartbeatTask { task }
    }
}

/// Handle to the periodic heartbeat task.
pub struct HeartbeatTask {
    task: tokio::task::JoinHandle<()>,
}

impl HeartbeatTask {
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        self.task.abort();
    }
}
