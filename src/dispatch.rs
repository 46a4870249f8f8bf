//! The operation set shared by the HTTP and WebSocket front ends.
//!
//! Both transports normalise their requests into calls on [`Dispatcher`];
//! only the framing of requests and replies differs between them.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::devtools::DevToolsTracker;
use crate::host::{CommandHost, HostError, OPEN_WEBVIEW_DEVTOOLS, TOGGLE_DEVTOOLS};
use crate::instance::{EditorInstance, InstanceRegistry};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The request was rejected before reaching the host.
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Host(#[from] HostError),
}

/// A devtools state change, tagged with the WebSocket connection that
/// caused it so that connection is not told twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevToolsChange {
    pub open: bool,
    pub origin: Option<u64>,
}

#[derive(Clone)]
pub struct Dispatcher {
    host: Arc<dyn CommandHost>,
    instance: InstanceRegistry,
    devtools: DevToolsTracker,
    changes: broadcast::Sender<DevToolsChange>,
    toggle_lock: Arc<tokio::sync::Mutex<()>>,
    open_delay: Duration,
}

impl Dispatcher {
    pub fn new(
        host: Arc<dyn CommandHost>,
        instance: InstanceRegistry,
        devtools: DevToolsTracker,
        open_delay: Duration,
    ) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            host,
            instance,
            devtools,
            changes,
            toggle_lock: Arc::new(tokio::sync::Mutex::new(())),
            open_delay,
        }
    }

    pub fn instance(&self) -> EditorInstance {
        self.instance.snapshot()
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.instance
    }

    pub fn devtools(&self) -> &DevToolsTracker {
        &self.devtools
    }

    pub fn devtools_open(&self) -> bool {
        self.devtools.get_state()
    }

    pub fn subscribe_devtools(&self) -> broadcast::Receiver<DevToolsChange> {
        self.changes.subscribe()
    }

    pub async fn list_commands(&self) -> Result<Vec<String>, DispatchError> {
        Ok(self.host.list_commands().await?)
    }

    /// Run a host command. An empty name never reaches the host.
    pub async fn invoke(&self, command: &str, args: Vec<Value>) -> Result<Value, DispatchError> {
        if command.trim().is_empty() {
            return Err(DispatchError::BadRequest("command name is required".into()));
        }
        tracing::debug!(command, args = args.len(), "invoking host command");
        self.host.execute(command, args).await.map_err(|e| {
            tracing::warn!(command, error = %e, "host command failed");
            DispatchError::Host(e)
        })
    }

    /// Toggle the developer tools panel and return the new state.
    ///
    /// Toggles run one at a time. The host's answer is authoritative when it
    /// is a boolean; otherwise the tracked state is flipped. `origin` names
    /// the WebSocket connection that asked, if any.
    pub async fn toggle_devtools(&self, origin: Option<u64>) -> Result<bool, DispatchError> {
        let _guard = self.toggle_lock.lock().await;
        let current = self.devtools.get_state();
        let reported = self.host.execute(TOGGLE_DEVTOOLS, Vec::new()).await?;
        let open = reported.as_bool().unwrap_or(!current);
        if self.devtools.set_state(open) {
            tracing::info!(open, "devtools state changed");
            let _ = self.changes.send(DevToolsChange { open, origin });
        }
        Ok(open)
    }

    /// Run a script in the developer tools console, opening the panel first
    /// if it is closed.
    pub async fn execute_in_devtools(&self, script: &str) -> Result<(), DispatchError> {
        if script.trim().is_empty() {
            return Err(DispatchError::BadRequest("script is required".into()));
        }
        if !self.devtools.get_state() {
            self.toggle_devtools(None).await?;
            tokio::time::sleep(self.open_delay).await;
        }
        self.host
            .execute(OPEN_WEBVIEW_DEVTOOLS, vec![Value::String(script.to_string())])
            .await?;
        Ok(())
    }
}
