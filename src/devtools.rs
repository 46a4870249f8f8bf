//! Mirror of the editor's developer tools panel state.
//!
//! The host owns the real panel; this tracker only records what the host
//! last reported. Observers either follow every change through
//! [`DevToolsTracker::subscribe`] or wait for the next one with
//! [`DevToolsTracker::listen_once`].

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

#[derive(Clone)]
pub struct DevToolsTracker {
    state: Arc<watch::Sender<bool>>,
    listener: Arc<Mutex<Option<oneshot::Sender<bool>>>>,
}

impl Default for DevToolsTracker {
    fn default() -> Self {
        Self::new(false)
    }
}

impl DevToolsTracker {
    pub fn new(open: bool) -> Self {
        let (state, _) = watch::channel(open);
        Self {
            state: Arc::new(state),
            listener: Arc::new(Mutex::new(None)),
        }
    }

    pub fn get_state(&self) -> bool {
        *self.state.borrow()
    }

    /// Record a reported state. Returns true if the value changed.
    ///
    /// On a change the one-shot listener, if any, fires and is cleared.
    pub fn set_state(&self, open: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == open {
                false
            } else {
                *current = open;
                true
            }
        });
        if changed {
            if let Some(listener) = self.listener.lock().take() {
                let _ = listener.send(open);
            }
        }
        changed
    }

    /// Wait for the next change.
    ///
    /// Only one such listener exists at a time; registering a new one drops
    /// the previous, whose receiver then resolves with an error.
    pub fn listen_once(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        *self.listener.lock() = Some(tx);
        rx
    }

    /// Follow every change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}
