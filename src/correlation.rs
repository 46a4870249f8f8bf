//! Correlation of asynchronous command invocations with their results.
//!
//! Every outbound invocation gets a fresh integer id and a pending entry.
//! The entry settles exactly once: by a matching result, by its deadline,
//! or by [`PendingCommands::cancel_all`] when the transport goes away.
//! Late or unknown completions are dropped without error.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Default deadline for a correlated call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a correlated call did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("timeout after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("not connected")]
    NotConnected,
    /// The remote side reported a failure; the message is passed through verbatim.
    #[error("{0}")]
    Remote(String),
}

pub type CommandOutcome = Result<serde_json::Value, CommandError>;

struct Entry {
    created_at: Instant,
    tx: oneshot::Sender<CommandOutcome>,
    timer: tokio::task::JoinHandle<()>,
}

struct Inner {
    next_id: u64,
    entries: HashMap<u64, Entry>,
}

/// Table of in-flight correlated calls.
///
/// Cheap to clone; clones share the same table and id counter.
#[derive(Clone)]
pub struct PendingCommands {
    inner: Arc<Mutex<Inner>>,
}

impl Default for PendingCommands {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCommands {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 1,
                entries: HashMap::new(),
            })),
        }
    }

    /// Allocate a new pending entry and start its deadline.
    ///
    /// Must be called from within a tokio runtime.
    pub fn begin(&self, timeout: Duration) -> PendingCommand {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let weak = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(expire(weak, id, timeout));
        inner.entries.insert(
            id,
            Entry {
                created_at: Instant::now(),
                tx,
                timer,
            },
        );

        PendingCommand { id, rx }
    }

    /// Complete an entry with a result. Returns false if no entry was pending.
    pub fn resolve(&self, id: u64, result: serde_json::Value) -> bool {
        self.complete(id, Ok(result))
    }

    /// Fail an entry. Returns false if no entry was pending.
    pub fn reject(&self, id: u64, error: CommandError) -> bool {
        self.complete(id, Err(error))
    }

    /// Fail every pending entry with [`CommandError::Disconnected`].
    ///
    /// Returns the number of entries that were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let drained: Vec<(u64, Entry)> = self.inner.lock().entries.drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            entry.timer.abort();
            tracing::debug!(id, "cancelling pending command: {}", reason);
            let _ = entry
                .tx
                .send(Err(CommandError::Disconnected(reason.to_string())));
        }
        count
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age of a pending entry, if it is still pending.
    pub fn age(&self, id: u64) -> Option<Duration> {
        self.inner
            .lock()
            .entries
            .get(&id)
            .map(|entry| entry.created_at.elapsed())
    }

    fn complete(&self, id: u64, outcome: CommandOutcome) -> bool {
        let entry = self.inner.lock().entries.remove(&id);
        match entry {
            Some(entry) => {
                entry.timer.abort();
                let _ = entry.tx.send(outcome);
                true
            }
            None => {
                tracing::trace!(id, "ignoring completion for settled or unknown id");
                false
            }
        }
    }
}

async fn expire(inner: Weak<Mutex<Inner>>, id: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let entry = inner.lock().entries.remove(&id);
    if let Some(entry) = entry {
        tracing::warn!(id, ?timeout, "command timed out");
        let _ = entry.tx.send(Err(CommandError::Timeout(timeout)));
    }
}

/// Caller's side of a pending entry.
#[derive(Debug)]
pub struct PendingCommand {
    id: u64,
    rx: oneshot::Receiver<CommandOutcome>,
}

impl PendingCommand {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the entry to settle.
    pub async fn wait(self) -> CommandOutcome {
        self.rx.await.unwrap_or_else(|_| {
            Err(CommandError::Disconnected(
                "correlation table dropped".to_string(),
            ))
        })
    }
}
