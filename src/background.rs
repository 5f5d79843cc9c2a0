//! Best-effort background queue for detached sync work.
//!
//! Tasks are spawned onto the ambient Tokio runtime and cannot be awaited
//! or cancelled by whoever queued them. Every error a task returns is logged
//! and dropped here; nothing escapes the queue.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::sync::Notify;

#[derive(Default)]
struct QueueState {
    pending: AtomicUsize,
    idle: Notify,
}

/// Decrements the pending count even if the task panics.
struct PendingGuard(Arc<QueueState>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Shared fire-and-forget task queue. Clones share the same pending count.
#[derive(Clone, Default)]
pub struct BackgroundQueue {
    state: Arc<QueueState>,
}

impl BackgroundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `task` detached. Its error, if any, is logged under `label`.
    ///
    /// Outside a Tokio runtime the task is dropped with a warning.
    pub fn spawn<F, E>(&self, label: impl Into<String>, task: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let label = label.into();
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime available, dropping background task '{label}'");
                return;
            }
        };

        self.state.pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingGuard(Arc::clone(&self.state));

        handle.spawn(async move {
            let _guard = guard;
            match task.await {
                Ok(()) => debug!("Background task '{label}' finished"),
                Err(e) => warn!("Background task '{label}' failed: {e}"),
            }
        });
    }

    /// Number of queued tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// Resolves once no task is pending.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}
