//! Background task bookkeeping for a session

use std::future::Future;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Tasks spawned on behalf of one session
///
/// Every task gets a child of the set's cancellation token. `cancel` stops
/// them all; `shutdown` also waits for them to finish.
pub struct TaskSet {
    cancel: CancellationToken,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a named task, returning its cancellation token
    pub fn spawn<F, Fut>(&self, name: &str, f: F) -> CancellationToken
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.cancel.child_token();
        let handle = tokio::spawn(f(token.clone()));
        debug!("Spawned session task '{}'", name);

        let mut handles = self.handles.lock();
        handles.retain(|(_, h)| !h.is_finished());
        handles.push((name.to_string(), handle));
        token
    }

    /// Cancel all tasks; returns `true` only for the first call
    pub fn cancel(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tasks not yet joined
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every task and wait for all of them
    pub async fn shutdown(&self) {
        self.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for (name, handle) in handles {
            match handle.await {
                Ok(()) => debug!("Session task '{}' finished", name),
                Err(e) if e.is_panic() => warn!("Session task '{}' panicked", name),
                Err(e) => debug!("Session task '{}' aborted: {}", name, e),
            }
        }
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}
