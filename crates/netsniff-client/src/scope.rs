//! Task scope for logging work
//!
//! Capture tasks (body decoding, assembly, store writes) run on a scope owned
//! by the sniffing client, so they can be awaited or cancelled together.

use std::future::Future;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::error::SnifferError;

/// Runtime handle plus the set of logging tasks spawned on it
#[derive(Clone)]
pub struct SnifferScope {
    handle: Handle,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl SnifferScope {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Scope on the runtime this is called from
    pub fn current() -> Result<Self, SnifferError> {
        let handle = Handle::try_current()
            .map_err(|e| SnifferError::Config(format!("No tokio runtime for logging tasks: {}", e)))?;
        Ok(Self::new(handle))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a logging task. Returns `false` if the scope was shut down.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            debug!("Sniffer scope is shut down, dropping logging task");
            return false;
        }

        let cancel = self.cancel.clone();
        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = task => {}
                }
            },
            &self.handle,
        );
        true
    }

    /// Wait until every logging task spawned so far has completed.
    ///
    /// Never returns while an exchange that was started is still pending
    /// completion.
    pub async fn idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancel outstanding logging tasks and wait for them to stop
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Sniffer scope shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for SnifferScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnifferScope")
            .field("tasks", &self.tracker.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
