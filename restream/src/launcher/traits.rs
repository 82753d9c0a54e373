//! Session launcher trait and process handle.

use std::future::Future;
use std::path::PathBuf;

use async_trait::async_trait;
use process_utils::ExitOutcome;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::domain::StreamDefinition;

/// Errors reported by a launcher. No process is left running when one of
/// these is returned.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Source file unavailable: {}", path.display())]
    SourceUnavailable { path: PathBuf },

    #[error("Failed to launch process: {0}")]
    LaunchFailed(String),
}

/// Handle to one running external process.
///
/// The handle exposes two operations: registering an exit listener, which
/// fires exactly once, and requesting termination, which is idempotent.
pub struct ProcessHandle {
    /// OS process id, when known.
    pid: Option<u32>,
    /// Cancelling this token asks the process watcher to kill the child.
    cancellation_token: CancellationToken,
    /// Exit notification from the process watcher. Taken by `on_exit`.
    exit_rx: Option<oneshot::Receiver<ExitOutcome>>,
}

impl ProcessHandle {
    /// Create a handle from a watcher's cancellation token and exit channel.
    pub fn new(
        pid: Option<u32>,
        cancellation_token: CancellationToken,
        exit_rx: oneshot::Receiver<ExitOutcome>,
    ) -> Self {
        Self {
            pid,
            cancellation_token,
            exit_rx: Some(exit_rx),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request the process to stop. Calling this on an exited or already
    /// terminated process does nothing.
    pub fn terminate(&self) {
        self.cancellation_token.cancel();
    }

    /// Whether termination has been requested.
    pub fn is_terminating(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Register the exit listener.
    ///
    /// The callback runs on its own task, exactly once, with the process'
    /// termination outcome. Only the first registration is accepted; later
    /// calls return `false` and drop their callback.
    pub fn on_exit<F, Fut>(&mut self, callback: F) -> bool
    where
        F: FnOnce(ExitOutcome) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(exit_rx) = self.exit_rx.take() else {
            return false;
        };

        tokio::spawn(async move {
            let outcome = exit_rx
                .await
                .unwrap_or_else(|_| ExitOutcome::Error("process watcher went away".to_string()));
            callback(outcome).await;
        });
        true
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("terminating", &self.is_terminating())
            .finish()
    }
}

/// Turns a stream definition into a running external process.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Spawn exactly one process for `definition`.
    ///
    /// Uploaded-file sources must exist and be readable; otherwise
    /// `LaunchError::SourceUnavailable` is returned without spawning.
    async fn launch(&self, definition: &StreamDefinition) -> Result<ProcessHandle, LaunchError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_on_exit_fires_once() {
        let (tx, rx) = oneshot::channel();
        let mut handle = ProcessHandle::new(Some(42), CancellationToken::new(), rx);
        let calls = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = oneshot::channel();

        let counter = calls.clone();
        assert!(handle.on_exit(move |outcome| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(outcome);
        }));
        // A second listener is refused.
        assert!(!handle.on_exit(|_| async {}));

        tx.send(ExitOutcome::Exited {
            success: true,
            code: Some(0),
        })
        .unwrap();

        let outcome = done_rx.await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_watcher_reports_error() {
        let (tx, rx) = oneshot::channel::<ExitOutcome>();
        let mut handle = ProcessHandle::new(None, CancellationToken::new(), rx);
        let (done_tx, done_rx) = oneshot::channel();

        handle.on_exit(move |outcome| async move {
            let _ = done_tx.send(outcome);
        });
        drop(tx);

        assert!(matches!(done_rx.await.unwrap(), ExitOutcome::Error(_)));
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let (_tx, rx) = oneshot::channel();
        let handle = ProcessHandle::new(None, CancellationToken::new(), rx);
        assert!(!handle.is_terminating());
        handle.terminate();
        handle.terminate();
        assert!(handle.is_terminating());
    }
}
