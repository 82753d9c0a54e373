//! Child-process helpers shared across the workspace.
//!
//! - [`tokio_command`] builds a command that never pops up a console window on Windows.
//! - [`watch_child`] supervises a spawned child and reports how it ended exactly once.

use std::ffi::OsStr;
use std::fmt;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// How a supervised child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process exited on its own (completion or crash).
    ///
    /// `code` is `None` when the process was ended by a signal it did not
    /// receive from us.
    Exited { success: bool, code: Option<i32> },
    /// The process was killed after termination was requested.
    Terminated,
    /// The process could not be waited on or killed.
    Error(String),
}

impl ExitOutcome {
    /// Whether the process finished with a zero exit code.
    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Exited { success: true, .. })
    }

    /// The exit code, if the process exited on its own with one.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitOutcome::Exited { code, .. } => *code,
            _ => None,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited {
                code: Some(code), ..
            } => write!(f, "exited with code {}", code),
            ExitOutcome::Exited { code: None, .. } => write!(f, "killed by signal"),
            ExitOutcome::Terminated => write!(f, "terminated"),
            ExitOutcome::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` that kills the child when its handle is
/// dropped and never opens a console window.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.kill_on_drop(true);
    cmd.no_window();
    cmd
}

/// Supervise a spawned child on its own task.
///
/// The returned receiver resolves exactly once: with the child's exit status
/// when it ends by itself, or with [`ExitOutcome::Terminated`] after
/// `cancellation_token` fires and the child has been killed. Cancelling an
/// already-finished child is harmless.
#[cfg(feature = "tokio")]
pub fn watch_child(
    mut child: tokio::process::Child,
    cancellation_token: tokio_util::sync::CancellationToken,
) -> tokio::sync::oneshot::Receiver<ExitOutcome> {
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => ExitOutcome::Exited {
                    success: status.success(),
                    code: status.code(),
                },
                Err(e) => ExitOutcome::Error(format!("failed to wait for child: {}", e)),
            },
            _ = cancellation_token.cancelled() => match child.kill().await {
                Ok(()) => ExitOutcome::Terminated,
                Err(e) => ExitOutcome::Error(format!("failed to kill child: {}", e)),
            },
        };
        let _ = tx.send(outcome);
    });

    rx
}
