//! Deadline enforcement: forced termination of overdue executions.

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::time::Instant;
use tracing::{info, warn};

use super::execution::{Execution, ExecutionId};

/// Failure to deliver a termination signal.
#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
    /// The group has no live members left; the intent is already fulfilled.
    #[error("Process group {pgid} has already exited")]
    AlreadyGone { pgid: u32 },

    #[error("Failed to signal process group {pgid}: {errno}")]
    Signal { pgid: u32, errno: Errno },
}

/// Sends the forced-termination signal to a process group.
pub trait Terminator: Send {
    fn terminate_group(&self, pgid: u32) -> Result<(), TerminateError>;
}

/// Production terminator: `SIGKILL` to the whole process group, so that
/// anything a shell command spawned goes down with it.
#[derive(Debug, Clone, Copy, Default)]
pub struct KillGroup;

impl Terminator for KillGroup {
    fn terminate_group(&self, pgid: u32) -> Result<(), TerminateError> {
        let raw = i32::try_from(pgid).map_err(|_| TerminateError::Signal {
            pgid,
            errno: Errno::EINVAL,
        })?;
        match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => Ok(()),
            // EPERM: the group is gone and its id now belongs to someone else.
            Err(Errno::ESRCH | Errno::EPERM) => Err(TerminateError::AlreadyGone { pgid }),
            Err(errno) => Err(TerminateError::Signal { pgid, errno }),
        }
    }
}

/// Signal every execution whose deadline has passed and that has not been
/// signaled yet. Returns the ids signaled by this pass.
///
/// Each execution is marked signaled whatever the outcome, so it is never
/// signaled twice. Failures are logged and absorbed.
pub fn enforce_deadlines<'a, T>(
    executions: impl IntoIterator<Item = &'a mut Execution>,
    now: Instant,
    terminator: &T,
) -> Vec<ExecutionId>
where
    T: Terminator + ?Sized,
{
    let mut signaled = Vec::new();
    for execution in executions {
        if !execution.is_due(now) {
            continue;
        }
        execution.mark_signaled();
        signaled.push(execution.id());

        match terminator.terminate_group(execution.pid()) {
            Ok(()) => info!(
                execution_id = execution.id(),
                pid = execution.pid(),
                "Terminated execution"
            ),
            Err(TerminateError::AlreadyGone { .. }) => info!(
                execution_id = execution.id(),
                "Execution was marked to kill but has already exited"
            ),
            Err(e) => warn!(
                execution_id = execution.id(),
                error = %e,
                "Failed to terminate execution"
            ),
        }
    }
    signaled
}
