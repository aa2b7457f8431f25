//! Execution manager: launches shell commands and multiplexes their output.
//!
//! All work happens synchronously inside [`Manager::start_subprocess`],
//! [`Manager::read_output`] and [`Manager::mark_terminated`]; no task is
//! spawned per child. Callers drive the manager by calling `read_output` in a
//! loop with a finite budget and handling partial batches.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use runnel_core::WorkerConfig;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::deadline::{KillGroup, Terminator, enforce_deadlines};
use super::execution::{Execution, ExecutionId};
use super::multiplexer::{ReadEvent, Readiness, Watched, wait_any, wait_readable};
use super::output::{ExecutionOutput, StreamEvent};

type ExitWait<'a> = Pin<Box<dyn Future<Output = io::Result<ExitStatus>> + Send + 'a>>;

/// Owns every execution that has not been fully retired yet.
///
/// An execution stays in [`running`](Self::running) from
/// [`start_subprocess`](Self::start_subprocess) until its return code has
/// been reported by [`read_output`](Self::read_output).
#[derive(Debug)]
pub struct Manager<T: Terminator = KillGroup> {
    running: HashMap<ExecutionId, Execution>,
    config: WorkerConfig,
    terminator: T,
}

impl Manager {
    /// Create a manager that kills overdue process groups with `SIGKILL`.
    pub fn new(config: WorkerConfig) -> Self {
        Self::with_terminator(config, KillGroup)
    }
}

impl<T: Terminator> Manager<T> {
    /// Create a manager with a custom termination strategy.
    pub fn with_terminator(config: WorkerConfig, terminator: T) -> Self {
        Self {
            running: HashMap::new(),
            config,
            terminator,
        }
    }

    /// Launch `command` through the configured shell in a new process group.
    ///
    /// The child inherits this process's environment extended by
    /// `environment`, gets no stdin, and has stdout and stderr captured. With
    /// a `timeout` the execution is killed once it has run that long; a zero
    /// timeout makes it due immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_subprocess<I, K, V>(
        &mut self,
        execution_id: ExecutionId,
        command: &str,
        environment: I,
        timeout: Option<Duration>,
    ) -> Result<(), ExecutorError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        if self.running.contains_key(&execution_id) {
            return Err(ExecutorError::AlreadyRunning { execution_id });
        }

        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(command)
            .envs(environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let child = cmd
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                execution_id,
                source,
            })?;
        let execution = Execution::new(execution_id, child, timeout).map_err(|source| {
            ExecutorError::Spawn {
                execution_id,
                source,
            }
        })?;

        info!(
            execution_id,
            pid = execution.pid(),
            command,
            timeout = ?timeout,
            "Starting execution"
        );
        self.running.insert(execution_id, execution);
        Ok(())
    }

    /// Run one bounded pass over all executions.
    ///
    /// In order: kill executions whose deadline has passed; wait up to
    /// `timeout` (forever if `None`) for any output stream to become ready and
    /// read once from each ready stream; collect exit statuses of executions
    /// whose streams are all closed; report and retire. The wait is also cut
    /// short when the next pending deadline falls due.
    ///
    /// Returns one [`ExecutionOutput`] per execution that had news this call.
    /// Process-level failures (kill races, lost exit statuses) are absorbed.
    pub async fn read_output(&mut self, timeout: Option<Duration>) -> Vec<ExecutionOutput> {
        let started = Instant::now();
        let mut outputs: HashMap<ExecutionId, ExecutionOutput> = HashMap::new();

        let signaled = enforce_deadlines(self.running.values_mut(), started, &self.terminator);
        if !signaled.is_empty() {
            debug!(?signaled, "Signaled overdue executions");
        }
        let budget = self.cap_to_next_deadline(timeout, started);

        let ready = {
            let mut watched: Vec<Watched<'_>> = self
                .running
                .values_mut()
                .flat_map(Execution::watched)
                .collect();
            wait_readable(&mut watched, budget, self.config.read_chunk_bytes).await
        };

        for Readiness {
            execution_id,
            kind,
            event,
        } in ready
        {
            let Some(execution) = self.running.get_mut(&execution_id) else {
                continue;
            };
            let stream_event = match event {
                ReadEvent::Data(bytes) => execution.decode(kind, &bytes).map(StreamEvent::Chunk),
                ReadEvent::Eof => {
                    let stream_event = execution.end_of_stream(kind);
                    if stream_event == StreamEvent::Closed {
                        debug!(execution_id, stream = ?kind, "Stream closed");
                    }
                    Some(stream_event)
                }
            };
            if let Some(stream_event) = stream_event {
                outputs
                    .entry(execution_id)
                    .or_insert_with(|| ExecutionOutput::new(execution_id))
                    .record(kind, stream_event);
            }
        }

        // Block on exits only when no stream is left to consume the budget.
        let remaining = budget.map(|limit| limit.saturating_sub(started.elapsed()));
        let streams_open = self.running.values().any(|e| !e.streams_closed());
        let exits = if streams_open || remaining.is_some_and(|r| r.is_zero()) {
            self.poll_exits()
        } else {
            self.wait_exits(remaining).await
        };

        for (execution_id, status) in exits {
            let Some(execution) = self.running.get_mut(&execution_id) else {
                continue;
            };
            let returncode = match status {
                Ok(status) => execution.record_exit(status),
                Err(e) => {
                    error!(
                        execution_id,
                        error = %e,
                        "Failed to collect exit status, retiring execution"
                    );
                    execution.record_lost_exit()
                }
            };
            outputs
                .entry(execution_id)
                .or_insert_with(|| ExecutionOutput::new(execution_id))
                .returncode = Some(returncode);
        }

        for output in outputs.values() {
            let Some(returncode) = output.returncode else {
                continue;
            };
            if let Some(execution) = self.running.remove(&output.execution_id) {
                let run_time_ms =
                    u64::try_from(execution.run_time().as_millis()).unwrap_or(u64::MAX);
                info!(
                    execution_id = output.execution_id,
                    returncode,
                    signaled = execution.is_signaled(),
                    run_time_ms,
                    "Execution exited"
                );
            }
        }

        outputs
            .into_values()
            .filter(|output| !output.is_empty())
            .collect()
    }

    /// Request early termination of the given executions.
    ///
    /// Only moves their deadlines to now; the signal is sent by the next
    /// [`read_output`](Self::read_output). Unknown ids are ignored, and
    /// repeating a request changes nothing.
    pub fn mark_terminated(&mut self, execution_ids: impl IntoIterator<Item = ExecutionId>) {
        let now = Instant::now();
        for execution_id in execution_ids {
            match self.running.get_mut(&execution_id) {
                Some(execution) => {
                    execution.expire_at(now);
                    debug!(execution_id, "Execution marked for termination");
                }
                None => info!(
                    execution_id,
                    "Execution is not running, ignoring termination request"
                ),
            }
        }
    }

    /// Mark every running execution for termination.
    pub fn terminate_all(&mut self) {
        let ids = self.running_ids();
        self.mark_terminated(ids);
    }

    /// Executions not yet retired, keyed by id.
    pub const fn running(&self) -> &HashMap<ExecutionId, Execution> {
        &self.running
    }

    pub fn running_ids(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<ExecutionId> = self.running.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_empty()
    }

    fn cap_to_next_deadline(&self, timeout: Option<Duration>, now: Instant) -> Option<Duration> {
        let next_due = self
            .running
            .values()
            .filter(|e| !e.is_signaled())
            .filter_map(Execution::deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now));
        match (timeout, next_due) {
            (Some(limit), Some(due)) => Some(limit.min(due)),
            (limit, due) => limit.or(due),
        }
    }

    fn poll_exits(&mut self) -> Vec<(ExecutionId, io::Result<ExitStatus>)> {
        self.running
            .values_mut()
            .filter(|e| e.awaiting_exit())
            .filter_map(|e| match e.child_mut().try_wait() {
                Ok(Some(status)) => Some((e.id(), Ok(status))),
                Ok(None) => None,
                Err(err) => Some((e.id(), Err(err))),
            })
            .collect()
    }

    async fn wait_exits(
        &mut self,
        budget: Option<Duration>,
    ) -> Vec<(ExecutionId, io::Result<ExitStatus>)> {
        let mut waits: Vec<(ExecutionId, ExitWait<'_>)> = self
            .running
            .values_mut()
            .filter(|e| e.awaiting_exit())
            .map(|e| {
                let id = e.id();
                let wait: ExitWait<'_> = Box::pin(e.child_mut().wait());
                (id, wait)
            })
            .collect();
        wait_any(&mut waits, budget, |(id, wait), cx| {
            wait.as_mut().poll(cx).map(|status| (*id, status))
        })
        .await
    }
}

impl<T: Terminator> Drop for Manager<T> {
    fn drop(&mut self) {
        for execution in self.running.values().filter(|e| !e.is_signaled()) {
            if self.terminator.terminate_group(execution.pid()).is_ok() {
                warn!(
                    execution_id = execution.id(),
                    "Killed execution still running when its manager was dropped"
                );
            }
        }
    }
}

/// Errors from execution manager operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Execution {execution_id} is already running")]
    AlreadyRunning { execution_id: ExecutionId },

    #[error("Failed to start execution {execution_id}: {source}")]
    Spawn {
        execution_id: ExecutionId,
        source: io::Error,
    },
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn no_env() -> [(&'static str, &'static str); 0] {
        []
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let mut manager = Manager::new(WorkerConfig::default());
        manager
            .start_subprocess(1, "sleep 5", no_env(), None)
            .unwrap();

        let err = manager
            .start_subprocess(1, "true", no_env(), None)
            .unwrap_err();
        assert!(matches!(err, ExecutorError::AlreadyRunning { execution_id: 1 }));
        assert_eq!(manager.running_ids(), vec![1]);
    }

    #[tokio::test]
    async fn unlaunchable_shell_is_spawn_error() {
        let config = WorkerConfig {
            shell: "/nonexistent/runnel-shell".into(),
            ..WorkerConfig::default()
        };
        let mut manager = Manager::new(config);

        let err = manager
            .start_subprocess(9, "true", no_env(), None)
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { execution_id: 9, .. }));
        assert!(manager.is_idle());
    }

    #[tokio::test]
    async fn mark_terminated_sets_due_deadline() {
        let mut manager = Manager::new(WorkerConfig::default());
        manager
            .start_subprocess(1, "sleep 5", no_env(), None)
            .unwrap();
        assert!(manager.running()[&1].deadline().is_none());

        manager.mark_terminated([1, 2]);
        let first = manager.running()[&1].deadline().unwrap();
        assert!(first <= Instant::now());

        manager.mark_terminated([1]);
        assert_eq!(manager.running()[&1].deadline(), Some(first));
        assert!(!manager.running()[&1].is_signaled());
    }

    #[tokio::test]
    async fn deadline_caps_unbounded_wait() {
        let mut manager = Manager::new(WorkerConfig::default());
        manager
            .start_subprocess(1, "sleep 5", no_env(), Some(Duration::from_millis(200)))
            .unwrap();

        // Returns once the deadline falls due instead of blocking on the sleep.
        let started = std::time::Instant::now();
        let batch = manager.read_output(None).await;
        assert!(batch.is_empty());
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!manager.running()[&1].is_signaled());
    }

    #[tokio::test]
    async fn empty_manager_returns_empty_batch() {
        let mut manager = Manager::new(WorkerConfig::default());
        assert!(manager.read_output(None).await.is_empty());
    }
}
