//! Bookkeeping for one launched child process.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use serde::Serialize;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::time::Instant;

use super::multiplexer::Watched;
use super::output::StreamEvent;

/// Caller-supplied identity of an execution.
pub type ExecutionId = u64;

/// Reported when a child was retired but its exit status could not be collected.
///
/// Never produced by a real exit: exit codes are non-negative and signal
/// numbers are small.
pub const UNKNOWN_RETURNCODE: i32 = i32::MIN;

/// Which of a child's output streams a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// A running child process tracked by the [`Manager`](super::Manager).
///
/// The child leads its own process group, so `pid` doubles as the group id
/// used for forced termination.
#[derive(Debug)]
pub struct Execution {
    id: ExecutionId,
    pid: u32,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    stdout_text: Utf8Decoder,
    stderr_text: Utf8Decoder,
    deadline: Option<Instant>,
    signaled: bool,
    returncode: Option<i32>,
    started_at: Instant,
}

impl Execution {
    /// Wrap a freshly spawned child, taking ownership of its output pipes.
    ///
    /// A zero `timeout` yields a deadline that is already due; one too large
    /// to represent is treated as no deadline.
    pub(crate) fn new(
        id: ExecutionId,
        mut child: Child,
        timeout: Option<Duration>,
    ) -> io::Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("child exited before its pid was recorded"))?;
        let started_at = Instant::now();
        Ok(Self {
            id,
            pid,
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            stdout_text: Utf8Decoder::default(),
            stderr_text: Utf8Decoder::default(),
            deadline: timeout.and_then(|offset| started_at.checked_add(offset)),
            signaled: false,
            returncode: None,
            started_at,
        })
    }

    pub const fn id(&self) -> ExecutionId {
        self.id
    }

    /// Process id of the child, which is also its process group id.
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether a termination signal has already been sent.
    pub const fn is_signaled(&self) -> bool {
        self.signaled
    }

    pub fn run_time(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub const fn streams_closed(&self) -> bool {
        self.stdout.is_none() && self.stderr.is_none()
    }

    /// All output drained, exit status not yet collected.
    pub const fn awaiting_exit(&self) -> bool {
        self.streams_closed() && self.returncode.is_none()
    }

    /// Deadline passed and no signal sent yet.
    pub fn is_due(&self, now: Instant) -> bool {
        !self.signaled && self.deadline.is_some_and(|deadline| deadline <= now)
    }

    pub(crate) const fn mark_signaled(&mut self) {
        self.signaled = true;
    }

    /// Pull the deadline forward to `at`; a deadline already earlier is kept.
    pub(crate) fn expire_at(&mut self, at: Instant) {
        self.deadline = Some(self.deadline.map_or(at, |deadline| deadline.min(at)));
    }

    /// Handles of the streams that are still open, for one readiness wait.
    pub(crate) fn watched(&mut self) -> Vec<Watched<'_>> {
        let mut watched = Vec::with_capacity(2);
        if let Some(stdout) = self.stdout.as_mut() {
            watched.push(Watched {
                execution_id: self.id,
                kind: StreamKind::Stdout,
                reader: stdout,
            });
        }
        if let Some(stderr) = self.stderr.as_mut() {
            watched.push(Watched {
                execution_id: self.id,
                kind: StreamKind::Stderr,
                reader: stderr,
            });
        }
        watched
    }

    /// Decode bytes read from `kind`. `None` while only part of a character
    /// has arrived.
    pub(crate) fn decode(&mut self, kind: StreamKind, bytes: &[u8]) -> Option<String> {
        let text = self.decoder(kind).decode(bytes);
        (!text.is_empty()).then_some(text)
    }

    /// Handle end-of-stream on `kind`.
    ///
    /// Bytes still held by the decoder are flushed as a final chunk and the
    /// handle stays open; the pipe reports end-of-stream again on the next
    /// pass, which then closes it and yields [`StreamEvent::Closed`].
    pub(crate) fn end_of_stream(&mut self, kind: StreamKind) -> StreamEvent {
        if let Some(tail) = self.decoder(kind).finish() {
            return StreamEvent::Chunk(tail);
        }
        match kind {
            StreamKind::Stdout => self.stdout = None,
            StreamKind::Stderr => self.stderr = None,
        }
        StreamEvent::Closed
    }

    pub(crate) const fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Record the final status and return its encoded return code.
    pub(crate) fn record_exit(&mut self, status: ExitStatus) -> i32 {
        let code = returncode_of(status);
        self.returncode = Some(code);
        code
    }

    pub(crate) const fn record_lost_exit(&mut self) -> i32 {
        self.returncode = Some(UNKNOWN_RETURNCODE);
        UNKNOWN_RETURNCODE
    }

    const fn decoder(&mut self, kind: StreamKind) -> &mut Utf8Decoder {
        match kind {
            StreamKind::Stdout => &mut self.stdout_text,
            StreamKind::Stderr => &mut self.stderr_text,
        }
    }
}

/// Exit code for a normal exit, negated signal number for a signaled one.
pub fn returncode_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(UNKNOWN_RETURNCODE)
}

/// Incremental UTF-8 decoder that holds back an incomplete trailing
/// character until the rest of it arrives.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(err) => {
                    let valid_len = err.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid_len]));
                    match err.error_len() {
                        Some(invalid_len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_len + invalid_len);
                        }
                        None => {
                            self.pending.drain(..valid_len);
                            return text;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(tail)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn decoder_passes_ascii_through() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"hi\n"), "hi\n");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn decoder_holds_split_character() {
        let snowman = "☃".as_bytes();
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&snowman[..1]), "");
        assert_eq!(decoder.decode(&snowman[1..]), "☃");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn decoder_flushes_truncated_tail() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"ok\xe2\x98"), "ok");
        assert_eq!(decoder.finish().unwrap(), "\u{FFFD}");
    }

    #[tokio::test]
    async fn truncated_tail_is_flushed_before_close() {
        let child = tokio::process::Command::new("true")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let mut execution = Execution::new(1, child, None).unwrap();

        assert_eq!(
            execution.decode(StreamKind::Stdout, b"ok\xe2\x98"),
            Some("ok".to_string())
        );
        assert_eq!(
            execution.end_of_stream(StreamKind::Stdout),
            StreamEvent::Chunk("\u{FFFD}".to_string())
        );
        assert!(!execution.streams_closed());

        assert_eq!(execution.end_of_stream(StreamKind::Stdout), StreamEvent::Closed);
        assert_eq!(execution.end_of_stream(StreamKind::Stderr), StreamEvent::Closed);
        assert!(execution.awaiting_exit());
        execution.child_mut().wait().await.unwrap();
    }

    #[test]
    fn returncode_encodes_exit_and_signal() {
        // Raw wait statuses: exit code in the high byte, signal in the low bits.
        assert_eq!(returncode_of(ExitStatus::from_raw(0)), 0);
        assert_eq!(returncode_of(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(returncode_of(ExitStatus::from_raw(9)), -9);
        assert_eq!(returncode_of(ExitStatus::from_raw(15)), -15);
    }
}
