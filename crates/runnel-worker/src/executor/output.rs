//! Per-call results reported by [`Manager::read_output`](super::Manager::read_output).

use serde::Serialize;

use super::execution::{ExecutionId, StreamKind};

/// What happened on one output stream during a single `read_output` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEvent {
    /// Newly read text.
    Chunk(String),
    /// End of stream; nothing further will be reported for it.
    Closed,
}

/// New information about one execution, gathered by one `read_output` call.
///
/// A `None` field means "nothing new this call". At least one field is
/// always set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionOutput {
    pub execution_id: ExecutionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<StreamEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<StreamEvent>,
    /// Set only on the call in which the exit status first became available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,
}

impl ExecutionOutput {
    pub const fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            stdout: None,
            stderr: None,
            returncode: None,
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.stdout.is_none() && self.stderr.is_none() && self.returncode.is_none()
    }

    pub fn stdout_chunk(&self) -> Option<&str> {
        chunk_text(self.stdout.as_ref())
    }

    pub fn stderr_chunk(&self) -> Option<&str> {
        chunk_text(self.stderr.as_ref())
    }

    pub(crate) fn record(&mut self, kind: StreamKind, event: StreamEvent) {
        match kind {
            StreamKind::Stdout => self.stdout = Some(event),
            StreamKind::Stderr => self.stderr = Some(event),
        }
    }
}

fn chunk_text(event: Option<&StreamEvent>) -> Option<&str> {
    match event {
        Some(StreamEvent::Chunk(text)) => Some(text),
        Some(StreamEvent::Closed) | None => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_output_is_empty() {
        let output = ExecutionOutput::new(7);
        assert!(output.is_empty());
        assert!(output.stdout_chunk().is_none());
    }

    #[test]
    fn closed_marker_has_no_chunk() {
        let mut output = ExecutionOutput::new(1);
        output.record(StreamKind::Stderr, StreamEvent::Closed);
        assert!(!output.is_empty());
        assert_eq!(output.stderr, Some(StreamEvent::Closed));
        assert!(output.stderr_chunk().is_none());
    }

    #[test]
    fn serializes_only_present_fields() {
        let mut output = ExecutionOutput::new(3);
        output.record(StreamKind::Stdout, StreamEvent::Chunk("hi\n".into()));
        output.record(StreamKind::Stderr, StreamEvent::Closed);

        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "execution_id": 3,
                "stdout": {"chunk": "hi\n"},
                "stderr": "closed",
            })
        );
    }
}
