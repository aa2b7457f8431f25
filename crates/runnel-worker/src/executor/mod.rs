//! Execution multiplexer for shell commands.

pub mod deadline;
pub mod execution;
pub mod manager;
pub mod multiplexer;
pub mod output;

pub use deadline::{KillGroup, TerminateError, Terminator};
pub use execution::{Execution, ExecutionId, StreamKind, UNKNOWN_RETURNCODE};
pub use manager::{ExecutorError, Manager};
pub use output::{ExecutionOutput, StreamEvent};
