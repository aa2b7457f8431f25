//! runnel Worker Library
//!
//! Execution core of a workflow worker:
//! - Launches shell commands in their own process groups
//! - Streams stdout/stderr back incrementally from one polling loop
//! - Force-kills executions that outlive their deadline
//! - Reports exit status once available

pub mod executor;
