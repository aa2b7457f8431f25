//! runnel Worker
//!
//! Runs shell commands concurrently under one execution manager and prints
//! every batch of output as NDJSON on stdout. Logs go to stderr.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use runnel_worker::executor::{ExecutionId, ExecutionOutput, Manager};

#[derive(Parser, Debug)]
#[command(name = "runnel-worker")]
#[command(version, about = "runnel worker - run shell commands and stream their output")]
struct Args {
    /// Shell commands to run; each becomes one execution, numbered from 1
    #[arg(required = true)]
    commands: Vec<String>,

    /// Kill any execution still running after this many seconds
    #[arg(long, env = "RUNNEL_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Extra environment variable for every execution (KEY=VALUE, repeatable)
    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,

    /// Path to a JSON settings file
    #[arg(long, env = "RUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "RUNNEL_LOG_JSON")]
    log_json: bool,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))
}

fn emit(output: &ExecutionOutput) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, output)?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let config = runnel_core::config::load_config(args.config.as_deref())?;
    let log_filter = format!("runnel_worker={}", config.worker.log_level);
    runnel_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        executions = args.commands.len(),
        timeout_secs = ?args.timeout_secs,
        "Starting runnel-worker"
    );

    let poll_interval = config.worker.poll_interval();
    let timeout = args.timeout_secs.map(Duration::from_secs);
    let mut manager = Manager::new(config.worker);
    for (execution_id, command) in (1..).zip(&args.commands) {
        manager.start_subprocess(execution_id, command, args.env.iter().cloned(), timeout)?;
    }

    // Ctrl-C only raises a flag; the loop turns it into termination requests.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::SeqCst);
            }
        });
    }

    let mut failed: Vec<ExecutionId> = Vec::new();
    while !manager.is_idle() {
        if interrupted.swap(false, Ordering::SeqCst) {
            warn!(
                running = manager.running().len(),
                "Interrupted, terminating running executions"
            );
            manager.terminate_all();
        }
        for output in manager.read_output(Some(poll_interval)).await {
            if output.returncode.is_some_and(|code| code != 0) {
                failed.push(output.execution_id);
            }
            emit(&output)?;
        }
    }

    if failed.is_empty() {
        info!("All executions succeeded");
        Ok(ExitCode::SUCCESS)
    } else {
        failed.sort_unstable();
        warn!(failed = ?failed, "Some executions failed");
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn env_pair_splits_on_first_equals() {
        assert_eq!(
            parse_env_pair("URL=http://x?a=b").unwrap(),
            ("URL".to_string(), "http://x?a=b".to_string())
        );
        assert_eq!(parse_env_pair("EMPTY=").unwrap().1, "");
    }

    #[test]
    fn env_pair_rejects_missing_key() {
        assert!(parse_env_pair("novalue").is_err());
        assert!(parse_env_pair("=value").is_err());
    }

    #[test]
    fn args_parse_commands_and_env() {
        let args = Args::try_parse_from([
            "runnel-worker",
            "--timeout-secs",
            "5",
            "--env",
            "A=1",
            "echo hi",
            "sleep 1",
        ])
        .unwrap();
        assert_eq!(args.commands, vec!["echo hi", "sleep 1"]);
        assert_eq!(args.timeout_secs, Some(5));
        assert_eq!(args.env, vec![("A".to_string(), "1".to_string())]);
    }
}
