//! Subprocess Execution
//!
//! The real [`CommandRunner`] implementation over `tokio::process`.
//! Every invocation carries an explicit timeout; a timed-out process is
//! killed and reported in the result rather than as an error, so callers
//! can treat it as a check failure instead of an internal fault.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::types::{CommandRunner, ExecResult};

/// Exit code reported when the timeout fired.
const TIMEOUT_EXIT_CODE: i32 = -1;

/// Runs commands locally with `tokio::process::Command`.
pub struct LocalRunner;

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        cwd: &str,
        timeout_ms: u64,
    ) -> Result<ExecResult> {
        debug!("exec: {} {:?} (cwd={}, timeout={}ms)", program, args, cwd, timeout_ms);

        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;

        let waited =
            tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait_with_output())
                .await;

        match waited {
            Ok(output) => {
                let output = output.with_context(|| format!("Failed to run {}", program))?;
                Ok(ExecResult {
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    exit_code: output.status.code().unwrap_or(-1),
                    timed_out: false,
                })
            }
            Err(_) => {
                // kill_on_drop reaps the child once the future is dropped.
                Ok(ExecResult {
                    stdout: String::new(),
                    stderr: format!("{} timed out after {}ms", program, timeout_ms),
                    exit_code: TIMEOUT_EXIT_CODE,
                    timed_out: true,
                })
            }
        }
    }
}
