use std::{io::ErrorKind, path::Path, process::Stdio};

use tokio::process::Command;
use tracing::{debug, trace};

use super::AdapterError;

/// Captured output of a finished tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Last non-empty stderr line, which is where both wrapped tools put their fatal error.
    pub fn error_summary(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("no diagnostic output")
            .to_string()
    }
}

/// Spawn `program` and wait for it to exit.
///
/// The child is killed if the returned future is dropped, so wrapping this in a
/// timeout or aborting the owning task cancels the process too.
pub async fn run_tool(program: &str, args: &[String]) -> Result<ToolOutput, AdapterError> {
    debug!(program, ?args, "invoking tool");
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| spawn_error(program, err))?;

    let output = child
        .wait_with_output()
        .await
        .map_err(|err| AdapterError::InvocationFailed {
            program: program.to_string(),
            status: None,
            message: format!("failed to wait for process: {err}"),
        })?;

    let status = output.status.code();
    trace!(program, ?status, stdout_len = output.stdout.len(), "tool exited");
    Ok(ToolOutput {
        status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn spawn_error(program: &str, err: std::io::Error) -> AdapterError {
    if err.kind() == ErrorKind::NotFound {
        AdapterError::ToolNotFound {
            program: program.to_string(),
        }
    } else {
        AdapterError::InvocationFailed {
            program: program.to_string(),
            status: None,
            message: format!("failed to spawn: {err}"),
        }
    }
}

/// How an adapter obtains its tool's report: run the tool, or replay a saved file.
#[derive(Debug, Clone)]
pub struct ToolInvocation<'a> {
    pub program: &'a str,
    pub args: Vec<String>,
    /// Exit codes that still carry a usable report.
    pub accepted_status: &'a [i32],
    pub replay: Option<&'a Path>,
    pub raw_output: Option<&'a Path>,
}

impl ToolInvocation<'_> {
    /// Produce the raw report text, saving it (or the failure diagnostics) for audit.
    pub async fn report(self) -> Result<String, AdapterError> {
        if let Some(path) = self.replay {
            debug!(program = self.program, path = %path.display(), "replaying saved report");
            let raw = read_replay(self.program, path).await?;
            self.save(&raw).await;
            return Ok(raw);
        }

        let output = run_tool(self.program, &self.args).await?;
        let accepted = output
            .status
            .is_some_and(|code| self.accepted_status.contains(&code));
        // Blank stdout from a live run means no report was produced.
        let blank = output.stdout.trim().is_empty();
        if !accepted || (blank && !output.success()) {
            self.save(&output.stderr).await;
            return Err(AdapterError::InvocationFailed {
                program: self.program.to_string(),
                status: output.status,
                message: output.error_summary(),
            });
        }
        if blank {
            self.save(&output.stderr).await;
            return Err(AdapterError::ParseError {
                program: self.program.to_string(),
                parsed: 0,
                message: "tool exited successfully but printed no report".to_string(),
            });
        }
        self.save(&output.stdout).await;
        Ok(output.stdout)
    }

    async fn save(&self, contents: &str) {
        if let Some(path) = self.raw_output {
            write_raw_output(path, contents).await;
        }
    }
}

/// Read a previously generated tool report instead of invoking the tool.
pub async fn read_replay(program: &str, path: &Path) -> Result<String, AdapterError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|err| AdapterError::InvocationFailed {
            program: program.to_string(),
            status: None,
            message: format!("failed to read report {}: {err}", path.display()),
        })
}

/// Persist raw tool output for audit. Failure to write is logged, never fatal.
pub async fn write_raw_output(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        if let Err(err) = tokio::fs::create_dir_all(parent).await {
            tracing::warn!(path = %parent.display(), error = %err, "failed to create raw report directory");
            return;
        }
    }
    if let Err(err) = tokio::fs::write(path, contents).await {
        tracing::warn!(path = %path.display(), error = %err, "failed to write raw tool output");
    }
}
