//! Shell command execution
//!
//! Vendor tools (mstflint, mstconfig, lshw), host networking (`ip`, `mount`)
//! and daemon housekeeping (`killall`) all run through [`CommandRunner`].
//! Output is streamed line by line into the debug log while the command runs;
//! stdout and stderr are drained by two concurrent readers so neither pipe
//! can fill up and stall the child.

use crate::error::{CmdError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

/// Captured result of one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub out: String,
    pub err: String,
    pub code: i32,
}

impl CmdOutput {
    /// Successful result with the given stdout
    pub fn ok(out: impl Into<String>) -> Self {
        Self {
            out: out.into(),
            err: String::new(),
            code: 0,
        }
    }

    /// Failed result with the given exit code and stderr
    pub fn failed(code: i32, err: impl Into<String>) -> Self {
        Self {
            out: String::new(),
            err: err.into(),
            code,
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Turn a non-zero exit into [`CmdError::Failed`]
    pub fn check(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(CmdError::Failed {
                command: command.to_string(),
                code: self.code,
                stderr: self.err.trim().to_string(),
            })
        }
    }
}

/// Something that can run a shell command line
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command`, keeping its output in the result only if `capture` is set
    async fn run_with(&self, command: &str, capture: bool) -> Result<CmdOutput>;

    /// Run without keeping output (it still goes to the debug log)
    async fn run(&self, command: &str) -> Result<CmdOutput> {
        self.run_with(command, false).await
    }

    /// Run and keep stdout/stderr
    async fn capture(&self, command: &str) -> Result<CmdOutput> {
        self.run_with(command, true).await
    }

    /// Run, capture, and fail on a non-zero exit code
    async fn checked(&self, command: &str) -> Result<CmdOutput> {
        self.capture(command).await?.check(command)
    }

    /// Whether commands are only being logged
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Runs commands through `sh -c` on the local host
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    dry_run: bool,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log commands instead of executing them
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run_with(&self, command: &str, capture: bool) -> Result<CmdOutput> {
        if self.dry_run {
            info!("[DRY RUN] Command: {}", command);
            return Ok(CmdOutput::default());
        }

        debug!(command = %command, "Executing");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CmdError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CmdError::Reader("stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CmdError::Reader("stderr not piped".to_string()))?;

        let stdout_task = tokio::spawn(stream_output(stdout, capture));
        let stderr_task = tokio::spawn(stream_output(stderr, capture));

        let status = child.wait().await?;
        let out = stdout_task
            .await
            .map_err(|e| CmdError::Reader(e.to_string()))??;
        let err = stderr_task
            .await
            .map_err(|e| CmdError::Reader(e.to_string()))??;

        Ok(CmdOutput {
            out,
            err,
            // Killed by a signal: no exit code
            code: status.code().unwrap_or(-1),
        })
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

/// Drain one pipe, logging each line and optionally keeping it
async fn stream_output<R: AsyncRead + Unpin>(pipe: R, capture: bool) -> Result<String> {
    let mut reader = BufReader::new(pipe);
    let mut captured = String::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        debug!("{}", text.trim_end());
        if capture {
            captured.push_str(&text);
        }
    }

    Ok(captured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingRunner;

    #[tokio::test]
    async fn test_dry_run_returns_synthetic_success() {
        let runner = ShellRunner::new().with_dry_run(true);
        let result = runner.capture("false").await.unwrap();
        assert_eq!(result, CmdOutput::default());
        assert!(runner.is_dry_run());
    }

    #[tokio::test]
    async fn test_capture_both_streams() {
        let runner = ShellRunner::new();
        let result = runner
            .capture("echo hello; echo oops 1>&2; exit 3")
            .await
            .unwrap();
        assert_eq!(result.out, "hello\n");
        assert_eq!(result.err, "oops\n");
        assert_eq!(result.code, 3);
    }

    #[tokio::test]
    async fn test_run_without_capture_keeps_code_only() {
        let runner = ShellRunner::new();
        let result = runner.run("echo hidden").await.unwrap();
        assert!(result.out.is_empty());
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_checked_fails_on_nonzero() {
        let runner = ShellRunner::new();
        let err = runner.checked("echo bad 1>&2; exit 2").await.unwrap_err();
        match err {
            CmdError::Failed { code, stderr, .. } => {
                assert_eq!(code, 2);
                assert_eq!(stderr, "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_recording_runner() {
        let runner = RecordingRunner::new()
            .respond("lshw", CmdOutput::ok("pci@0000:03:00.0"))
            .respond("ping", CmdOutput::failed(1, ""));

        assert_eq!(
            runner.capture("lshw -c network -businfo").await.unwrap().out,
            "pci@0000:03:00.0"
        );
        assert!(!runner.run("ping -c 1 10.0.0.1").await.unwrap().success());
        assert!(runner.run("ip a f eth0").await.unwrap().success());
        assert_eq!(runner.history().len(), 3);
        assert_eq!(runner.matching("ping").len(), 1);
    }
}
