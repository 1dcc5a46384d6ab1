//! Remote command execution over `ssh`
//!
//! The IPU management complex and freshly provisioned BlueField hosts are
//! driven with plain `ssh`/`scp`. Host keys change on every reflash, so
//! host key checking is always disabled.

use crate::cmd::{CmdOutput, CommandRunner};
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SSH_OPTIONS: &str = "-o 'StrictHostKeyChecking=no' -o 'UserKnownHostsFile=/dev/null'";

/// Quote a string for safe inclusion in a POSIX shell command line
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Runs commands on a remote host through a local runner
#[derive(Clone)]
pub struct SshRunner {
    target: String,
    identity: Option<PathBuf>,
    local: Arc<dyn CommandRunner>,
}

impl SshRunner {
    /// `target` is `host` or `user@host`
    pub fn new(target: impl Into<String>, local: Arc<dyn CommandRunner>) -> Self {
        Self {
            target: target.into(),
            identity: None,
            local,
        }
    }

    /// Authenticate with a specific private key
    pub fn with_identity(mut self, key: impl Into<PathBuf>) -> Self {
        self.identity = Some(key.into());
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn options(&self) -> String {
        match &self.identity {
            Some(key) => format!(
                "{} -o 'BatchMode=yes' -i {}",
                SSH_OPTIONS,
                shell_quote(&key.display().to_string())
            ),
            None => SSH_OPTIONS.to_string(),
        }
    }

    /// Full local command line that runs `command` on the target
    pub fn ssh_command(&self, command: &str) -> String {
        format!(
            "ssh {} {} {}",
            self.options(),
            self.target,
            shell_quote(command)
        )
    }

    /// Copy a local file to `remote_path` on the target
    pub async fn copy_to(&self, local: &Path, remote_path: &str) -> Result<CmdOutput> {
        let command = format!(
            "scp {} {} {}:{}",
            self.options(),
            shell_quote(&local.display().to_string()),
            self.target,
            remote_path
        );
        self.local.capture(&command).await
    }

    /// Stream a local file into a remote command's stdin (e.g. `dd of=...`)
    pub async fn pipe_file(&self, local: &Path, remote_command: &str) -> Result<CmdOutput> {
        let command = format!(
            "dd bs=16M if={} | {}",
            shell_quote(&local.display().to_string()),
            self.ssh_command(remote_command)
        );
        self.local.capture(&command).await
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run_with(&self, command: &str, capture: bool) -> Result<CmdOutput> {
        self.local
            .run_with(&self.ssh_command(command), capture)
            .await
    }

    fn is_dry_run(&self) -> bool {
        self.local.is_dry_run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingRunner;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("cat /etc/issue.net"), "'cat /etc/issue.net'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_ssh_wraps_command() {
        let local = Arc::new(RecordingRunner::new());
        let ssh = SshRunner::new("root@imc", local.clone());

        ssh.run("sync ; sync").await.unwrap();

        let history = local.history();
        assert_eq!(history.len(), 1);
        assert!(history[0].starts_with("ssh -o 'StrictHostKeyChecking=no'"));
        assert!(history[0].ends_with("root@imc 'sync ; sync'"));
    }

    #[tokio::test]
    async fn test_identity_and_pipe() {
        let local = Arc::new(RecordingRunner::new());
        let ssh = SshRunner::new("core@10.0.0.5", local.clone()).with_identity("/root/.ssh/id");

        ssh.pipe_file(Path::new("/tmp/ssd.bin"), "dd bs=16M of=/dev/nvme0n1")
            .await
            .unwrap();

        let cmd = &local.history()[0];
        assert!(cmd.starts_with("dd bs=16M if='/tmp/ssd.bin' | ssh"));
        assert!(cmd.contains("-i '/root/.ssh/id'"));
        assert!(cmd.contains("BatchMode=yes"));
    }
}
