//! First login to the freshly installed DPU

use crate::error::{PxeError, Result};
use async_trait::async_trait;
use dpu_common::{shell_quote, CommandRunner, SshRunner};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[async_trait]
pub trait PostBootLogin: Send + Sync {
    /// Wait until `address` accepts a login with `key`
    async fn login(&self, address: Ipv4Addr, key: &Path) -> Result<()>;
}

/// Key-based `ssh` login, retried while the installer finishes
pub struct SshLogin {
    runner: Arc<dyn CommandRunner>,
    user: String,
    attempts: u32,
    interval: Duration,
    sync_clock: bool,
}

impl SshLogin {
    pub fn new(runner: Arc<dyn CommandRunner>, user: impl Into<String>) -> Self {
        Self {
            runner,
            user: user.into(),
            attempts: 60,
            interval: Duration::from_secs(10),
            sync_clock: false,
        }
    }

    pub fn with_retries(mut self, attempts: u32, interval: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.interval = interval;
        self
    }

    /// Set the device clock to the local time after login
    pub fn with_clock_sync(mut self, sync: bool) -> Self {
        self.sync_clock = sync;
        self
    }
}

#[async_trait]
impl PostBootLogin for SshLogin {
    async fn login(&self, address: Ipv4Addr, key: &Path) -> Result<()> {
        let ssh = SshRunner::new(format!("{}@{}", self.user, address), self.runner.clone())
            .with_identity(key);

        let mut connected = false;
        for attempt in 1..=self.attempts {
            match ssh.capture("true").await {
                Ok(out) if out.success() => {
                    connected = true;
                    break;
                }
                Ok(out) => debug!(attempt, err = %out.err.trim(), "SSH not ready"),
                Err(e) => warn!(attempt, error = %e, "SSH failed to run"),
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        if !connected {
            return Err(PxeError::Login {
                address: address.to_string(),
                attempts: self.attempts,
            });
        }
        info!(%address, "DPU is up (ssh connection established)");

        if self.sync_clock {
            let date = self.runner.capture("date").await?.out;
            let date = date.trim();
            info!(date, "Setting DPU clock");
            ssh.run(&format!("sudo date -s {}", shell_quote(date))).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dpu_common::{CmdOutput, RecordingRunner};
    use std::sync::Mutex;

    /// Refuses ssh for the first `refusals` tries
    struct BootingHost {
        refusals: u32,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for BootingHost {
        async fn run_with(&self, command: &str, _capture: bool) -> dpu_common::Result<CmdOutput> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(command.to_string());
            let ssh_tries = seen.iter().filter(|c| c.ends_with("'true'")).count() as u32;
            if command.ends_with("'true'") && ssh_tries <= self.refusals {
                return Ok(CmdOutput::failed(255, "Connection refused"));
            }
            if command == "date" {
                return Ok(CmdOutput::ok("Mon Oct 19 10:00:00 UTC 2026\n"));
            }
            Ok(CmdOutput::ok(""))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_ssh_answers() {
        let host = Arc::new(BootingHost {
            refusals: 3,
            seen: Mutex::new(Vec::new()),
        });
        let login = SshLogin::new(host.clone(), "core")
            .with_retries(10, Duration::from_secs(10))
            .with_clock_sync(true);

        let start = tokio::time::Instant::now();
        login
            .login(Ipv4Addr::new(172, 31, 100, 12), Path::new("/keys/id_ed25519"))
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(30));

        let seen = host.seen.lock().unwrap().clone();
        assert!(seen[0].contains("core@172.31.100.12"));
        assert!(seen[0].contains("-i '/keys/id_ed25519'"));
        assert!(seen
            .last()
            .unwrap()
            .contains("sudo date -s '\\''Mon Oct 19 10:00:00 UTC 2026'\\''"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_bound() {
        let runner = Arc::new(RecordingRunner::new().respond("ssh", CmdOutput::failed(255, "No route to host")));
        let login = SshLogin::new(runner.clone(), "core").with_retries(4, Duration::from_secs(10));

        let err = login
            .login(Ipv4Addr::new(172, 31, 100, 12), Path::new("/keys/id"))
            .await
            .unwrap_err();
        assert!(matches!(err, PxeError::Login { attempts: 4, .. }));
        assert_eq!(runner.matching("ssh").len(), 4);
        assert!(runner.matching("date").is_empty());
    }
}
