//! The DHCP, TFTP and HTTP services a network boot needs

use crate::config::PxeConfig;
use crate::error::Result;
use async_trait::async_trait;
use dpu_common::CommandRunner;
use dpu_services::{serve_static, ServiceRegistry, StaticHttpConfig};
use std::sync::Arc;
use tracing::{info, warn};

/// Starts the boot services for one attempt into its registry
#[async_trait]
pub trait ServiceLauncher: Send + Sync {
    async fn start(&self, registry: &mut ServiceRegistry) -> Result<()>;
}

/// ISC dhcpd, tftp-hpa and the built-in HTTP file server
pub struct PxeServices {
    config: Arc<PxeConfig>,
    runner: Arc<dyn CommandRunner>,
}

impl PxeServices {
    pub fn new(config: Arc<PxeConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    /// Kill a stale copy of a daemon; it is fine if none is running
    async fn kill_stale(&self, process: &str) {
        if let Err(e) = self.runner.run(&format!("killall {}", process)).await {
            warn!(process, error = %e, "killall failed");
        }
    }

    fn spawn_daemon(&self, registry: &mut ServiceRegistry, name: &str, program: &str, args: &[&str]) {
        if self.runner.is_dry_run() {
            info!("[DRY RUN] Start {}: {} {}", name, program, args.join(" "));
            return;
        }
        if let Err(e) = registry.spawn_command(name, program, args) {
            warn!(service = name, error = %e, "Failed to start service");
        }
    }

    async fn start_http(&self, registry: &mut ServiceRegistry) {
        let http = StaticHttpConfig::default()
            .with_root(&self.config.paths.www_root)
            .with_bind(self.config.http_bind);
        if self.runner.is_dry_run() {
            info!("[DRY RUN] Serve {} on {}", http.root.display(), http.bind);
            return;
        }

        match http.bind().await {
            Ok(listener) => {
                let root = http.root.clone();
                registry.spawn_task("http", move |stop| async move {
                    if let Err(e) = serve_static(listener, root, stop).await {
                        warn!(error = %e, "HTTP server failed");
                    }
                });
            }
            Err(e) => warn!(error = %e, "Failed to start HTTP server"),
        }
    }
}

#[async_trait]
impl ServiceLauncher for PxeServices {
    async fn start(&self, registry: &mut ServiceRegistry) -> Result<()> {
        info!("Starting dhcpd");
        self.kill_stale("dhcpd").await;
        let paths = &self.config.paths;
        let conf = paths.dhcpd_conf.display().to_string();
        self.spawn_daemon(
            registry,
            "dhcpd",
            &paths.dhcpd_bin.display().to_string(),
            &["-f", "-cf", &conf, "-user", "dhcpd", "-group", "dhcpd"],
        );

        info!("Starting HTTP server");
        self.start_http(registry).await;

        info!("Starting in.tftpd");
        self.kill_stale("in.tftpd").await;
        let tftp_root = paths.tftp_root.display().to_string();
        self.spawn_daemon(
            registry,
            "tftpd",
            &paths.tftpd_bin.display().to_string(),
            &["-s", "-L", &tftp_root],
        );

        info!(services = ?registry.names(), "Services started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PxePaths;
    use dpu_common::{RecordingRunner, ShellRunner};
    use std::net::{Ipv4Addr, SocketAddr};

    fn config(root: &std::path::Path) -> PxeConfig {
        let mut config = PxeConfig::new(0, "x.iso").with_paths(PxePaths {
            www_root: root.to_path_buf(),
            tftp_root: root.to_path_buf(),
            dhcpd_conf: root.join("dhcpd.conf"),
            dhcpd_bin: root.join("no-dhcpd"),
            tftpd_bin: root.join("no-tftpd"),
            ..PxePaths::default()
        });
        config.http_bind = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        config
    }

    #[tokio::test]
    async fn test_missing_daemons_do_not_stop_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let services = PxeServices::new(Arc::new(config(dir.path())), runner.clone());

        let mut registry = ServiceRegistry::new();
        services.start(&mut registry).await.unwrap();

        assert_eq!(runner.history(), vec!["killall dhcpd", "killall in.tftpd"]);
        assert_eq!(registry.names(), vec!["http"]);

        registry.terminate_all().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ShellRunner::new().with_dry_run(true));
        let services = PxeServices::new(Arc::new(config(dir.path())), runner);

        let mut registry = ServiceRegistry::new();
        services.start(&mut registry).await.unwrap();
        assert!(registry.is_empty());
    }
}
