//! The PXE boot attempt loop
//!
//! One [`PxeBoot::run`] validates its inputs, takes the instance lock and
//! then makes up to `max_attempts` boot attempts. Each attempt stages the
//! media, resets the DPU, brings up the boot services, walks the firmware
//! menu and waits for the installed system to show up on the network. The
//! services of an attempt live in their own [`ServiceRegistry`] and are torn
//! down when the attempt ends, whatever the outcome.

use crate::config::PxeConfig;
use crate::error::{PxeError, Result};
use crate::host::{is_remote_source, IsoStager, MediaStager};
use crate::lock::InstanceLock;
use crate::login::{PostBootLogin, SshLogin};
use crate::ping::{wait_any_ping, IcmpPinger, Pinger};
use crate::services::{PxeServices, ServiceLauncher};
use dpu_common::CommandRunner;
use dpu_console::{
    ConsoleCapture, ConsoleConnector, ConsoleDevice, MenuNavigator, MenuProfile, MinicomConnector,
};
use dpu_hw::discovery::select_bluefield;
use dpu_hw::{DeviceReset, RshimReset};
use dpu_services::ServiceRegistry;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How far an attempt got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Init,
    ServicesUp,
    MenuNavigated,
    NetworkDetected,
    LoggedIn,
    TornDown,
    Failed,
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptPhase::Init => "init",
            AttemptPhase::ServicesUp => "services-up",
            AttemptPhase::MenuNavigated => "menu-navigated",
            AttemptPhase::NetworkDetected => "network-detected",
            AttemptPhase::LoggedIn => "logged-in",
            AttemptPhase::TornDown => "torn-down",
            AttemptPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State of a single attempt
pub struct BootAttempt {
    pub number: u32,
    pub phase: AttemptPhase,
    pub services: ServiceRegistry,
    pub address: Option<Ipv4Addr>,
}

impl BootAttempt {
    fn new(number: u32) -> Self {
        Self {
            number,
            phase: AttemptPhase::Init,
            services: ServiceRegistry::new(),
            address: None,
        }
    }

    fn advance(&mut self, phase: AttemptPhase) {
        info!(attempt = self.number, from = %self.phase, to = %phase, "Boot attempt progressed");
        self.phase = phase;
    }
}

/// How a successful run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// The DPU booted and answered at this address
    Booted(Ipv4Addr),
    /// Services were held up in manual mode until shutdown
    ManualStopped,
}

pub struct PxeBoot {
    config: Arc<PxeConfig>,
    runner: Arc<dyn CommandRunner>,
    stager: Arc<dyn MediaStager>,
    reset: Arc<dyn DeviceReset>,
    services: Arc<dyn ServiceLauncher>,
    console: Arc<dyn ConsoleConnector>,
    pinger: Arc<dyn Pinger>,
    login: Arc<dyn PostBootLogin>,
    navigator: MenuNavigator,
    shutdown: watch::Receiver<bool>,
}

impl PxeBoot {
    /// Controller wired to the real host: rshim reset and console, ISC
    /// dhcpd, tftp-hpa, ICMP pings and `ssh`
    pub fn new(
        config: PxeConfig,
        runner: Arc<dyn CommandRunner>,
        profile: MenuProfile,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let id = config.device_id;
        let login = SshLogin::new(runner.clone(), config.login_user.clone())
            .with_retries(config.login_attempts, config.login_interval)
            .with_clock_sync(config.sync_clock);

        Ok(Self {
            stager: Arc::new(IsoStager::new(config.clone(), runner.clone())),
            reset: Arc::new(RshimReset::new(id)),
            services: Arc::new(PxeServices::new(config.clone(), runner.clone())),
            console: Arc::new(MinicomConnector::new(ConsoleDevice::rshim(id), runner.clone())),
            pinger: Arc::new(IcmpPinger::new(runner.clone())),
            login: Arc::new(login),
            navigator: MenuNavigator::new(profile).map_err(|e| PxeError::Validation(e.to_string()))?,
            config,
            runner,
            shutdown,
        })
    }

    pub fn with_stager(mut self, stager: Arc<dyn MediaStager>) -> Self {
        self.stager = stager;
        self
    }

    pub fn with_reset(mut self, reset: Arc<dyn DeviceReset>) -> Self {
        self.reset = reset;
        self
    }

    pub fn with_services(mut self, services: Arc<dyn ServiceLauncher>) -> Self {
        self.services = services;
        self
    }

    pub fn with_console(mut self, console: Arc<dyn ConsoleConnector>) -> Self {
        self.console = console;
        self
    }

    pub fn with_pinger(mut self, pinger: Arc<dyn Pinger>) -> Self {
        self.pinger = pinger;
        self
    }

    pub fn with_login(mut self, login: Arc<dyn PostBootLogin>) -> Self {
        self.login = login;
        self
    }

    pub fn config(&self) -> &PxeConfig {
        &self.config
    }

    /// Check inputs and hardware before anything on the host is touched
    pub async fn validate(&self) -> Result<()> {
        let iso = &self.config.iso;
        if !is_remote_source(iso) && !Path::new(iso).exists() {
            return Err(PxeError::Validation(format!("ISO {} not found", iso)));
        }
        if let Some(key) = &self.config.key {
            if !is_remote_source(key) && !Path::new(key).is_file() {
                return Err(PxeError::Validation(format!("SSH key {} not found", key)));
            }
        }
        let pci = select_bluefield(self.runner.as_ref(), self.config.device_id).await?;
        info!(id = self.config.device_id, pci, "Using BlueField");
        Ok(())
    }

    /// Validate, take the instance lock and boot, retrying failed attempts
    pub async fn run(&self) -> Result<BootOutcome> {
        self.validate().await?;
        let _lock = InstanceLock::acquire(&self.config.paths.lock_file).await?;

        let max = self.config.max_attempts.max(1);
        let mut last_err = None;
        for number in 1..=max {
            info!(attempt = number, max, "Starting PXE boot attempt");
            let mut attempt = BootAttempt::new(number);

            let result = {
                let mut shutdown = self.shutdown.clone();
                tokio::select! {
                    biased;
                    result = self.try_attempt(&mut attempt) => result,
                    _ = shutdown_requested(&mut shutdown) => Err(PxeError::Interrupted),
                }
            };

            if result.is_err() {
                attempt.advance(AttemptPhase::Failed);
            }
            let report = attempt.services.terminate_all().await;
            attempt.advance(AttemptPhase::TornDown);
            info!(attempt = number, stopped = report.total(), "Services torn down");

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(attempt = number, error = %e, "PXE boot attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(PxeError::RetriesExhausted {
            attempts: max,
            last: Box::new(last_err.unwrap_or(PxeError::Interrupted)),
        })
    }

    async fn try_attempt(&self, attempt: &mut BootAttempt) -> Result<BootOutcome> {
        let media = self.stager.stage().await?;
        info!(flavor = %media.flavor, "Boot media staged");

        if self.config.manual {
            info!("Manual mode, skipping reset");
        } else {
            info!(device = %self.reset.describe(), "Resetting DPU");
            self.reset.reset().await?;
        }
        tokio::time::sleep(self.config.reset_settle).await;
        self.stager.assert_address().await?;

        self.services.start(&mut attempt.services).await?;
        attempt.advance(AttemptPhase::ServicesUp);

        if self.config.manual {
            info!("Services are up; waiting for shutdown");
            let mut shutdown = self.shutdown.clone();
            shutdown_requested(&mut shutdown).await;
            return Ok(BootOutcome::ManualStopped);
        }

        self.navigator.navigate(self.console.as_ref()).await?;
        attempt.advance(AttemptPhase::MenuNavigated);

        let capture = ConsoleCapture::start(self.console.clone());
        let candidates = self.config.pool_candidates();
        let ping = wait_any_ping(
            self.pinger.as_ref(),
            &candidates,
            self.config.ping_timeout,
            self.config.ping_interval,
        )
        .await;
        let log = capture.finish().await;
        if !log.is_empty() {
            info!("Console output during boot:\n{}", String::from_utf8_lossy(&log));
        }
        let address = ping?;
        attempt.address = Some(address);
        attempt.advance(AttemptPhase::NetworkDetected);

        match &media.key {
            Some(key) => {
                self.login.login(address, key).await?;
                attempt.advance(AttemptPhase::LoggedIn);
            }
            None => {
                let hold = self.config.hold_without_key;
                info!(%address, secs = hold.as_secs(), "No SSH key, holding services for the installer");
                tokio::time::sleep(hold).await;
            }
        }
        Ok(BootOutcome::Booted(address))
    }
}

/// Resolves once shutdown is signalled; never if the sender is gone
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            warn!("Shutdown channel closed");
            std::future::pending::<()>().await;
        }
    }
}
