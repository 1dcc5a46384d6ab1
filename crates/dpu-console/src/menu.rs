//! UEFI boot menu navigation
//!
//! The navigator walks the firmware menu as an ordered list of transitions.
//! Each transition optionally sends keystrokes, lets the firmware settle,
//! and waits for the text that proves the menu reached the next state.
//! Only the device list scan repeats; every other step has a single shot.
//!
//! Patterns, keys and timeouts live in a [`MenuProfile`]. Profiles are
//! layered:
//! 1. **Built-in profiles** compiled into the binary
//! 2. **User overrides** read from `/etc/dpu-tools/profiles/<name>.yml`

use crate::connector::ConsoleConnector;
use crate::error::{ConsoleError, MenuState, NavigationError, NavigationFailure, Result};
use crate::session::{console_pattern, ConsoleSession};
use regex::bytes::Regex;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Built-in profiles compiled into the binary
const BUILTIN_PROFILES: &[(&str, &str)] = &[("bluefield", include_str!("../profiles/bluefield.yml"))];

/// User override directory
pub const PROFILE_OVERRIDE_DIR: &str = "/etc/dpu-tools/profiles";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Expectation {
    pub pattern: String,
    pub timeout_secs: f64,
}

impl Expectation {
    fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MenuKeys {
    pub escape: String,
    pub down: String,
    pub enter: String,
}

/// Firmware text patterns, keys and timing for one kind of DPU
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MenuProfile {
    pub name: String,
    pub keys: MenuKeys,
    pub escape_presses: u32,
    pub settle_ms: u64,
    pub interface_settle_ms: u64,
    pub interface_attempts: u32,
    pub boot_prompt: Expectation,
    pub language_option: Expectation,
    pub boot_manager: Expectation,
    pub device_path: Expectation,
    pub boot_interface: Expectation,
    pub station_ip: Expectation,
    pub install_entry: Expectation,
    pub kernel_start: Expectation,
}

impl MenuProfile {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| ConsoleError::Profile(e.to_string()))
    }

    /// Built-in profile by name
    pub fn builtin(name: &str) -> Result<Self> {
        let yaml = BUILTIN_PROFILES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, yaml)| *yaml)
            .ok_or_else(|| ConsoleError::Profile(format!("no built-in profile '{}'", name)))?;
        Self::from_yaml(yaml)
    }

    /// BlueField profile
    pub fn bluefield() -> Result<Self> {
        Self::builtin("bluefield")
    }

    /// Profile `name`, preferring `<override_dir>/<name>.yml` over the built-in
    pub async fn load(name: &str, override_dir: &Path) -> Result<Self> {
        let path = override_dir.join(format!("{}.yml", name));
        match tokio::fs::read_to_string(&path).await {
            Ok(yaml) => {
                info!("Loaded menu profile override '{}' from {}", name, path.display());
                Self::from_yaml(&yaml)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::builtin(name),
            Err(e) => Err(e.into()),
        }
    }

    /// Load a profile from an explicit file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let yaml = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&yaml)
    }
}

/// Keystrokes sent at the start of a transition
#[derive(Debug, Clone)]
struct Keystroke {
    bytes: Vec<u8>,
    repeat: u32,
}

#[derive(Debug, Clone)]
struct Transition {
    state: MenuState,
    settle_before: Duration,
    send: Option<Keystroke>,
    settle_after: Duration,
    reopen: bool,
    expect: Option<(Regex, Duration)>,
    attempts: u32,
    failure: NavigationFailure,
}

impl Transition {
    fn new(state: MenuState, failure: NavigationFailure) -> Self {
        Self {
            state,
            settle_before: Duration::ZERO,
            send: None,
            settle_after: Duration::ZERO,
            reopen: false,
            expect: None,
            attempts: 1,
            failure,
        }
    }

    fn settle_before(mut self, d: Duration) -> Self {
        self.settle_before = d;
        self
    }

    fn send(mut self, key: &str, repeat: u32) -> Self {
        self.send = Some(Keystroke {
            bytes: key.as_bytes().to_vec(),
            repeat,
        });
        self
    }

    fn settle_after(mut self, d: Duration) -> Self {
        self.settle_after = d;
        self
    }

    fn reopen(mut self) -> Self {
        self.reopen = true;
        self
    }

    fn expect(mut self, e: &Expectation) -> Result<Self> {
        self.expect = Some((console_pattern(&e.pattern)?, e.timeout()));
        Ok(self)
    }

    fn attempts(mut self, n: u32) -> Self {
        self.attempts = n.max(1);
        self
    }
}

/// Outcome of a successful walk through the menu
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationReport {
    /// Down presses it took to reach the boot interface
    pub interface_attempts: u32,
    /// Seconds spent waiting for the kernel's EFI stub line
    pub kernel_wait_secs: f64,
}

pub struct MenuNavigator {
    profile: MenuProfile,
    transitions: Vec<Transition>,
    final_settle: Duration,
}

impl MenuNavigator {
    pub fn new(profile: MenuProfile) -> Result<Self> {
        let settle = Duration::from_millis(profile.settle_ms);
        let iface_settle = Duration::from_millis(profile.interface_settle_ms);
        let keys = &profile.keys;

        use MenuState::*;
        use NavigationFailure::*;
        let transitions = vec![
            Transition::new(BootPrompt, BootPromptNotSeen).expect(&profile.boot_prompt)?,
            Transition::new(BootPrompt, MenuUnresponsive)
                .send(&keys.escape, profile.escape_presses)
                .settle_after(settle)
                .reopen(),
            Transition::new(SetupMenu, MenuUnresponsive)
                .settle_before(settle)
                .send(&keys.down, 1)
                .settle_after(settle)
                .expect(&profile.language_option)?,
            Transition::new(SetupMenu, MenuUnresponsive)
                .send(&keys.down, 1)
                .expect(&profile.boot_manager)?,
            Transition::new(BootManager, MenuUnresponsive)
                .send(&keys.enter, 1)
                .expect(&profile.device_path)?,
            Transition::new(DeviceList, BootInterfaceNotFound { attempts: profile.interface_attempts })
                .send(&keys.down, 1)
                .settle_after(iface_settle)
                .expect(&profile.boot_interface)?
                .attempts(profile.interface_attempts),
            Transition::new(NetworkBoot, KernelBootNotStarted)
                .send(&keys.enter, 1)
                .settle_after(settle)
                .expect(&profile.station_ip)?,
            Transition::new(NetworkBoot, KernelBootNotStarted).expect(&profile.install_entry)?,
            Transition::new(KernelBooting, KernelStubNotSeen).expect(&profile.kernel_start)?,
        ];

        Ok(Self {
            transitions,
            final_settle: settle,
            profile,
        })
    }

    pub fn profile(&self) -> &MenuProfile {
        &self.profile
    }

    /// Drive the firmware from power-on to a running kernel.
    ///
    /// The console session is always closed before returning.
    pub async fn navigate(
        &self,
        connector: &dyn ConsoleConnector,
    ) -> std::result::Result<NavigationReport, NavigationError> {
        info!(profile = %self.profile.name, console = %connector.describe(), "Navigating boot menu");

        let mut session = connector.open().await.map_err(|e| {
            NavigationError::new(MenuState::BootPrompt, NavigationFailure::ConsoleUnavailable, e)
        })?;

        let result = self.walk(connector, &mut session).await;

        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close console after navigation");
        }

        match &result {
            Ok(report) => info!(
                interface_attempts = report.interface_attempts,
                kernel_wait_secs = report.kernel_wait_secs,
                "Kernel is booting"
            ),
            Err(e) => warn!(error = %e, "Boot menu navigation failed"),
        }
        result
    }

    async fn walk(
        &self,
        connector: &dyn ConsoleConnector,
        session: &mut ConsoleSession,
    ) -> std::result::Result<NavigationReport, NavigationError> {
        let mut report = NavigationReport {
            interface_attempts: 0,
            kernel_wait_secs: 0.0,
        };
        let started = Instant::now();

        for (step, t) in self.transitions.iter().enumerate() {
            let fail = |e: ConsoleError| NavigationError::new(t.state, t.failure.clone(), e);
            debug!(step = step + 1, state = %t.state, "Menu transition");

            if !t.settle_before.is_zero() {
                sleep(t.settle_before).await;
            }

            let mut last_err = None;
            let mut matched = false;
            for attempt in 1..=t.attempts {
                if let Some(key) = &t.send {
                    for _ in 0..key.repeat {
                        session.send(&key.bytes).await.map_err(fail)?;
                    }
                }
                if !t.settle_after.is_zero() {
                    sleep(t.settle_after).await;
                }
                if t.reopen {
                    session.close().await.map_err(fail)?;
                    *session = connector.open().await.map_err(fail)?;
                }

                let Some((pattern, timeout)) = &t.expect else {
                    matched = true;
                    break;
                };

                match session.wait_for(pattern, *timeout).await {
                    Ok(elapsed) => {
                        if t.attempts > 1 {
                            report.interface_attempts = attempt;
                        }
                        if t.failure == NavigationFailure::KernelStubNotSeen {
                            report.kernel_wait_secs = elapsed;
                        }
                        matched = true;
                        break;
                    }
                    Err(e @ ConsoleError::Timeout { .. }) if attempt < t.attempts => {
                        last_err = Some(e);
                    }
                    Err(e) => {
                        last_err = Some(e);
                        break;
                    }
                }
            }

            if !matched {
                return Err(fail(last_err.unwrap_or(ConsoleError::Closed)));
            }
        }

        sleep(self.final_settle).await;
        debug!(elapsed = ?started.elapsed(), "Menu walk complete");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedFirmware;
    use tempfile::tempdir;

    fn navigator() -> MenuNavigator {
        MenuNavigator::new(MenuProfile::bluefield().unwrap()).unwrap()
    }

    #[test]
    fn test_builtin_profile() {
        let profile = MenuProfile::bluefield().unwrap();
        assert_eq!(profile.keys.escape, "\x1b");
        assert_eq!(profile.keys.down, "\x1b[B");
        assert_eq!(profile.keys.enter, "\r\n");
        assert_eq!(profile.escape_presses, 10);
        assert_eq!(profile.interface_attempts, 30);
        assert_eq!(profile.boot_prompt.timeout_secs, 120.0);
        assert_eq!(profile.kernel_start.timeout_secs, 300.0);
        assert!(MenuProfile::builtin("octeon").is_err());
    }

    #[tokio::test]
    async fn test_profile_override() {
        let dir = tempdir().unwrap();
        let mut yaml = include_str!("../profiles/bluefield.yml").to_string();
        yaml = yaml.replace("interface_attempts: 30", "interface_attempts: 12");
        tokio::fs::write(dir.path().join("bluefield.yml"), yaml).await.unwrap();

        let profile = MenuProfile::load("bluefield", dir.path()).await.unwrap();
        assert_eq!(profile.interface_attempts, 12);

        let empty = tempdir().unwrap();
        let profile = MenuProfile::load("bluefield", empty.path()).await.unwrap();
        assert_eq!(profile, MenuProfile::bluefield().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_walk() {
        let firmware = ScriptedFirmware::new().with_interface_at(Some(4));
        let report = navigator().navigate(&firmware).await.unwrap();

        assert_eq!(report.interface_attempts, 4);
        assert!(report.kernel_wait_secs >= 44.0);

        let stats = firmware.stats();
        assert_eq!(stats.escapes, 10);
        assert_eq!(stats.opens, 2);
        assert_eq!(stats.quits, 2);
        assert_eq!(stats.setup_downs, 2);
        assert_eq!(stats.list_downs, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interface_scan_gives_up_after_thirty() {
        let firmware = ScriptedFirmware::new().with_interface_at(None);
        let err = navigator().navigate(&firmware).await.unwrap_err();

        assert_eq!(err.state, MenuState::DeviceList);
        assert_eq!(err.kind, NavigationFailure::BootInterfaceNotFound { attempts: 30 });
        assert!(matches!(err.source, ConsoleError::Timeout { .. }));
        assert_eq!(firmware.stats().list_downs, 30);
        assert_eq!(firmware.stats().quits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kernel_never_starts() {
        let firmware = ScriptedFirmware::new().with_stub_delay(Duration::from_secs(3600));
        let start = Instant::now();
        let err = navigator().navigate(&firmware).await.unwrap_err();

        assert_eq!(err.state, MenuState::KernelBooting);
        assert_eq!(err.kind, NavigationFailure::KernelStubNotSeen);
        assert!(start.elapsed() >= Duration::from_secs(300));
        match err.source {
            ConsoleError::Timeout { waited, .. } => assert_eq!(waited, Duration::from_secs(30)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_boot_prompt() {
        let firmware = ScriptedFirmware::new().booted();
        let err = navigator().navigate(&firmware).await.unwrap_err();
        assert_eq!(err.kind, NavigationFailure::BootPromptNotSeen);
        assert_eq!(firmware.stats().escapes, 0);
    }
}
