//! Scripted stand-in for a BlueField console
//!
//! [`ScriptedFirmware`] behaves like the UEFI firmware behind an rshim
//! console closely enough to drive the menu navigator end to end: it prints
//! the boot interrupt prompt, reacts to ESC / Down / Enter keystrokes, lists
//! boot devices, and finally starts a kernel. State survives reopening the
//! console, just like the real device.

use crate::connector::ConsoleConnector;
use crate::device::{ConsoleDevice, MINICOM_QUIT};
use crate::error::Result;
use crate::session::ConsoleSession;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt, DuplexStream};

const ESC: &[u8] = b"\x1b";
const DOWN: &[u8] = b"\x1b[B";
const ENTER: &[u8] = b"\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Powered on, boot prompt showing
    PostPrompt,
    /// ESC pressed, menu is up
    Setup,
    /// Boot manager device list
    DeviceList,
    /// Kernel started
    Booted,
}

/// Counters describing what the firmware saw
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareStats {
    pub opens: u32,
    pub quits: u32,
    pub escapes: u32,
    pub setup_downs: u32,
    pub list_downs: u32,
    pub enters: u32,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    cursor: u32,
    /// Down presses in the setup menu since the last power cycle
    menu_downs: u32,
    stats: FirmwareStats,
}

#[derive(Debug, Clone)]
pub struct ScriptedFirmware {
    state: Arc<Mutex<State>>,
    interface_at: Option<u32>,
    stub_delay: Duration,
}

impl Default for ScriptedFirmware {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                phase: Phase::PostPrompt,
                cursor: 0,
                menu_downs: 0,
                stats: FirmwareStats::default(),
            })),
            interface_at: Some(3),
            stub_delay: Duration::from_secs(45),
        }
    }
}

impl ScriptedFirmware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Position of the PXE interface in the device list (1-based Down
    /// presses), or `None` if the list never shows it
    pub fn with_interface_at(mut self, position: Option<u32>) -> Self {
        self.interface_at = position;
        self
    }

    /// Delay between selecting the interface and the kernel's EFI stub line
    pub fn with_stub_delay(mut self, delay: Duration) -> Self {
        self.stub_delay = delay;
        self
    }

    /// Start already past the boot menu, printing kernel output
    pub fn booted(self) -> Self {
        self.lock().phase = Phase::Booted;
        self
    }

    /// Power cycle: back to the boot prompt, [`FirmwareStats`] kept
    pub fn reset(&self) {
        let mut state = self.lock();
        state.phase = Phase::PostPrompt;
        state.cursor = 0;
        state.menu_downs = 0;
    }

    pub fn stats(&self) -> FirmwareStats {
        self.lock().stats.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn serve(self, mut port: DuplexStream) {
        let greeting = {
            let mut state = self.lock();
            state.stats.opens += 1;
            match state.phase {
                Phase::PostPrompt => Some(&b"BlueField UEFI\r\nPress [ESC] to enter UEFI Menu.\r\n"[..]),
                Phase::Booted => Some(&b"[    0.000000] Linux version 5.14.0 (mockbuild)\r\n[    1.204512] systemd[1]: Started.\r\n"[..]),
                _ => None,
            }
        };
        if let Some(text) = greeting {
            if port.write_all(text).await.is_err() {
                return;
            }
        }

        let mut pending: Vec<u8> = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = match port.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            pending.extend_from_slice(&buf[..n]);

            while !pending.is_empty() {
                if pending.starts_with(MINICOM_QUIT) {
                    self.lock().stats.quits += 1;
                    return;
                }
                let (consumed, reply) = if pending.starts_with(DOWN) {
                    (DOWN.len(), self.on_down())
                } else if pending.starts_with(ESC) {
                    (ESC.len(), self.on_escape())
                } else if pending.starts_with(ENTER) {
                    (ENTER.len(), self.on_enter())
                } else {
                    (1, Reply::None)
                };
                pending.drain(..consumed);

                match reply {
                    Reply::None => {}
                    Reply::Text(text) => {
                        if port.write_all(text.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    Reply::Boot => {
                        if self.boot(&mut port).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    fn on_escape(&self) -> Reply {
        let mut state = self.lock();
        state.stats.escapes += 1;
        if state.phase == Phase::PostPrompt {
            state.phase = Phase::Setup;
        }
        Reply::None
    }

    fn on_down(&self) -> Reply {
        let mut state = self.lock();
        match state.phase {
            Phase::Setup => {
                state.stats.setup_downs += 1;
                state.menu_downs += 1;
                match state.menu_downs {
                    1 => Reply::Text(
                        "\x1b[2J Select Language\r\nThis is the option\r\none adjusts to change\r\nthe language for the\r\ncurrent system\r\n"
                            .to_string(),
                    ),
                    _ => Reply::Text(
                        " Boot Manager\r\nThis selection will\r\ntake you to the Boot\r\nManager\r\n".to_string(),
                    ),
                }
            }
            Phase::DeviceList => {
                state.stats.list_downs += 1;
                state.cursor += 1;
                if Some(state.cursor) == self.interface_at {
                    Reply::Text(
                        "UEFI PXEv4 (MAC:001ACAFFFF12)\r\nPciRoot(0x0)/MAC(001ACAFFFF12,0x1)/IPv4(0.0.0.0)\r\n".to_string(),
                    )
                } else {
                    Reply::Text(format!("Boot entry {}\r\nVenHw(F019E406-8C9C-11E5-8797-001ACA00BFC4)\r\n", state.cursor))
                }
            }
            _ => Reply::None,
        }
    }

    fn on_enter(&self) -> Reply {
        let mut state = self.lock();
        state.stats.enters += 1;
        match state.phase {
            Phase::Setup if state.menu_downs >= 2 => {
                state.phase = Phase::DeviceList;
                state.cursor = 0;
                Reply::Text("\x1b[2J Boot Manager Menu\r\nDevice Path\r\n".to_string())
            }
            Phase::DeviceList if Some(state.cursor) == self.interface_at => {
                state.phase = Phase::Booted;
                Reply::Boot
            }
            _ => Reply::None,
        }
    }

    async fn boot(&self, port: &mut DuplexStream) -> std::io::Result<()> {
        port.write_all(b">>Start PXE over IPv4.\r\n  Station IP address is 172.31.100.10\r\n")
            .await?;
        tokio::time::sleep(Duration::from_secs(2)).await;
        port.write_all(b"  GRUB\r\n  Install OS\r\n  Reboot\r\n").await?;
        tokio::time::sleep(self.stub_delay).await;
        port.write_all(b"EFI stub: Booting Linux Kernel...\r\nEFI stub: Using DTB from configuration table\r\n")
            .await
    }
}

enum Reply {
    None,
    Text(String),
    Boot,
}

#[async_trait]
impl ConsoleConnector for ScriptedFirmware {
    async fn open(&self) -> Result<ConsoleSession> {
        let (ours, theirs) = duplex(64 * 1024);
        tokio::spawn(self.clone().serve(theirs));
        let (reader, writer) = split(ours);
        Ok(ConsoleSession::new(
            ConsoleDevice::rshim(0),
            Box::new(reader),
            Box::new(writer),
        ))
    }

    fn describe(&self) -> String {
        "scripted firmware".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConsoleError;
    use crate::session::console_pattern;

    async fn walk_to_device_list(firmware: &ScriptedFirmware) -> std::result::Result<(), ConsoleError> {
        let mut session = firmware.open().await?;
        session
            .wait_for(&console_pattern("enter UEFI Menu")?, Duration::from_secs(5))
            .await?;
        session.send(ESC).await?;
        session.send(DOWN).await?;
        session
            .wait_for(&console_pattern("Select Language")?, Duration::from_secs(3))
            .await?;
        session.send(DOWN).await?;
        session
            .wait_for(&console_pattern("Boot Manager")?, Duration::from_secs(3))
            .await?;
        session.send(ENTER).await?;
        session
            .wait_for(&console_pattern("Device Path")?, Duration::from_secs(3))
            .await?;
        session.close().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_menu_starts_over_after_reset() {
        let firmware = ScriptedFirmware::new();

        walk_to_device_list(&firmware).await.unwrap();
        firmware.reset();
        walk_to_device_list(&firmware).await.unwrap();

        let stats = firmware.stats();
        assert_eq!(stats.opens, 2);
        assert_eq!(stats.escapes, 2);
        assert_eq!(stats.setup_downs, 4);
    }
}
