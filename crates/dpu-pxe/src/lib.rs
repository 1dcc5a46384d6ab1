//! DPU PXE Provisioning
//!
//! This crate network-boots a BlueField DPU from an install ISO: it stages
//! the ISO contents for TFTP and HTTP, resets the DPU, serves DHCP, TFTP and
//! HTTP, walks the UEFI menu over the rshim console and waits for the
//! installed system to come up.
//!
//! # Example
//!
//! ```no_run
//! use dpu_common::ShellRunner;
//! use dpu_console::MenuProfile;
//! use dpu_pxe::{PxeBoot, PxeConfig};
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (_stop, shutdown) = watch::channel(false);
//! let config = PxeConfig::new(0, "nfs.example.com:/isos/rhel-9.4-aarch64.iso")
//!     .with_key("/root/.ssh/id_ed25519");
//! let boot = PxeBoot::new(config, Arc::new(ShellRunner::new()), MenuProfile::bluefield()?, shutdown)?;
//! let outcome = boot.run().await?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod host;
pub mod lock;
pub mod login;
pub mod ping;
pub mod services;

pub use config::{PxeConfig, PxePaths};
pub use controller::{AttemptPhase, BootAttempt, BootOutcome, PxeBoot};
pub use error::{PxeError, Result};
pub use host::{IsoStager, MediaStager, StagedMedia};
pub use lock::InstanceLock;
pub use login::{PostBootLogin, SshLogin};
pub use ping::{wait_any_ping, IcmpPinger, Pinger};
pub use services::{PxeServices, ServiceLauncher};
