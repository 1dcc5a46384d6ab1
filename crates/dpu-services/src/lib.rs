//! PXE Service Workers
//!
//! This crate runs the services a DPU needs to network boot from the host:
//!
//! - **dhcpd** hands out an address and points at the EFI loader
//! - **in.tftpd** serves the EFI loader, GRUB and kernel/initrd
//! - an in-process **HTTP** server serves the installer payload
//!
//! Workers are tracked in a [`ServiceRegistry`] so a boot attempt can always
//! tear down everything it started.

pub mod config;
pub mod error;
pub mod http;
pub mod registry;

pub use config::{DhcpdConfig, GrubConfig, OsFlavor};
pub use error::{Result, ServiceError};
pub use http::{serve_static, StaticHttpConfig};
pub use registry::{ServiceHandle, ServiceId, ServiceRegistry, StopOutcome, TeardownReport};
