//! DPU Hardware Tooling
//!
//! Discovery of BlueField and IPU cards on the PCI bus, and the firmware
//! operations dpu-tools performs on them.
//!
//! # BlueField
//!
//! [`BlueField`] wraps `mstflint`, `mstconfig` and `mstfwreset` for one PCI
//! function and loads BFB bundles through rshim. [`RshimReset`] implements
//! [`DeviceReset`], the hard reset used before a network boot.
//!
//! # ConnectX
//!
//! [`ConnectX`] runs `mlxup` to bring every ConnectX adapter on the host to
//! the firmware it bundles.
//!
//! # IPU
//!
//! [`IpuFirmware`] reads the IMC release and runs the reflash steps
//! described by an [`IpuReflashConfig`].

pub mod bluefield;
pub mod connectx;
pub mod discovery;
pub mod error;
pub mod ipu;

pub use bluefield::{BlueField, DeviceReset, DpuMode, ModeReport, RshimReset};
pub use connectx::ConnectX;
pub use discovery::{detect_dpu_kind, scan_for_dpus, DetectedDpu, DpuKind};
pub use error::{HwError, Result};
pub use ipu::{IpuFirmware, IpuReflashConfig, ReflashReport, ReflashStep};
