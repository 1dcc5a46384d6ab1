//! Console character devices

use std::fmt;
use std::path::PathBuf;

/// Bytes that make minicom exit: Ctrl-A, `x`, newline
pub const MINICOM_QUIT: &[u8] = b"\x01x\n";

/// A serial/console character device and how to talk to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleDevice {
    pub path: PathBuf,
    pub baud: u32,
    pub quit_sequence: Vec<u8>,
}

impl ConsoleDevice {
    pub fn new(path: impl Into<PathBuf>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            quit_sequence: MINICOM_QUIT.to_vec(),
        }
    }

    /// rshim console of a BlueField. Each card exposes two PCI functions
    /// but one rshim instance, so `index` is the PCI function index.
    pub fn rshim(index: usize) -> Self {
        Self::new(format!("/dev/rshim{}/console", index / 2), 115_200)
    }

    /// IPU management complex console
    pub fn ipu_imc() -> Self {
        Self::new("/dev/ttyUSB2", 460_800)
    }

    /// IPU compute complex console
    pub fn ipu_acc() -> Self {
        Self::new("/dev/ttyUSB0", 115_200)
    }
}

impl fmt::Display for ConsoleDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path.display(), self.baud)
    }
}
