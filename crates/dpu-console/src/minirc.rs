//! Scoped override of the default minicom configuration
//!
//! minicom reads `~/.minirc.dfl` on startup. Hardware flow control must be
//! off for the rshim and IPU consoles, so while a [`MinircGuard`] is alive
//! the file holds exactly that setting. Dropping the guard puts back the
//! previous bytes, or removes the file if there was none.

use crate::error::Result;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// minicom configuration that disables RTS/CTS flow control
pub const MINIRC_NO_FLOW_CONTROL: &str = "pu rtscts           No\n";

/// `~/.minirc.dfl`, falling back to root's home
pub fn default_minirc_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".minirc.dfl")
}

#[derive(Debug)]
pub struct MinircGuard {
    path: PathBuf,
    previous: Option<Vec<u8>>,
}

impl MinircGuard {
    /// Install the flow-control-off config at the default location
    pub fn install_default() -> Result<Self> {
        Self::install(default_minirc_path())
    }

    /// Install the flow-control-off config at `path`
    pub fn install(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let previous = match std::fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        std::fs::write(&path, MINIRC_NO_FLOW_CONTROL)?;
        debug!(path = %path.display(), existed = previous.is_some(), "Installed minicom config");

        Ok(Self { path, previous })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MinircGuard {
    fn drop(&mut self) {
        let result = match self.previous.take() {
            Some(bytes) => std::fs::write(&self.path, bytes),
            None => match std::fs::remove_file(&self.path) {
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };

        match result {
            Ok(()) => debug!(path = %self.path.display(), "Restored minicom config"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to restore minicom config"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn test_restores_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".minirc.dfl");
        let original = b"pu baudrate         9600\npu rtscts           Yes\n\xff".to_vec();
        std::fs::write(&path, &original).unwrap();

        {
            let guard = MinircGuard::install(&path).unwrap();
            assert_eq!(std::fs::read_to_string(guard.path()).unwrap(), MINIRC_NO_FLOW_CONTROL);
        }

        assert_eq!(std::fs::read(&path).unwrap(), original);
    }

    #[test]
    fn test_removes_file_that_did_not_exist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".minirc.dfl");

        {
            let _guard = MinircGuard::install(&path).unwrap();
            assert!(path.exists());
        }

        assert!(!path.exists());
    }

    #[test]
    fn test_restores_on_error_return() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".minirc.dfl");
        std::fs::write(&path, "before").unwrap();

        let failing = || -> std::result::Result<(), &'static str> {
            let _guard = MinircGuard::install(&path).map_err(|_| "install")?;
            Err("console went away")
        };
        assert!(failing().is_err());

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "before");
    }

    #[test]
    fn test_restores_on_panic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".minirc.dfl");
        let panic_path = path.clone();

        let result = std::panic::catch_unwind(move || {
            let _guard = MinircGuard::install(&panic_path).unwrap();
            panic!("navigator blew up");
        });
        assert!(result.is_err());

        assert!(!path.exists());
    }

    #[test]
    #[serial]
    fn test_install_default_follows_home() {
        let dir = tempdir().unwrap();
        let saved = std::env::var_os("HOME");
        std::env::set_var("HOME", dir.path());

        assert_eq!(default_minirc_path(), dir.path().join(".minirc.dfl"));
        {
            let guard = MinircGuard::install_default().unwrap();
            assert_eq!(guard.path(), dir.path().join(".minirc.dfl"));
            assert!(guard.path().exists());
        }
        assert!(!dir.path().join(".minirc.dfl").exists());

        match saved {
            Some(home) => std::env::set_var("HOME", home),
            None => std::env::remove_var("HOME"),
        }
    }
}
