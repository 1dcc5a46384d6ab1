//! Single running PXE boot per host
//!
//! An advisory `flock` on a lock file that also records the owner's PID. A
//! new run signals that PID and takes the lock over, so a stale run never
//! keeps serving DHCP next to a fresh one.

use crate::error::{PxeError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

const TAKEOVER_GRACE: Duration = Duration::from_secs(5);
const RETRY: Duration = Duration::from_millis(200);

pub struct InstanceLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceLock").field("path", &self.path).finish_non_exhaustive()
    }
}

impl InstanceLock {
    /// Take the lock at `path`, displacing a running owner if there is one
    pub async fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = open(&path)?;

        let blocked_since = Instant::now();
        let mut signalled: Option<(Signal, Instant)> = None;
        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(mut lock) => {
                    write_pid(&mut lock)?;
                    info!(path = %path.display(), "Acquired instance lock");
                    return Ok(Self { path, _lock: lock });
                }
                Err((f, Errno::EWOULDBLOCK)) => file = f,
                Err((_, e)) => return Err(PxeError::Lock(format!("{}: {}", path.display(), e))),
            }

            let owner = read_pid(&mut file);
            let next = match (owner, signalled) {
                // holder never recorded a pid, nothing to signal
                (None, _) if blocked_since.elapsed() >= TAKEOVER_GRACE => {
                    return Err(PxeError::Lock(format!(
                        "{} is held by a process that recorded no pid",
                        path.display()
                    )));
                }
                (None, _) => None,
                (Some(pid), _) if pid == std::process::id() as i32 => {
                    return Err(PxeError::Lock("already held by this process".to_string()));
                }
                (Some(_), None) => Some(Signal::SIGTERM),
                (Some(_), Some((Signal::SIGTERM, at))) if at.elapsed() >= TAKEOVER_GRACE => {
                    Some(Signal::SIGKILL)
                }
                (Some(pid), Some((Signal::SIGKILL, at))) if at.elapsed() >= TAKEOVER_GRACE => {
                    return Err(PxeError::Lock(format!("pid {} did not release the lock", pid)));
                }
                _ => None,
            };

            if let (Some(signal), Some(pid)) = (next, owner) {
                warn!(pid, ?signal, "Another PXE boot is running, taking over");
                if let Err(e) = kill(Pid::from_raw(pid), signal) {
                    if e != Errno::ESRCH {
                        return Err(PxeError::Lock(format!("cannot signal pid {}: {}", pid, e)));
                    }
                }
                signalled = Some((signal, Instant::now()));
            }
            tokio::time::sleep(RETRY).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| PxeError::Lock(format!("{}: {}", path.display(), e)))
}

fn read_pid(file: &mut File) -> Option<i32> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid(file: &mut File) -> Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_records_pid_and_releases_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pxeboot.lock");

        let lock = InstanceLock::acquire(&path).await.unwrap();
        assert_eq!(lock.path(), path);
        let pid: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(pid, std::process::id());

        let err = InstanceLock::acquire(&path).await.unwrap_err();
        assert!(matches!(err, PxeError::Lock(_)));

        drop(lock);
        InstanceLock::acquire(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_takes_over_from_running_owner() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pxeboot.lock");

        // stand-in owner: holds the lock and records its own pid
        let mut owner = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!(
                "exec 9>>{0}; flock -n 9 || exit 1; echo $$ > {0}; exec sleep 30",
                path.display()
            ))
            .spawn()
            .unwrap();
        // wait until the owner has written its pid
        for _ in 0..50 {
            if std::fs::read_to_string(&path).map(|s| !s.trim().is_empty()).unwrap_or(false) {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        let lock = InstanceLock::acquire(&path).await.unwrap();
        let status = owner.wait().unwrap();
        assert!(!status.success());
        let pid: u32 = std::fs::read_to_string(lock.path()).unwrap().trim().parse().unwrap();
        assert_eq!(pid, std::process::id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_on_holder_without_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pxeboot.lock");

        // a separate open file description holds the lock and writes nothing
        let holder = Flock::lock(File::create(&path).unwrap(), FlockArg::LockExclusive).unwrap();

        let started = Instant::now();
        let err = tokio::time::timeout(Duration::from_secs(30), InstanceLock::acquire(&path))
            .await
            .expect("acquire must not wait forever")
            .unwrap_err();
        assert!(matches!(err, PxeError::Lock(ref m) if m.contains("no pid")), "{err}");
        assert!(started.elapsed() >= TAKEOVER_GRACE);
        assert!(started.elapsed() < TAKEOVER_GRACE + Duration::from_secs(1));

        drop(holder);
        InstanceLock::acquire(&path).await.unwrap();
    }
}
