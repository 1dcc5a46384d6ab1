//! Tracking and tearing down background workers
//!
//! Every worker a boot attempt starts (daemon processes such as `dhcpd`, or
//! in-process tasks such as the HTTP server) is registered here. The
//! registry is built fresh for each attempt and drained by
//! [`ServiceRegistry::terminate_all`] on every exit path.

use crate::error::{Result, ServiceError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Default time a worker gets to stop before it is killed
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Stable identity of a registered worker
pub type ServiceId = u64;

enum Worker {
    Process(Child),
    Task {
        handle: JoinHandle<()>,
        stop: watch::Sender<bool>,
    },
}

/// How a worker ended when it was terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Stopped on the polite request (SIGTERM / stop signal)
    Stopped,
    /// Had already exited
    AlreadyExited,
    /// Had to be killed or aborted
    Killed,
}

/// One spawned background worker
pub struct ServiceHandle {
    id: ServiceId,
    name: String,
    worker: Worker,
}

impl ServiceHandle {
    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_process(&self) -> bool {
        matches!(self.worker, Worker::Process(_))
    }

    /// Whether the worker has stopped on its own
    pub fn has_exited(&mut self) -> bool {
        match &mut self.worker {
            Worker::Process(child) => matches!(child.try_wait(), Ok(Some(_))),
            Worker::Task { handle, .. } => handle.is_finished(),
        }
    }

    /// Ask the worker to stop, wait up to `grace`, then force it
    pub async fn terminate(self, grace: Duration) -> Result<StopOutcome> {
        let name = self.name;
        match self.worker {
            Worker::Process(mut child) => {
                if let Ok(Some(status)) = child.try_wait() {
                    debug!(service = %name, %status, "Service already exited");
                    return Ok(StopOutcome::AlreadyExited);
                }

                if let Some(pid) = child.id() {
                    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        debug!(service = %name, error = %e, "SIGTERM failed");
                    }
                }

                match time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(service = %name, %status, "Service stopped");
                        Ok(StopOutcome::Stopped)
                    }
                    Ok(Err(e)) => Err(ServiceError::Terminate {
                        name,
                        reason: e.to_string(),
                    }),
                    Err(_) => {
                        warn!(service = %name, "Service ignored SIGTERM, killing it");
                        child.kill().await.map_err(|e| ServiceError::Terminate {
                            name: name.clone(),
                            reason: e.to_string(),
                        })?;
                        Ok(StopOutcome::Killed)
                    }
                }
            }
            Worker::Task { mut handle, stop } => {
                if handle.is_finished() {
                    return Ok(StopOutcome::AlreadyExited);
                }
                let _ = stop.send(true);

                match time::timeout(grace, &mut handle).await {
                    Ok(Ok(())) => Ok(StopOutcome::Stopped),
                    Ok(Err(e)) => Err(ServiceError::Terminate {
                        name,
                        reason: e.to_string(),
                    }),
                    Err(_) => {
                        warn!(service = %name, "Service task ignored stop signal, aborting it");
                        handle.abort();
                        let _ = handle.await;
                        Ok(StopOutcome::Killed)
                    }
                }
            }
        }
    }
}

/// Summary of a teardown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub stopped: Vec<String>,
    pub killed: Vec<String>,
    pub failed: Vec<String>,
}

impl TeardownReport {
    pub fn total(&self) -> usize {
        self.stopped.len() + self.killed.len() + self.failed.len()
    }
}

/// Registry of the workers belonging to one boot attempt
pub struct ServiceRegistry {
    handles: Vec<ServiceHandle>,
    next_id: ServiceId,
    grace: Duration,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self {
            handles: Vec::new(),
            next_id: 1,
            grace: DEFAULT_GRACE,
        }
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time each worker gets to stop before being forced
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Names of the registered workers, in start order
    pub fn names(&self) -> Vec<String> {
        self.handles.iter().map(|h| h.name.clone()).collect()
    }

    fn register(&mut self, name: String, worker: Worker) -> ServiceId {
        let id = self.next_id;
        self.next_id += 1;
        self.handles.push(ServiceHandle { id, name, worker });
        id
    }

    /// Start `program` as a background process. Returns as soon as the
    /// process exists; its output goes to the debug log.
    pub fn spawn_command(&mut self, name: &str, program: &str, args: &[&str]) -> Result<ServiceId> {
        info!(service = %name, command = %format!("{} {}", program, args.join(" ")), "Starting service");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ServiceError::Spawn {
                name: name.to_string(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(name.to_string(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(name.to_string(), stderr));
        }

        Ok(self.register(name.to_string(), Worker::Process(child)))
    }

    /// Start an in-process worker. It receives a stop signal and must return
    /// once the signal turns `true`.
    pub fn spawn_task<F, Fut>(&mut self, name: &str, task: F) -> ServiceId
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        info!(service = %name, "Starting service task");
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(task(stop_rx));
        self.register(name.to_string(), Worker::Task { handle, stop })
    }

    /// Names of workers that have already exited on their own
    pub fn exited(&mut self) -> Vec<String> {
        self.handles
            .iter_mut()
            .filter_map(|h| h.has_exited().then(|| h.name.clone()))
            .collect()
    }

    /// Stop every worker, newest first. Failures are logged and reported,
    /// never returned; the registry is empty afterwards.
    pub async fn terminate_all(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        while let Some(handle) = self.handles.pop() {
            let name = handle.name.clone();
            match handle.terminate(self.grace).await {
                Ok(StopOutcome::Killed) => report.killed.push(name),
                Ok(_) => report.stopped.push(name),
                Err(e) => {
                    warn!(service = %name, error = %e, "Failed to stop service");
                    report.failed.push(name);
                }
            }
        }

        if report.total() > 0 {
            info!(
                stopped = report.stopped.len(),
                killed = report.killed.len(),
                failed = report.failed.len(),
                "Services terminated"
            );
        }
        report
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        warn!(services = ?self.names(), "Service registry dropped with live services, killing them");
        for handle in &mut self.handles {
            match &mut handle.worker {
                Worker::Process(child) => {
                    let _ = child.start_kill();
                }
                Worker::Task { handle, stop } => {
                    let _ = stop.send(true);
                    handle.abort();
                }
            }
        }
    }
}

async fn forward_output<R: AsyncRead + Unpin>(name: String, pipe: R) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(service = %name, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_terminate_all_processes_and_tasks() {
        let mut registry = ServiceRegistry::new().with_grace(Duration::from_secs(2));

        registry.spawn_command("sleeper", "sleep", &["30"]).unwrap();
        registry.spawn_task("http", |mut stop| async move {
            let _ = stop.wait_for(|s| *s).await;
        });
        assert_eq!(registry.names(), vec!["sleeper", "http"]);
        assert!(registry.exited().is_empty());

        let report = registry.terminate_all().await;
        assert!(registry.is_empty());
        assert_eq!(report.stopped.len(), 2);
        assert!(report.killed.is_empty());
    }

    #[tokio::test]
    async fn test_stubborn_workers_are_forced() {
        let mut registry = ServiceRegistry::new().with_grace(Duration::from_millis(300));

        registry
            .spawn_command("stubborn", "sh", &["-c", "trap '' TERM; sleep 30"])
            .unwrap();
        registry.spawn_task("deaf", |_stop| async move {
            time::sleep(Duration::from_secs(3600)).await;
        });
        // Give the shell time to install its trap
        time::sleep(Duration::from_millis(200)).await;

        let report = registry.terminate_all().await;
        assert!(registry.is_empty());
        assert_eq!(report.killed.len(), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_registry_usable() {
        let mut registry = ServiceRegistry::new();
        let err = registry
            .spawn_command("dhcpd", "/nonexistent/dhcpd", &["-f"])
            .unwrap_err();
        assert!(matches!(err, ServiceError::Spawn { .. }));
        assert!(registry.is_empty());

        registry.spawn_task("noop", |_stop| async {});
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.exited(), vec!["noop"]);

        let report = registry.terminate_all().await;
        assert_eq!(report.stopped, vec!["noop"]);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let mut registry = ServiceRegistry::new();
        let a = registry.spawn_task("a", |_stop| async {});
        let b = registry.spawn_task("b", |_stop| async {});
        assert_ne!(a, b);
        registry.terminate_all().await;
    }
}
