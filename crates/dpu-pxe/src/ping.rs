//! Finding the booted DPU on the private network

use crate::error::{PxeError, Result};
use async_trait::async_trait;
use dpu_common::CommandRunner;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Liveness probe for one address
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, address: Ipv4Addr) -> bool;
}

/// One ICMP echo through the system `ping`, capped at a second
pub struct IcmpPinger {
    runner: Arc<dyn CommandRunner>,
}

impl IcmpPinger {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Pinger for IcmpPinger {
    async fn ping(&self, address: Ipv4Addr) -> bool {
        match self
            .runner
            .run(&format!("timeout 1 ping -4 -c 1 {}", address))
            .await
        {
            Ok(out) => out.success(),
            Err(e) => {
                debug!(%address, error = %e, "ping could not run");
                false
            }
        }
    }
}

/// Sweep `candidates` in order until one answers, pausing `interval`
/// between sweeps. Fails once `timeout` has passed without a response;
/// neither a slow ping nor the pause runs past that budget.
pub async fn wait_any_ping(
    pinger: &dyn Pinger,
    candidates: &[Ipv4Addr],
    timeout: Duration,
    interval: Duration,
) -> Result<Ipv4Addr> {
    info!(count = candidates.len(), timeout_secs = timeout.as_secs(), "Waiting for response from ping");
    let start = Instant::now();
    let deadline = start + timeout;
    let mut sweep = 0u32;

    'sweeps: while Instant::now() < deadline {
        sweep += 1;
        for &address in candidates {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break 'sweeps;
            }
            match tokio::time::timeout(remaining, pinger.ping(address)).await {
                Ok(true) => {
                    info!(%address, sweep, "Got ping response");
                    return Ok(address);
                }
                Ok(false) => {}
                Err(_) => {
                    debug!(%address, "Ping outlived the budget");
                    break 'sweeps;
                }
            }
        }
        debug!(sweep, "No response yet");
        tokio::time::sleep_until((Instant::now() + interval).min(deadline)).await;
    }

    let waited = start.elapsed().as_secs_f64();
    Err(PxeError::PingTimeout {
        waited_secs: (waited * 100.0).round() / 100.0,
    })
}
