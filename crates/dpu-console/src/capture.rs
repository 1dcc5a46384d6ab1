//! Background mirror of console output
//!
//! While the boot attempt waits for the device to answer pings, a capture
//! worker keeps reading the console so the boot log can be shown afterwards.
//! The worker owns its buffer; the only way to get it is [`ConsoleCapture::finish`],
//! which stops the worker and joins it. Dropping the capture stops the worker
//! too, and the session is still closed.

use crate::connector::ConsoleConnector;
use crate::error::ConsoleError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How often the worker checks for the stop signal
const POLL: Duration = Duration::from_secs(1);

pub struct ConsoleCapture {
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<Vec<u8>>>,
}

impl ConsoleCapture {
    /// Open a session through `connector` and start mirroring it
    pub fn start(connector: Arc<dyn ConsoleConnector>) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(capture_loop(connector, stop_rx));
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the worker and take everything it captured
    pub async fn finish(mut self) -> Vec<u8> {
        let _ = self.stop.send(true);
        let Some(handle) = self.handle.take() else {
            return Vec::new();
        };
        match handle.await {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(error = %e, "Console capture worker failed");
                Vec::new()
            }
        }
    }
}

impl Drop for ConsoleCapture {
    fn drop(&mut self) {
        if self.handle.take().is_some() {
            debug!("Console capture dropped, stopping worker");
            let _ = self.stop.send(true);
        }
    }
}

async fn capture_loop(
    connector: Arc<dyn ConsoleConnector>,
    mut stop: watch::Receiver<bool>,
) -> Vec<u8> {
    let mut buffer = Vec::new();
    let mut session = match connector.open().await {
        Ok(session) => session,
        Err(e) => {
            warn!(console = %connector.describe(), error = %e, "Console capture unavailable");
            return buffer;
        }
    };

    while !*stop.borrow() {
        tokio::select! {
            biased;
            // a dropped sender stops the worker as well
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            read = session.read_chunk(POLL) => match read {
                Ok(Some(chunk)) => buffer.extend_from_slice(&chunk),
                Ok(None) => {}
                Err(ConsoleError::Eof { .. }) => {
                    debug!("Console closed during capture");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Console capture read failed");
                    break;
                }
            },
        }
    }

    if let Err(e) = session.close().await {
        debug!(error = %e, "Failed to close capture session");
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedFirmware;

    #[tokio::test(start_paused = true)]
    async fn test_capture_collects_kernel_log() {
        let firmware = ScriptedFirmware::new().booted();
        let capture = ConsoleCapture::start(Arc::new(firmware.clone()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        let log = String::from_utf8(capture.finish().await).unwrap();

        assert!(log.contains("Linux version"));
        assert_eq!(firmware.stats().quits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_capture_closes_console() {
        let firmware = ScriptedFirmware::new().booted();
        let capture = ConsoleCapture::start(Arc::new(firmware.clone()));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(firmware.stats().opens, 1);
        drop(capture);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(firmware.stats().quits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stops_when_sender_goes_away() {
        let firmware = ScriptedFirmware::new().booted();
        let (stop, stop_rx) = watch::channel(false);
        let worker = tokio::spawn(capture_loop(Arc::new(firmware.clone()), stop_rx));

        tokio::time::sleep(Duration::from_secs(3)).await;
        drop(stop);

        let log = tokio::time::timeout(Duration::from_secs(10), worker)
            .await
            .expect("worker must stop")
            .unwrap();
        assert!(!log.is_empty());
        assert_eq!(firmware.stats().quits, 1);
    }
}
