//! One open console session
//!
//! A session owns the byte stream of a console emulator (or anything else
//! that looks like one) and offers expect-style pattern waits over the
//! accumulated output. Everything read is appended to a buffer; a successful
//! match consumes the buffer up to the end of the match.

use crate::budget::WaitBudget;
use crate::device::ConsoleDevice;
use crate::error::{ConsoleError, Result};
use regex::bytes::{Regex, RegexBuilder};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

/// Upper bound on buffered console output; older bytes are dropped first
const MAX_BUFFER: usize = 1024 * 1024;

/// How long `close` waits for the emulator to exit
const CLOSE_GRACE: Duration = Duration::from_secs(5);

const READ_SIZE: usize = 4096;

/// Compile a console pattern. `.` matches newlines and bytes are matched
/// as-is, so stray non-UTF-8 output from firmware does not break matching.
pub fn console_pattern(pattern: &str) -> Result<Regex> {
    Ok(RegexBuilder::new(pattern)
        .dot_matches_new_line(true)
        .unicode(false)
        .build()?)
}

pub struct ConsoleSession {
    device: ConsoleDevice,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    child: Option<Child>,
    buffer: Vec<u8>,
    before: Vec<u8>,
    last_match: Vec<u8>,
    eof: bool,
    closed: bool,
}

impl ConsoleSession {
    pub fn new(
        device: ConsoleDevice,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            device,
            reader,
            writer,
            child: None,
            buffer: Vec::new(),
            before: Vec::new(),
            last_match: Vec::new(),
            eof: false,
            closed: false,
        }
    }

    /// Attach the emulator process so `close` can reap it
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    pub fn device(&self) -> &ConsoleDevice {
        &self.device
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Output preceding the last match
    pub fn before(&self) -> String {
        String::from_utf8_lossy(&self.before).into_owned()
    }

    /// Text of the last match
    pub fn last_match(&self) -> String {
        String::from_utf8_lossy(&self.last_match).into_owned()
    }

    /// Single bounded wait for `pattern`
    pub async fn expect(&mut self, pattern: &Regex, timeout: Duration) -> Result<()> {
        if self.closed {
            return Err(ConsoleError::Closed);
        }

        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; READ_SIZE];

        loop {
            if let Some(m) = pattern.find(&self.buffer) {
                let (start, end) = (m.start(), m.end());
                self.before = self.buffer[..start].to_vec();
                self.last_match = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                trace!(pattern = %pattern, "Matched");
                return Ok(());
            }

            if self.eof {
                return Err(ConsoleError::Eof {
                    context: format!("waiting for /{}/", pattern),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ConsoleError::Timeout {
                    pattern: pattern.to_string(),
                    waited: timeout,
                });
            }

            match time::timeout(deadline - now, self.reader.read(&mut chunk)).await {
                Err(_) => continue,
                Ok(Ok(0)) => self.eof = true,
                Ok(Ok(n)) => self.push(&chunk[..n]),
                Ok(Err(e)) if is_end_of_stream(&e) => self.eof = true,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Wait up to `total` for `pattern`, in sub-waits of at most 30 s.
    ///
    /// Returns the elapsed time in seconds rounded to two decimals. When the
    /// budget runs out the timeout of the final sub-wait is returned.
    /// End of stream ends the wait immediately.
    pub async fn wait_for(&mut self, pattern: &Regex, total: Duration) -> Result<f64> {
        let start = Instant::now();
        let mut budget = WaitBudget::new(total);
        let mut last_timeout = None;

        while let Some(chunk) = budget.next_chunk() {
            match self.expect(pattern, chunk).await {
                Ok(()) => {
                    let elapsed = round_secs(start.elapsed());
                    debug!(pattern = %pattern, elapsed, "Console pattern seen");
                    return Ok(elapsed);
                }
                Err(e @ ConsoleError::Timeout { .. }) => {
                    trace!(pattern = %pattern, remaining = ?budget.remaining(), "Sub-wait timed out");
                    last_timeout = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_timeout.unwrap_or(ConsoleError::Timeout {
            pattern: pattern.to_string(),
            waited: Duration::ZERO,
        }))
    }

    /// Write raw keystrokes
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(ConsoleError::Closed);
        }
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next chunk of output, or `None` if nothing arrived within `timeout`
    pub async fn read_chunk(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if self.closed {
            return Err(ConsoleError::Closed);
        }
        if !self.buffer.is_empty() {
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }
        if self.eof {
            return Err(ConsoleError::Eof {
                context: "reading".to_string(),
            });
        }

        let mut chunk = [0u8; READ_SIZE];
        match time::timeout(timeout, self.reader.read(&mut chunk)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => {
                self.eof = true;
                Err(ConsoleError::Eof {
                    context: "reading".to_string(),
                })
            }
            Ok(Ok(n)) => Ok(Some(chunk[..n].to_vec())),
            Ok(Err(e)) if is_end_of_stream(&e) => {
                self.eof = true;
                Err(ConsoleError::Eof {
                    context: "reading".to_string(),
                })
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Quit the emulator and reap it. Safe to call more than once; only the
    /// first call does anything.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!(device = %self.device, "Closing console");

        if let Err(e) = self.write_quit().await {
            debug!(device = %self.device, error = %e, "Quit sequence not delivered");
        }

        if !self.eof {
            let mut scratch = [0u8; READ_SIZE];
            let drained = time::timeout(CLOSE_GRACE, async {
                loop {
                    match self.reader.read(&mut scratch).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            })
            .await;
            if drained.is_err() {
                warn!(device = %self.device, "Console did not reach end of stream after quit");
            }
            self.eof = true;
        }

        if let Some(mut child) = self.child.take() {
            match time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "Console emulator exited"),
                Ok(Err(e)) => warn!(error = %e, "Failed to reap console emulator"),
                Err(_) => {
                    warn!(device = %self.device, "Console emulator still running, killing it");
                    child.kill().await?;
                }
            }
        }

        Ok(())
    }

    async fn write_quit(&mut self) -> std::io::Result<()> {
        let quit = self.device.quit_sequence.clone();
        self.writer.write_all(&quit).await?;
        self.writer.flush().await
    }

    fn push(&mut self, bytes: &[u8]) {
        trace!(bytes = bytes.len(), "Console output");
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAX_BUFFER {
            let excess = self.buffer.len() - MAX_BUFFER;
            self.buffer.drain(..excess);
        }
    }
}

impl Drop for ConsoleSession {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if !self.closed {
                debug!(device = %self.device, "Console dropped without close, killing emulator");
            }
            let _ = child.start_kill();
        }
    }
}

/// A pty master reports EIO once the slave side is gone
fn is_end_of_stream(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(nix::errno::Errno::EIO as i32)
        || e.kind() == std::io::ErrorKind::BrokenPipe
}

fn round_secs(d: Duration) -> f64 {
    (d.as_secs_f64() * 100.0).round() / 100.0
}
