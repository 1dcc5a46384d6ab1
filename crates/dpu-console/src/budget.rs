//! Splitting long waits into bounded sub-waits

use std::time::Duration;

/// Longest single sub-wait
pub const MAX_CHUNK: Duration = Duration::from_secs(30);

/// Remaining time for a pattern wait, handed out in chunks of at most
/// [`MAX_CHUNK`]. The chunks always add up to exactly the total.
#[derive(Debug, Clone)]
pub struct WaitBudget {
    total: Duration,
    remaining: Duration,
    chunk: Duration,
    issued: bool,
}

impl WaitBudget {
    pub fn new(total: Duration) -> Self {
        Self {
            total,
            remaining: total,
            chunk: MAX_CHUNK,
            issued: false,
        }
    }

    /// Use a different chunk size (zero is treated as one millisecond)
    pub fn with_chunk(mut self, chunk: Duration) -> Self {
        self.chunk = chunk.max(Duration::from_millis(1));
        self
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.issued && self.remaining.is_zero()
    }

    /// Next sub-wait, or `None` once the budget is spent.
    ///
    /// A zero budget still yields one zero-length chunk so the caller gets
    /// a single look at what is already buffered.
    pub fn next_chunk(&mut self) -> Option<Duration> {
        if self.remaining.is_zero() {
            if self.issued {
                return None;
            }
            self.issued = true;
            return Some(Duration::ZERO);
        }

        let chunk = self.remaining.min(self.chunk);
        self.remaining -= chunk;
        self.issued = true;
        Some(chunk)
    }
}
