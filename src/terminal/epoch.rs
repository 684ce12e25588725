use std::time::Instant;

/// Millisecond time source used for link timestamps.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Monotonic time relative to construction.
pub struct Epoch {
    time_base: Instant,
}

impl Epoch {
    pub fn new() -> Self {
        Self {
            time_base: Instant::now(),
        }
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for Epoch {
    fn now_ms(&self) -> u64 {
        self.time_base.elapsed().as_millis() as u64
    }
}
