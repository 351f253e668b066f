use std::time::{Duration, Instant};

#[cfg(feature = "mimalloc")]
mod mimalloc {
    use mimalloc::MiMalloc;

    #[global_allocator]
    static GLOBAL: MiMalloc = MiMalloc;
}

/// Fires at most once per `interval`; a zero interval never fires.
#[derive(Debug)]
pub struct Ticker {
    interval: Duration,
    last: Instant,
}

impl Ticker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    pub fn ready(&mut self, now: Instant) -> bool {
        if self.interval.is_zero() || now.duration_since(self.last) < self.interval {
            return false;
        }
        self.last = now;
        true
    }
}
