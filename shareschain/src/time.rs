//! Epoch time
//!
//! All protocol timestamps are whole seconds since the chain epoch. The
//! clock is injected so tests can drive forging deterministically.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of wall-clock milliseconds
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> i64;
}

/// Operating system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: i64) {
        self.millis.fetch_add(secs * 1000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Convert Unix milliseconds to epoch seconds, rounding to nearest
pub fn to_epoch_time(millis: i64, epoch_beginning_ms: i64) -> i32 {
    ((millis - epoch_beginning_ms + 500) / 1000) as i32
}

/// Convert epoch seconds back to Unix milliseconds
pub fn from_epoch_time(epoch_time: i32, epoch_beginning_ms: i64) -> i64 {
    epoch_time as i64 * 1000 + epoch_beginning_ms - 500
}

/// Clock bound to a chain epoch
#[derive(Clone)]
pub struct Timekeeper {
    clock: Arc<dyn Clock>,
    epoch_beginning_ms: i64,
}

impl Timekeeper {
    pub fn new(clock: Arc<dyn Clock>, epoch_beginning_ms: i64) -> Self {
        Self {
            clock,
            epoch_beginning_ms,
        }
    }

    /// Current Unix milliseconds
    pub fn millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Current epoch time in seconds
    pub fn epoch_time(&self) -> i32 {
        to_epoch_time(self.clock.now_millis(), self.epoch_beginning_ms)
    }

    /// Unix milliseconds of an epoch timestamp
    pub fn to_millis(&self, epoch_time: i32) -> i64 {
        from_epoch_time(epoch_time, self.epoch_beginning_ms)
    }

    pub fn epoch_beginning_ms(&self) -> i64 {
        self.epoch_beginning_ms
    }
}

impl std::fmt::Debug for Timekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timekeeper")
            .field("epoch_beginning_ms", &self.epoch_beginning_ms)
            .field("epoch_time", &self.epoch_time())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_round_trip() {
        let epoch = 1_514_764_800_000;
        assert_eq!(to_epoch_time(epoch, epoch), 0);
        assert_eq!(to_epoch_time(epoch + 1_499, epoch), 1);
        assert_eq!(to_epoch_time(epoch + 1_500, epoch), 2);
        assert_eq!(to_epoch_time(from_epoch_time(1234, epoch), epoch), 1234);
    }

    #[test]
    fn test_manual_clock() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let keeper = Timekeeper::new(clock.clone(), 0);
        assert_eq!(keeper.epoch_time(), 1000);
        clock.advance_secs(60);
        assert_eq!(keeper.epoch_time(), 1060);
    }
}
