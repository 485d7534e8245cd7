//! Pseudo-real-time clock sources.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tela_wire::epoch::{self, EpochTime};

/// Source of the platform's GPS-epoch time.
///
/// The value 0 means "no time knowledge"; consumers fall back to
/// untimestamped behavior in that case.
pub trait Clock: Send + Sync {
    /// Current epoch time in 48.16 fixed-point ticks.
    fn epoch_time_now(&self) -> EpochTime;

    /// Current epoch time in whole seconds.
    fn epoch_seconds_now(&self) -> u32 {
        epoch::seconds(self.epoch_time_now())
    }

    /// Current key-rotation index (days since the GPS epoch).
    fn rotation_now(&self) -> u32 {
        epoch::rotation_index(self.epoch_time_now())
    }
}

/// Clock backed by the operating system time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch_time_now(&self) -> EpochTime {
        let Ok(since_unix) = SystemTime::now().duration_since(UNIX_EPOCH) else {
            // Pre-1970 system clock: report no time knowledge.
            return 0;
        };
        let gps_secs = epoch::gps_seconds_from_unix(since_unix.as_secs());
        let subsec = (u64::from(since_unix.subsec_nanos()) << 16) / 1_000_000_000;
        #[allow(clippy::cast_possible_truncation)]
        epoch::from_parts(gps_secs, subsec as u16)
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug, Default)]
pub struct TestClock {
    now: AtomicU64,
}

impl TestClock {
    /// Create a test clock at the given epoch time.
    #[must_use]
    pub fn new(now: EpochTime) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    /// Set the current time.
    pub fn set(&self, now: EpochTime) {
        self.now.store(now, Ordering::Relaxed);
    }

    /// Advance the current time by `ticks`.
    pub fn advance(&self, ticks: u64) {
        self.now.fetch_add(ticks, Ordering::Relaxed);
    }
}

impl Clock for TestClock {
    fn epoch_time_now(&self) -> EpochTime {
        self.now.load(Ordering::Relaxed)
    }
}
