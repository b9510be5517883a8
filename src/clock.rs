// PERCENTINEL JIFFY CLOCK
// ALL ENGINE TIME IS MEASURED IN JIFFIES: INTEGER TICKS AT A FIXED RATE.
// THE MONOTONIC VARIANT DERIVES JIFFIES FROM CLOCK_MONOTONIC; THE MANUAL
// VARIANT IS DRIVEN BY HAND SO WINDOW EXPIRY CAN BE TESTED DETERMINISTICALLY.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Jiffies per second. 1000 keeps jiffy and millisecond arithmetic aligned.
pub const DEFAULT_HZ: u64 = 1000;

#[derive(Clone)]
pub enum Clock {
    Monotonic { hz: u64 },
    Manual { hz: u64, now: Arc<AtomicU64> },
}

impl Clock {
    pub fn monotonic() -> Self {
        Clock::Monotonic { hz: DEFAULT_HZ }
    }

    /// Manual clock starting at `start` jiffies. Returns the clock and the
    /// handle that advances it.
    pub fn manual(start: u64) -> (Self, ManualClock) {
        let now = Arc::new(AtomicU64::new(start));
        let clock = Clock::Manual {
            hz: DEFAULT_HZ,
            now: Arc::clone(&now),
        };
        (clock, ManualClock { now })
    }

    pub fn hz(&self) -> u64 {
        match self {
            Clock::Monotonic { hz } => *hz,
            Clock::Manual { hz, .. } => *hz,
        }
    }

    /// Current time in jiffies.
    pub fn now(&self) -> u64 {
        match self {
            Clock::Monotonic { hz } => now_ns() / (1_000_000_000 / hz),
            Clock::Manual { now, .. } => now.load(Ordering::Acquire),
        }
    }

    pub fn jiffies_to_msecs(&self, jiffies: u64) -> u64 {
        jiffies.saturating_mul(1000) / self.hz()
    }

    pub fn msecs_to_jiffies(&self, msecs: u64) -> u64 {
        msecs.saturating_mul(self.hz()) / 1000
    }
}

/// Writer handle for a manual clock.
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn advance(&self, jiffies: u64) {
        self.now.fetch_add(jiffies, Ordering::Release);
    }

    pub fn set(&self, jiffies: u64) {
        self.now.store(jiffies, Ordering::Release);
    }

    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}
