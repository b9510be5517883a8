// PERCENTINEL SLIDING WINDOW RING
// ONE HISTOGRAM PER TIME INTERVAL, SLOTS REUSED IN PLACE AS TIME ADVANCES.
// NOTHING IS EVER FREED: A SLOT WHOSE INTERVAL STAMP NO LONGER MATCHES THE
// INTERVAL IT IS ADDRESSED FOR IS RESET BY EXACTLY ONE CALLER AND REUSED.
// A HANDFUL OF UPDATES MAY LAND IN THE WRONG EPOCH AROUND A RESET. TOLERATED.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::histogram::Ranges;

/// One ring slot: the histogram for one interval plus its epoch bookkeeping.
pub struct RbufEntry {
    pub ranges: Ranges,
    jtmistamp: AtomicU64,
    reset: AtomicI32,
}

impl RbufEntry {
    fn new() -> Self {
        Self {
            ranges: Ranges::new(),
            jtmistamp: AtomicU64::new(0),
            reset: AtomicI32::new(1),
        }
    }

    /// Jiffy at which this slot's interval began.
    pub fn interval_stamp(&self) -> u64 {
        self.jtmistamp.load(Ordering::Acquire)
    }

    /// Reset the slot if it is being addressed for a different interval than
    /// the one it holds. One caller wins the claim and clears the counters in
    /// place; losers proceed without resetting and may record a few hits into
    /// the stale epoch. The range boundaries survive: adaptation is not lost.
    pub fn check_reset(&self, jtmistart: u64) {
        if self.jtmistamp.load(Ordering::Acquire) == jtmistart {
            return;
        }
        if self.reset.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.ranges.clear_counters();
        self.jtmistamp.store(jtmistart, Ordering::Relaxed);
        // RELEASES THE CLEARED COUNTERS AND THE NEW STAMP TOGETHER
        self.reset.store(1, Ordering::Release);
    }
}

/// The ring of interval slots for one server.
pub struct Rbuf {
    entries: Vec<RbufEntry>,
    adjust_lock: Mutex<()>,
}

impl Rbuf {
    pub fn new(rbufsz: usize) -> Self {
        Self {
            entries: (0..rbufsz).map(|_| RbufEntry::new()).collect(),
            adjust_lock: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, i: usize) -> &RbufEntry {
        &self.entries[i]
    }

    pub fn entries(&self) -> &[RbufEntry] {
        &self.entries
    }

    /// Serialises boundary adjustments on the slot currently being fed.
    pub fn lock_adjust(&self) -> MutexGuard<'_, ()> {
        self.adjust_lock.lock()
    }
}

/// Cached aggregates for skipping needless recomputation.
///
/// `jtmwstamp` is the window start the cached counts were taken for,
/// `entry_cnt` the current slot's total at the last look, `total_cnt` the
/// sum across all slots at the last look.
#[derive(Clone, Copy, Debug, Default)]
pub struct RbufCtl {
    pub jtmwstamp: u64,
    pub entry_cnt: u64,
    pub total_cnt: u64,
}
