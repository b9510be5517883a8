// PERCENTINEL PUBLISHED STATS
// ONE ENGINE-WIDE PERCENTILE SET FOR EVERY SERVER AND EVERY CONSUMER.
// PUBLICATION IS A FLIP-FLOP PAIR: THE AGGREGATOR WRITES THE IDLE SLOT AND
// FLIPS THE READ INDEX INSIDE THE WRITE LOCK; READERS COPY THE COMMITTED
// SLOT UNDER ITS READ LOCK. ONE WRITER, MANY READERS, MINIMAL CONTENTION.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

pub const IDX_MIN: usize = 0;
pub const IDX_MAX: usize = 1;
pub const IDX_AVG: usize = 2;
/// First quantile slot; everything below is MIN/MAX/AVG.
pub const IDX_ITH: usize = 3;

pub const PSTATS_LEN: usize = 8;

/// The engine-wide percentile layout. Slots 0..3 are MIN, MAX, AVG; the
/// rest are quantile targets in percent. Consumers use this set verbatim.
pub const PSTATS_ITH: [u32; PSTATS_LEN] = [0, 0, 0, 50, 75, 90, 95, 99];

/// A caller-owned snapshot of one server's published stats.
pub struct PercentileStats {
    pub ith: &'static [u32],
    pub val: [u32; PSTATS_LEN],
    /// Publication sequence of the last snapshot taken into `val`.
    pub seq: u32,
}

impl PercentileStats {
    pub fn new() -> Self {
        Self {
            ith: &PSTATS_ITH,
            val: [0; PSTATS_LEN],
            seq: 0,
        }
    }
}

impl Default for PercentileStats {
    fn default() -> Self {
        Self::new()
    }
}

/// True iff the caller uses the engine's percentile set.
pub fn pstats_verify(pstats: &PercentileStats) -> bool {
    pstats.ith.len() == PSTATS_LEN && pstats.ith.iter().eq(PSTATS_ITH.iter())
}

/// The double-buffered publication pair.
pub(crate) struct StatsPair {
    sents: [RwLock<[u32; PSTATS_LEN]>; 2],
    rdidx: AtomicU32,
}

impl StatsPair {
    pub fn new() -> Self {
        Self {
            sents: [
                RwLock::new([0; PSTATS_LEN]),
                RwLock::new([0; PSTATS_LEN]),
            ],
            rdidx: AtomicU32::new(0),
        }
    }

    /// Aggregator side: write the idle slot, then flip readers onto it.
    /// The index bump happens inside the write lock so a reader that wins
    /// the new index always finds the new values.
    pub fn publish(&self, val: &[u32; PSTATS_LEN]) {
        let rdidx = self.rdidx.load(Ordering::Acquire);
        let mut slot = self.sents[((rdidx + 1) % 2) as usize].write();
        *slot = *val;
        self.rdidx.fetch_add(1, Ordering::Release);
    }

    /// Reader side: copy the committed slot, stamp the sequence, report
    /// whether anything was republished since the caller's last look.
    pub fn snapshot(&self, out: &mut PercentileStats) -> bool {
        let rdidx = self.rdidx.load(Ordering::Acquire);
        {
            let slot = self.sents[(rdidx % 2) as usize].read();
            out.val = *slot;
        }
        let prev = out.seq;
        out.seq = rdidx;
        prev != rdidx
    }
}
