// PERCENTINEL ADAPTIVE HISTOGRAM
// FOUR LOG-BANDED RANGES, SIXTEEN BUCKETS EACH, SELF-TUNING BOUNDARIES.
//
// A RANGE IS DESCRIBED BY ONE PACKED CONTROL WORD (ORDER, BEGIN, END) SO AN
// OBSERVER ALWAYS SEES A SELF-CONSISTENT TUPLE FROM A SINGLE ATOMIC LOAD.
// BUCKET WIDTH INSIDE A RANGE IS 2^ORDER MILLISECONDS: FINE NEAR ZERO,
// COARSE AT THE TAIL, WHERE RELATIVE ERROR IS WHAT MATTERS.
//
// THE LEFT BOUND OF RANGE 0 IS PINNED AT 1MS AND NEVER MOVES. THE RIGHT
// BOUND OF THE LAST RANGE ONLY GROWS. ADJUSTMENT EITHER WIDENS THE GAPS
// BETWEEN RANGES (SHRINK LEFT) OR CLOSES THEM (GROW RIGHT), SO THE RANGES
// WORM RIGHTWARD AND CONVERGE AT THE LARGEST RESPONSE TIME SEEN.
//
// REBALANCING IS APPROXIMATE ON PURPOSE: A FEW HITS MAY BE LOST OR LAND IN
// A NEIGHBOURING BUCKET WHILE BOUNDARIES MOVE. TOLERATED.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::CachePadded;

pub const RANGES: usize = 4;
pub const LAST_RANGE: usize = RANGES - 1;
pub const BUCKETS: usize = 16;
pub const TOTAL_BUCKETS: usize = RANGES * BUCKETS;

/// Cursor value meaning "no live bucket left".
pub const VALUE_EXHAUSTED: u16 = u16::MAX;

// [1MS, 349MS] COVERS ALMOST ANY INSTALLATION, CROSS-ATLANTIC INCLUDED
const INIT_CTL: [RangeCtl; RANGES] = [
    RangeCtl {
        order: 0,
        begin: 1,
        end: 16,
    },
    RangeCtl {
        order: 1,
        begin: 17,
        end: 47,
    },
    RangeCtl {
        order: 2,
        begin: 48,
        end: 108,
    },
    RangeCtl {
        order: 4,
        begin: 109,
        end: 349,
    },
];

/// One range's control tuple. Packed into a single u64 for atomic access:
/// order in the low 32 bits, begin in 32..48, end in 48..64.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeCtl {
    pub order: u32,
    pub begin: u16,
    pub end: u16,
}

impl RangeCtl {
    pub const fn pack(self) -> u64 {
        (self.order as u64) | ((self.begin as u64) << 32) | ((self.end as u64) << 48)
    }

    pub const fn unpack(word: u64) -> Self {
        Self {
            order: word as u32,
            begin: (word >> 32) as u16,
            end: (word >> 48) as u16,
        }
    }
}

// END = BEGIN + (BUCKETS-1) * 2^ORDER, SATURATED AT THE u16 CEILING SO THE
// GROW LOOP TERMINATES FOR SAMPLES NEAR THE REPRESENTABLE MAXIMUM
fn range_end(begin: u16, order: u32) -> u16 {
    let end = begin as u32 + (((BUCKETS as u32) - 1) << order);
    end.min(u16::MAX as u32) as u16
}

/// Position of the next live (non-empty) bucket in a linear `(range, bucket)`
/// walk, together with the response time it stands for.
#[derive(Clone, Copy, Debug)]
pub struct BucketCursor {
    pub value: u16,
    pub idx: usize,
}

impl BucketCursor {
    pub fn range(&self) -> usize {
        self.idx / BUCKETS
    }

    pub fn bucket(&self) -> usize {
        self.idx % BUCKETS
    }

    pub fn exhausted(&self) -> bool {
        self.idx >= TOTAL_BUCKETS
    }
}

/// The adaptive histogram. Control words on their own cache lines, counters
/// on separate lines, so readers of one do not bounce the other.
#[repr(C)]
pub struct Ranges {
    ctl: [CachePadded<AtomicU64>; RANGES],
    tot_cnt: AtomicU64,
    tot_val: AtomicU64,
    min_val: AtomicU32,
    max_val: AtomicU32,
    cnt: [[AtomicU32; BUCKETS]; RANGES],
}

const ZERO_U32: AtomicU32 = AtomicU32::new(0);
const ZERO_ROW: [AtomicU32; BUCKETS] = [ZERO_U32; BUCKETS];

impl Ranges {
    pub fn new() -> Self {
        Self {
            ctl: std::array::from_fn(|r| CachePadded(AtomicU64::new(INIT_CTL[r].pack()))),
            tot_cnt: AtomicU64::new(0),
            tot_val: AtomicU64::new(0),
            min_val: AtomicU32::new(u32::MAX),
            max_val: AtomicU32::new(0),
            cnt: [ZERO_ROW; RANGES],
        }
    }

    pub fn ctl(&self, r: usize) -> RangeCtl {
        RangeCtl::unpack(self.ctl[r].0.load(Ordering::Relaxed))
    }

    fn set_ctl(&self, r: usize, pc: RangeCtl) {
        self.ctl[r].0.store(pc.pack(), Ordering::Relaxed);
    }

    pub fn total_count(&self) -> u64 {
        self.tot_cnt.load(Ordering::Acquire)
    }

    pub fn total_value(&self) -> u64 {
        self.tot_val.load(Ordering::Relaxed)
    }

    /// Smallest recorded value, or `u32::MAX` while empty.
    pub fn min_value(&self) -> u32 {
        self.min_val.load(Ordering::Relaxed)
    }

    pub fn max_value(&self) -> u32 {
        self.max_val.load(Ordering::Relaxed)
    }

    pub fn bucket_count(&self, r: usize, b: usize) -> u32 {
        self.cnt[r][b].load(Ordering::Relaxed)
    }

    /// Record one response time in milliseconds. Constant time: min/max CAS,
    /// one bucket increment, one bounded rebalancing check.
    ///
    /// Boundaries may move concurrently with the range search; the sample
    /// then lands one range off. Only correct indexing matters here.
    pub fn record(&self, rtt: u16) {
        // AT MOST ONE OF MIN/MAX MOVES PER SAMPLE
        if !self.adj_min(rtt) {
            self.adj_max(rtt);
        }
        self.tot_val.fetch_add(rtt as u64, Ordering::Relaxed);

        // BINARY SEARCH OVER THE SNAPSHOTTED RANGE BOUNDS
        let pc2 = self.ctl(2);
        if rtt <= pc2.end {
            let pc1 = self.ctl(1);
            if pc1.end < rtt {
                self.bump(2, pc2, rtt);
            } else {
                let pc0 = self.ctl(0);
                debug_assert_eq!(pc0.begin, 1); // LEFT BOUND NEVER MOVES
                if pc0.end < rtt {
                    self.bump(1, pc1, rtt);
                } else {
                    self.bump(0, pc0, rtt);
                }
            }
        } else {
            let mut pc3 = self.ctl(LAST_RANGE);
            if rtt > pc3.end {
                self.extend(rtt);
                pc3 = self.ctl(LAST_RANGE);
            }
            self.bump(LAST_RANGE, pc3, rtt);
        }

        // TOTAL GOES UP LAST: A READER THAT SEES N HERE HAS ALREADY SEEN
        // (NEARLY) N BUCKET INCREMENTS
        self.tot_cnt.fetch_add(1, Ordering::Release);
    }

    fn bump(&self, r: usize, pc: RangeCtl, rtt: u16) {
        self.cnt[r][Self::bucket_for(pc, rtt)].fetch_add(1, Ordering::Relaxed);
        self.adjust(r);
    }

    fn bucket_for(pc: RangeCtl, rtt: u16) -> usize {
        if rtt <= pc.begin {
            return 0;
        }
        let delta = (rtt - pc.begin) as u32;
        (((delta + (1 << pc.order) - 1) >> pc.order) as usize).min(BUCKETS - 1)
    }

    fn adj_min(&self, rtt: u16) -> bool {
        let mut cur = self.min_val.load(Ordering::Relaxed);
        while (rtt as u32) < cur {
            match self.min_val.compare_exchange_weak(
                cur,
                rtt as u32,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
        false
    }

    fn adj_max(&self, rtt: u16) -> bool {
        let mut cur = self.max_val.load(Ordering::Relaxed);
        while (rtt as u32) > cur {
            match self.max_val.compare_exchange_weak(
                cur,
                rtt as u32,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
        false
    }

    /// Grow the last range until it covers `rtt`, then fold its counters
    /// into the left half. Hits landing during the fold may be lost.
    fn extend(&self, rtt: u16) {
        let mut pc = self.ctl(LAST_RANGE);
        loop {
            pc.order += 1;
            pc.end = range_end(pc.begin, pc.order);
            if pc.end >= rtt {
                break;
            }
        }
        self.set_ctl(LAST_RANGE, pc);
        self.coalesce(LAST_RANGE);
    }

    // HALVE THE RESOLUTION: NEW BUCKET i TAKES OLD BUCKETS 2i AND 2i+1
    fn coalesce(&self, r: usize) {
        for i in 0..BUCKETS / 2 {
            let merged = self.cnt[r][2 * i].load(Ordering::Relaxed)
                + self.cnt[r][2 * i + 1].load(Ordering::Relaxed);
            self.cnt[r][i].store(merged, Ordering::Relaxed);
        }
    }

    /// Check range `r` for a dominating bucket and rebalance if one exists.
    /// An outlier is a bucket holding more than twice the per-live-bucket
    /// average of its range.
    fn adjust(&self, r: usize) {
        let mut live = 0u64;
        let mut sum = 0u64;
        let mut max = 0u64;
        let mut i_max = 0usize;

        for i in 0..BUCKETS {
            let c = self.cnt[r][i].load(Ordering::Relaxed) as u64;
            if c != 0 {
                sum += c;
                live += 1;
            }
            if max < c {
                max = c;
                i_max = i;
            }
        }
        if live == 0 || max <= sum * 2 / live {
            return;
        }

        if r > 0 && i_max == 0 {
            // THE OVERLOADED BUCKET SITS IN THE GAP BELOW THIS RANGE: PULL
            // THE PREVIOUS RANGE'S RIGHT BOUND UP IF DOUBLING IT STILL FITS
            let pc_curr = self.ctl(r);
            let mut pc = self.ctl(r - 1);
            if (pc.begin as u32) + (((BUCKETS as u32) - 1) << (pc.order + 1)) < pc_curr.begin as u32
            {
                pc.order += 1;
                pc.end = range_end(pc.begin, pc.order);
                self.set_ctl(r - 1, pc);
                self.coalesce(r - 1);

                // SMEAR THE GAP HITS EVENLY OVER THE FRESH RIGHT HALF.
                // A ROUGH APPROXIMATION, LIKE EVERYTHING ELSE HERE.
                let spread = max / (BUCKETS as u64 / 2 + 1);
                self.cnt[r][0].fetch_sub(spread as u32 * (BUCKETS as u32 / 2), Ordering::Relaxed);
                for i in BUCKETS / 2..BUCKETS {
                    self.cnt[r - 1][i].store(spread as u32, Ordering::Relaxed);
                }
            }
            // FALL THROUGH: BUCKET 0 STILL CARRIES EXTRA WEIGHT, SO THE
            // SHRINK BELOW MOVES THIS RANGE'S LEFT BOUND RIGHT AND THE GAP
            // GETS ANOTHER LOOK NEXT TIME
        }

        // RANGE 0 NEVER SHRINKS: ITS LEFT BOUND IS PINNED
        if r == 0 {
            return;
        }
        let pc = self.ctl(r);
        if pc.order > 0 {
            self.shrink_left(pc, r);
        }
    }

    /// Halve the bucket width of range `r` by moving its left bound right.
    /// The left half collapses into bucket 0, each right-half bucket splits
    /// in two.
    fn shrink_left(&self, mut pc: RangeCtl, r: usize) {
        pc.order -= 1;
        pc.begin = (pc.end as u32).saturating_sub(((BUCKETS as u32) - 1) << pc.order) as u16;
        self.set_ctl(r, pc);

        for i in 1..BUCKETS / 2 {
            let c = self.cnt[r][i].load(Ordering::Relaxed);
            self.cnt[r][0].fetch_add(c, Ordering::Relaxed);
        }
        let full = self.cnt[r][BUCKETS / 2].load(Ordering::Relaxed);
        let half = full / 2;
        self.cnt[r][0].fetch_add(half, Ordering::Relaxed);
        self.cnt[r][1].store(full - half, Ordering::Relaxed);
        for i in 1..BUCKETS / 2 {
            let full = self.cnt[r][BUCKETS / 2 + i].load(Ordering::Relaxed);
            let half = full / 2;
            self.cnt[r][2 * i].store(half, Ordering::Relaxed);
            self.cnt[r][2 * i + 1].store(full - half, Ordering::Relaxed);
        }
    }

    /// Zero every counter. The control words are untouched: the boundaries a
    /// slot has converged to survive its reuse.
    pub fn clear_counters(&self) {
        self.tot_cnt.store(0, Ordering::Relaxed);
        self.tot_val.store(0, Ordering::Relaxed);
        self.min_val.store(u32::MAX, Ordering::Relaxed);
        self.max_val.store(0, Ordering::Relaxed);
        for row in &self.cnt {
            for c in row {
                c.store(0, Ordering::Relaxed);
            }
        }
    }

    /// First live bucket at or after linear position `idx`.
    pub fn live_bucket_from(&self, mut idx: usize) -> BucketCursor {
        while idx < TOTAL_BUCKETS {
            let (r, b) = (idx / BUCKETS, idx % BUCKETS);
            if self.cnt[r][b].load(Ordering::Relaxed) != 0 {
                let pc = self.ctl(r);
                let value = (pc.begin as u32 + ((b as u32) << pc.order)).min(u16::MAX as u32);
                return BucketCursor {
                    value: value as u16,
                    idx,
                };
            }
            idx += 1;
        }
        BucketCursor {
            value: VALUE_EXHAUSTED,
            idx: TOTAL_BUCKETS,
        }
    }
}

impl Default for Ranges {
    fn default() -> Self {
        Self::new()
    }
}
