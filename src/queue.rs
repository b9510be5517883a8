// PERCENTINEL INGEST QUEUE
// BOUNDED LOCK-FREE MPSC RING, ONE PER CPU. REQUEST THREADS PUSH, THE
// AGGREGATOR POPS. PUSH NEVER BLOCKS: A FULL RING REJECTS THE SAMPLE AND
// THE CALLER DROPS IT. LOSING A SAMPLE BEATS STALLING A REQUEST.
//
// EACH SLOT CARRIES A SEQUENCE NUMBER. A PRODUCER CLAIMS A SLOT BY CAS ON
// THE TAIL, WRITES THE ITEM, THEN PUBLISHES WITH A RELEASE STORE OF THE
// SLOT SEQUENCE. THE SINGLE CONSUMER NEEDS NO CAS AT ALL. UNBOUNDED u64
// POSITIONS MAKE ABA A NON-ISSUE.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::CachePadded;

struct Slot<T> {
    seq: AtomicU64,
    item: UnsafeCell<MaybeUninit<T>>,
}

pub struct IngestQueue<T> {
    mask: u64,
    slots: Box<[Slot<T>]>,
    // PRODUCERS HAMMER THE TAIL, THE CONSUMER OWNS THE HEAD: SEPARATE LINES
    tail: CachePadded<AtomicU64>,
    head: CachePadded<AtomicU64>,
}

unsafe impl<T: Send> Send for IngestQueue<T> {}
unsafe impl<T: Send> Sync for IngestQueue<T> {}

impl<T> IngestQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicU64::new(i as u64),
                item: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            mask: (capacity - 1) as u64,
            slots,
            tail: CachePadded(AtomicU64::new(0)),
            head: CachePadded(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.0.load(Ordering::Relaxed) == self.tail.0.load(Ordering::Relaxed)
    }

    /// Non-blocking push from any thread. Returns the item back when the
    /// ring is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut pos = self.tail.0.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            if seq == pos {
                match self.tail.0.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.item.get()).write(item) };
                        slot.seq.store(pos + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(seen) => pos = seen,
                }
            } else if seq < pos {
                // CONSUMER HAS NOT FREED THIS SLOT YET: RING IS FULL
                return Err(item);
            } else {
                pos = self.tail.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Single-consumer pop. Only the aggregator calls this.
    pub fn pop(&self) -> Option<T> {
        let pos = self.head.0.load(Ordering::Relaxed);
        let slot = &self.slots[(pos & self.mask) as usize];
        if slot.seq.load(Ordering::Acquire) != pos + 1 {
            return None;
        }
        self.head.0.store(pos + 1, Ordering::Relaxed);
        let item = unsafe { (*slot.item.get()).assume_init_read() };
        // HAND THE SLOT BACK TO PRODUCERS, ONE LAP AHEAD
        slot.seq.store(pos + self.mask + 1, Ordering::Release);
        Some(item)
    }
}

impl<T> Drop for IngestQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
