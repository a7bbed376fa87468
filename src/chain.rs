//! Chain-based synchronization for job completion tracking.
//!
//! A chain is an atomic counter borrowed from a fixed pool. `split` sets it to
//! the number of jobs submitted and every finished job decrements it; a fiber
//! that unchains on it is parked on the waiting list until it settles.
//!
//! Pool slots use the same claim pattern as the fiber lists: a vacant slot
//! holds a sentinel and is claimed with a compare-and-swap.

use crossbeam::utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicUsize, Ordering};

const VACANT: usize = usize::MAX;

/// Handle to a counter in the chain pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Chain {
    index: u32,
}

impl Chain {
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Chain {
            index: index as u32,
        }
    }
}

/// Fixed pool of chain counters.
pub(crate) struct ChainPool {
    slots: Box<[CachePadded<AtomicUsize>]>,
}

impl ChainPool {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity <= u32::MAX as usize);
        ChainPool {
            slots: (0..capacity)
                .map(|_| CachePadded::new(AtomicUsize::new(VACANT)))
                .collect(),
        }
    }

    /// Claims a vacant slot and sets it to `count`. Spins while the pool is
    /// exhausted.
    pub fn acquire(&self, count: usize) -> Chain {
        debug_assert!(count != VACANT);
        let backoff = Backoff::new();
        loop {
            if let Some(chain) = self.try_acquire(count) {
                return chain;
            }
            backoff.snooze();
        }
    }

    pub fn try_acquire(&self, count: usize) -> Option<Chain> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.load(Ordering::Relaxed) != VACANT {
                continue;
            }
            if slot
                .compare_exchange(VACANT, count, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(Chain::from_index(index));
            }
        }
        None
    }

    /// Decrements the counter. Returns true if this call brought it to zero.
    ///
    /// The finished job's writes are visible to whichever fiber observes the
    /// zero.
    pub fn signal(&self, chain: Chain) -> bool {
        let previous = self.slots[chain.index()].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(
            previous != 0 && previous != VACANT,
            "chain {} signalled while not counting",
            chain.index
        );
        previous == 1
    }

    /// Raw counter value. Reports `None` once the chain went back to the pool.
    pub fn value(&self, chain: Chain) -> Option<usize> {
        match self.slots[chain.index()].load(Ordering::Acquire) {
            VACANT => None,
            value => Some(value),
        }
    }

    /// A chain is settled once its count is zero or its holder released it.
    pub fn is_settled(&self, chain: Chain) -> bool {
        matches!(self.slots[chain.index()].load(Ordering::Acquire), 0 | VACANT)
    }

    /// Returns the slot to the pool. Not validated against other holders.
    pub fn release(&self, chain: Chain) {
        self.slots[chain.index()].store(VACANT, Ordering::Release);
    }

    /// Returns a chain that counted down to zero. A chain someone already
    /// released, and possibly re-acquired since, is left alone.
    pub fn retire(&self, chain: Chain) {
        let _ = self.slots[chain.index()].compare_exchange(
            0,
            VACANT,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Number of chains currently held.
    pub fn held(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.load(Ordering::Relaxed) != VACANT)
            .count()
    }
}
