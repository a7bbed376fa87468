use crate::chain::{Chain, ChainPool};
use crate::fiber::{Fiber, FiberSlot};
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Sentinel for an empty free/waiting slot.
pub(crate) const NO_FIBER: usize = usize::MAX;
const NO_CHAIN: usize = usize::MAX;

/// The fixed arena of fibers, plus the free and waiting slot arrays that
/// decide which thread owns which fiber.
///
/// `free[i]` and `waiting[i]` hold either `i` (fiber `i` is available in that
/// role) or `NO_FIBER`. Claiming a fiber is a compare-and-swap of its slot to
/// `NO_FIBER`; the winner owns the fiber until it stores the index back into
/// one of the two arrays.
pub(crate) struct FiberPool {
    fibers: Box<[FiberSlot]>,
    free: Box<[AtomicUsize]>,
    waiting: Box<[AtomicUsize]>,
    /// Chain each waiting fiber is parked on, or `NO_CHAIN` for a plain yield.
    waiting_on: Box<[AtomicUsize]>,
}

impl FiberPool {
    /// Reserves `count` fibers with `stack_size`-byte stacks, all free.
    pub fn new(count: usize, stack_size: usize) -> std::io::Result<Self> {
        let fibers = (0..count)
            .map(|i| Fiber::new(i, stack_size).map(FiberSlot::new))
            .collect::<std::io::Result<Vec<_>>>()?
            .into_boxed_slice();

        Ok(FiberPool {
            fibers,
            free: (0..count).map(AtomicUsize::new).collect(),
            waiting: (0..count).map(|_| AtomicUsize::new(NO_FIBER)).collect(),
            waiting_on: (0..count).map(|_| AtomicUsize::new(NO_CHAIN)).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.fibers.len()
    }

    /// # Safety
    /// The caller must own fiber `index` (it claimed it and has not released it).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn fiber_mut(&self, index: usize) -> &mut Fiber {
        unsafe { self.fibers[index].get_mut() }
    }

    /// Claims the first free fiber found, if any.
    pub fn try_acquire_free(&self) -> Option<usize> {
        for (index, slot) in self.free.iter().enumerate() {
            if slot.load(Ordering::Relaxed) == NO_FIBER {
                continue;
            }
            // Confirm the relaxed read was not stale before contending for it.
            if slot.load(Ordering::Acquire) != index {
                continue;
            }
            if slot
                .compare_exchange(index, NO_FIBER, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                debug_assert!(
                    !self.is_waiting(index),
                    "fiber {index} claimed from the free list while waiting"
                );
                return Some(index);
            }
        }
        None
    }

    /// Spins until a fiber comes back to the free list. Fibers are never
    /// created at runtime, only recycled.
    pub fn acquire_free(&self, mut on_spin: impl FnMut()) -> usize {
        let backoff = Backoff::new();
        loop {
            if let Some(index) = self.try_acquire_free() {
                return index;
            }
            on_spin();
            backoff.snooze();
        }
    }

    /// Only the thread that last drove the fiber calls this, so the store
    /// never races with another writer of the same slot.
    pub fn release_to_free(&self, index: usize) {
        debug_assert_eq!(self.free[index].load(Ordering::Relaxed), NO_FIBER);
        debug_assert_eq!(self.waiting[index].load(Ordering::Relaxed), NO_FIBER);
        self.free[index].store(index, Ordering::Release);
    }

    /// Parks the fiber on `chain` and publishes it on the waiting list.
    pub fn release_to_waiting(&self, index: usize, chain: Option<Chain>) {
        debug_assert_eq!(self.free[index].load(Ordering::Relaxed), NO_FIBER);
        let chain = chain.map_or(NO_CHAIN, Chain::index);
        self.waiting_on[index].store(chain, Ordering::Relaxed);
        self.waiting[index].store(index, Ordering::Release);
    }

    /// Claims a waiting fiber whose chain has settled. A fiber parked without
    /// a chain is ready immediately.
    pub fn find_ready_waiting(&self, chains: &ChainPool) -> Option<usize> {
        for (index, slot) in self.waiting.iter().enumerate() {
            if slot.load(Ordering::Relaxed) == NO_FIBER {
                continue;
            }
            if slot.load(Ordering::Acquire) != index {
                continue;
            }
            let ready = match self.waiting_on[index].load(Ordering::Relaxed) {
                NO_CHAIN => true,
                chain => chains.is_settled(Chain::from_index(chain)),
            };
            if !ready {
                continue;
            }
            if slot
                .compare_exchange(index, NO_FIBER, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                debug_assert!(
                    !self.is_free(index),
                    "fiber {index} claimed from the waiting list while free"
                );
                return Some(index);
            }
        }
        None
    }

    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free
            .iter()
            .enumerate()
            .filter(|(i, slot)| slot.load(Ordering::Acquire) == *i)
            .count()
    }

    #[cfg(test)]
    pub fn waiting_count(&self) -> usize {
        self.waiting
            .iter()
            .enumerate()
            .filter(|(i, slot)| slot.load(Ordering::Acquire) == *i)
            .count()
    }

    pub fn is_free(&self, index: usize) -> bool {
        self.free[index].load(Ordering::Acquire) == index
    }

    pub fn is_waiting(&self, index: usize) -> bool {
        self.waiting[index].load(Ordering::Acquire) == index
    }
}
