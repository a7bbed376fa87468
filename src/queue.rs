//! Bounded lock-free multi-producer/multi-consumer queue.
//!
//! This is Dmitry Vyukov's bounded MPMC ring: every cell carries a sequence
//! number that tells producers and consumers whether the cell is ready for
//! their role at the current lap around the ring. A cursor is only advanced
//! by a successful compare-and-swap, so each value is written exactly once and
//! read exactly once.
//!
//! The queue never blocks and never allocates after construction. `push`
//! fails only when the ring is full, `pop` fails only when it is empty.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Cell<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity ring of sequenced cells. Capacity is always a power of two.
pub struct BoundedQueue<T> {
    cells: Box<[Cell<T>]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

// SAFETY: a value is handed from exactly one producer to exactly one consumer;
// the sequence protocol makes the hand-off a release/acquire pair.
unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `1 << log2_capacity` values. The ring
    /// needs at least two cells to tell a full cell from an empty one.
    pub fn with_log2_capacity(log2_capacity: u32) -> Self {
        assert!(log2_capacity >= 1, "queue needs at least two cells");
        let capacity = 1usize << log2_capacity;
        let cells = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        BoundedQueue {
            cells,
            mask: capacity - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Bytes a queue of `capacity` cells occupies.
    pub fn footprint(capacity: usize) -> usize {
        capacity
            .saturating_mul(std::mem::size_of::<Cell<T>>())
            .saturating_add(2 * std::mem::size_of::<CachePadded<AtomicUsize>>())
    }

    /// Maximum number of undelivered values.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Appends a value, handing it back if every cell is occupied.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS grants exclusive write access to
                        // this cell until its sequence is published below.
                        unsafe { (*cell.value.get()).write(value) };
                        cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                // The consumer one lap behind has not drained this cell yet.
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Removes the oldest available value, or `None` when the ring is empty.
    pub fn pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let cell = &self.cells[pos & self.mask];
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the producer published this cell with a release
                        // store and the CAS makes us its only reader.
                        let value = unsafe { (*cell.value.get()).assume_init_read() };
                        cell.sequence
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Approximate number of queued values. Exact only when no other thread
    /// is pushing or popping.
    pub fn len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Relaxed);
        let head = self.dequeue_pos.load(Ordering::Relaxed);
        tail.wrapping_sub(head).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for BoundedQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn test_fifo_single_thread() {
        let queue = BoundedQueue::with_log2_capacity(3);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.len(), 5);
        for i in 0..5 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_is_enforced() {
        let queue = BoundedQueue::with_log2_capacity(4);
        assert_eq!(queue.capacity(), 16);
        for i in 0..16 {
            assert!(queue.push(i).is_ok());
        }
        assert_eq!(queue.push(99), Err(99));

        // Existing entries are untouched by the rejected push.
        for i in 0..16 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_wraparound_many_laps() {
        let queue = BoundedQueue::with_log2_capacity(2);
        for lap in 0..100 {
            for i in 0..3 {
                queue.push(lap * 10 + i).unwrap();
            }
            for i in 0..3 {
                assert_eq!(queue.pop(), Some(lap * 10 + i));
            }
        }
    }

    #[test]
    fn test_two_cell_queue() {
        let queue = BoundedQueue::with_log2_capacity(1);
        assert_eq!(queue.capacity(), 2);
        queue.push("a").unwrap();
        queue.push("b").unwrap();
        assert_eq!(queue.push("c"), Err("c"));
        assert_eq!(queue.pop(), Some("a"));
        queue.push("d").unwrap();
        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), Some("d"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    #[should_panic(expected = "at least two cells")]
    fn test_single_cell_queue_is_rejected() {
        let _queue = BoundedQueue::<u32>::with_log2_capacity(0);
    }

    #[test]
    fn test_drop_releases_pending_values() {
        let marker = Arc::new(());
        {
            let queue = BoundedQueue::with_log2_capacity(3);
            for _ in 0..4 {
                queue.push(marker.clone()).unwrap();
            }
            assert_eq!(Arc::strong_count(&marker), 5);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_concurrent_no_loss_no_duplicates() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;

        let queue = Arc::new(BoundedQueue::with_log2_capacity(6));
        let done = Arc::new(AtomicBool::new(false));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut value = p * PER_PRODUCER + i;
                        while let Err(v) = queue.push(value) {
                            value = v;
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = queue.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        match queue.pop() {
                            Some(v) => seen.push(v),
                            None if done.load(Ordering::Acquire) => {
                                // Drain whatever was published before the flag.
                                while let Some(v) = queue.pop() {
                                    seen.push(v);
                                }
                                break;
                            }
                            None => std::hint::spin_loop(),
                        }
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        done.store(true, Ordering::Release);

        let mut all = HashSet::new();
        let mut total = 0;
        for c in consumers {
            for v in c.join().unwrap() {
                assert!(all.insert(v), "value {} delivered twice", v);
                total += 1;
            }
        }
        assert_eq!(total, PRODUCERS * PER_PRODUCER);
    }
}
