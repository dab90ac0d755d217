//! Bounded lock-free ring used single-producer/single-consumer.
//!
//! Each cell carries its own sequence counter: a producer may write cell
//! `i` when the counter equals the enqueue position, then bumps it by one;
//! a consumer may read when it equals position + 1 and bumps it by the
//! capacity. The cells store pool slot indices, so no pointers cross the
//! thread boundary.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

struct Cell {
    sequence: AtomicUsize,
    value: AtomicU32,
}

pub struct SpscRing {
    cells: Box<[Cell]>,
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

impl SpscRing {
    /// Capacity is rounded up to the next power of two (minimum 2).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let cells = (0..capacity)
            .map(|i| Cell {
                sequence: AtomicUsize::new(i),
                value: AtomicU32::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            cells,
            mask: capacity - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub fn try_push(&self, value: u32) -> bool {
        let pos = self.enqueue_pos.load(Ordering::Relaxed);
        let cell = &self.cells[pos & self.mask];
        let seq = cell.sequence.load(Ordering::Acquire);
        if seq != pos {
            // Behind: the consumer has not freed this cell yet, queue full.
            return false;
        }
        cell.value.store(value, Ordering::Relaxed);
        self.enqueue_pos.store(pos + 1, Ordering::Relaxed);
        cell.sequence.store(pos + 1, Ordering::Release);
        true
    }

    pub fn try_pop(&self) -> Option<u32> {
        let pos = self.dequeue_pos.load(Ordering::Relaxed);
        let cell = &self.cells[pos & self.mask];
        let seq = cell.sequence.load(Ordering::Acquire);
        if seq != pos + 1 {
            return None;
        }
        let value = cell.value.load(Ordering::Relaxed);
        self.dequeue_pos.store(pos + 1, Ordering::Relaxed);
        cell.sequence
            .store(pos + self.cells.len(), Ordering::Release);
        Some(value)
    }

    /// Approximate occupancy; exact only when both sides are quiescent.
    pub fn len(&self) -> usize {
        let enq = self.enqueue_pos.load(Ordering::Acquire);
        let deq = self.dequeue_pos.load(Ordering::Acquire);
        enq.saturating_sub(deq)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
