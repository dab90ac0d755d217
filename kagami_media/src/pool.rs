//! Preallocated frame pool with lock-free acquire/release.
//!
//! Slot ownership protocol: a slot is claimed by a compare-exchange on its
//! `in_use` flag, written by exactly one producer while the refcount is 1,
//! then handed through the ring or mailbox to exactly one consumer. The
//! short mutex exists only for reallocation on resize; it is never taken on
//! the acquire/release hot path unless a slot's dimensions are stale.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::frame::{FrameBuffer, FrameMeta, PlaneGeometry};

pub const MAX_POOL_SLOTS: usize = 16;

struct Slot {
    in_use: AtomicBool,
    refcount: AtomicU32,
    buffer: UnsafeCell<FrameBuffer>,
    meta: UnsafeCell<FrameMeta>,
}

// Slot contents are only touched by the handle holder; the atomics carry the
// release/acquire edges between producer and consumer.
unsafe impl Sync for Slot {}

pub struct FramePool {
    slots: Box<[Slot]>,
    /// Published dimensions, `(width << 32) | height`.
    dims: AtomicU64,
    resize_lock: Mutex<()>,
}

impl FramePool {
    pub fn new(pool_size: usize, width: u32, height: u32) -> Arc<Self> {
        let pool_size = pool_size.clamp(1, MAX_POOL_SLOTS);
        let slots = (0..pool_size)
            .map(|_| Slot {
                in_use: AtomicBool::new(false),
                refcount: AtomicU32::new(0),
                buffer: UnsafeCell::new(FrameBuffer::allocate(width, height)),
                meta: UnsafeCell::new(FrameMeta::default()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Arc::new(Self {
            slots,
            dims: AtomicU64::new(pack_dims(width, height)),
            resize_lock: Mutex::new(()),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        unpack_dims(self.dims.load(Ordering::Acquire))
    }

    pub fn available(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.in_use.load(Ordering::Relaxed))
            .count()
    }

    pub fn used(&self) -> usize {
        self.pool_size() - self.available()
    }

    /// Claim an idle slot. Linear CAS scan; fair enough at these pool sizes
    /// and contention-free with a single producer.
    pub fn acquire(self: &Arc<Self>) -> Option<FrameHandle> {
        let (width, height) = self.dimensions();
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // A slot that slept through a resize is refreshed here, off
                // the common path, under the resize lock.
                let geometry = unsafe { (*slot.buffer.get()).geometry() };
                if geometry.width != width || geometry.height != height {
                    let _guard = self.resize_lock.lock();
                    unsafe {
                        *slot.buffer.get() = FrameBuffer::allocate(width, height);
                    }
                }
                slot.refcount.store(1, Ordering::Release);
                unsafe {
                    *slot.meta.get() = FrameMeta::default();
                }
                return Some(FrameHandle {
                    pool: self.clone(),
                    slot: index as u32,
                });
            }
        }
        None
    }

    /// Publish new dimensions and refresh every idle slot. Slots currently
    /// in flight keep their old allocation and are refreshed on their next
    /// acquire.
    pub fn resize(&self, width: u32, height: u32) {
        if self.dimensions() == (width, height) {
            return;
        }
        let _guard = self.resize_lock.lock();
        self.dims.store(pack_dims(width, height), Ordering::Release);
        for slot in self.slots.iter() {
            if !slot.in_use.load(Ordering::Acquire) {
                unsafe {
                    *slot.buffer.get() = FrameBuffer::allocate(width, height);
                }
            }
        }
    }

    pub(crate) fn retain_slot(&self, slot: u32) {
        self.slots[slot as usize]
            .refcount
            .fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_slot(&self, slot: u32) {
        let s = &self.slots[slot as usize];
        if s.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            s.in_use.store(false, Ordering::Release);
        }
    }

    pub(crate) fn handle_from_slot(self: &Arc<Self>, slot: u32) -> FrameHandle {
        FrameHandle {
            pool: self.clone(),
            slot,
        }
    }
}

fn pack_dims(width: u32, height: u32) -> u64 {
    ((width as u64) << 32) | height as u64
}

fn unpack_dims(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

/// Owning view of one pool slot. Dropping it releases the reference; the
/// slot returns to idle when the count reaches zero.
pub struct FrameHandle {
    pool: Arc<FramePool>,
    slot: u32,
}

impl FrameHandle {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn geometry(&self) -> PlaneGeometry {
        self.buffer().geometry()
    }

    pub fn meta(&self) -> &FrameMeta {
        unsafe { &*self.pool.slots[self.slot as usize].meta.get() }
    }

    pub fn meta_mut(&mut self) -> &mut FrameMeta {
        unsafe { &mut *self.pool.slots[self.slot as usize].meta.get() }
    }

    pub fn buffer(&self) -> &FrameBuffer {
        unsafe { &*self.pool.slots[self.slot as usize].buffer.get() }
    }

    pub fn buffer_mut(&mut self) -> &mut FrameBuffer {
        unsafe { &mut *self.pool.slots[self.slot as usize].buffer.get() }
    }

    /// Surrender ownership without releasing; used when the slot index is
    /// parked in the ring or mailbox.
    pub(crate) fn into_raw_slot(self) -> u32 {
        let slot = self.slot;
        std::mem::forget(self);
        slot
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        self.pool.release_slot(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_exhausts_at_pool_size() {
        let pool = FramePool::new(4, 320, 240);
        let handles: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.available(), 0);
        drop(handles);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn refcount_keeps_slot_busy() {
        let pool = FramePool::new(2, 64, 64);
        let handle = pool.acquire().unwrap();
        let slot = handle.slot();
        pool.retain_slot(slot);
        drop(handle);
        // Still referenced by the retain.
        assert_eq!(pool.available(), 1);
        pool.release_slot(slot);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn resize_refreshes_idle_but_not_busy_slots() {
        let pool = FramePool::new(2, 640, 480);
        let held = pool.acquire().unwrap();
        pool.resize(1280, 720);

        // The held frame keeps its old allocation until released.
        assert_eq!(held.geometry().width, 640);

        // A fresh acquire sees the new dimensions, whichever slot it lands
        // on: the idle slot was reallocated eagerly and a reused slot is
        // refreshed inside acquire.
        let fresh = pool.acquire().unwrap();
        assert_eq!(fresh.geometry().width, 1280);
        assert_eq!(fresh.geometry().height, 720);

        drop(held);
        let reused = pool.acquire().unwrap();
        assert_eq!(reused.geometry().width, 1280);
    }

    #[test]
    fn acquired_frame_starts_with_refcount_one_and_clean_meta() {
        let pool = FramePool::new(1, 16, 16);
        {
            let mut h = pool.acquire().unwrap();
            h.meta_mut().sequence = 42;
            h.meta_mut().pts = 7;
        }
        let h = pool.acquire().unwrap();
        assert_eq!(h.meta().sequence, 0);
        assert_eq!(h.meta().pts, 0);
    }
}
