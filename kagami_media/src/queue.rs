//! Frame queue: the pool and the ring glued together, plus adaptive jitter
//! tracking that decides when the consumer should skip to the newest frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::pool::{FrameHandle, FramePool};
use crate::spsc::SpscRing;

/// Above this average inter-arrival deviation the consumer drops to the
/// newest frame instead of draining in order.
pub const JITTER_SKIP_THRESHOLD_MS: f64 = 8.0;

/// Queue depth at which backlog skipping kicks in regardless of jitter.
pub const DEPTH_SKIP_THRESHOLD: usize = 2;

#[derive(Clone, Copy, Debug, Default)]
pub struct JitterStats {
    pub current_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub total_frames: u64,
    pub skipped_frames: u64,
    pub bursts: u64,
}

/// Producer-side interval state. Only the producer locks it, so the mutex
/// is never contended; readers get the EWMA through the atomic mirror.
#[derive(Default)]
struct JitterState {
    last_push: Option<Instant>,
    last_interval_ms: f64,
    current_ms: f64,
    max_ms: f64,
}

pub struct FrameQueue {
    pool: Arc<FramePool>,
    ring: SpscRing,
    jitter: Mutex<JitterState>,
    /// EWMA in microseconds, readable lock-free from the consumer.
    avg_jitter_us: AtomicU64,
    total_frames: AtomicU64,
    skipped_frames: AtomicU64,
    bursts: AtomicU64,
}

impl FrameQueue {
    pub fn new(pool_size: usize, queue_capacity: usize, width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            pool: FramePool::new(pool_size, width, height),
            ring: SpscRing::new(queue_capacity),
            jitter: Mutex::new(JitterState::default()),
            avg_jitter_us: AtomicU64::new(0),
            total_frames: AtomicU64::new(0),
            skipped_frames: AtomicU64::new(0),
            bursts: AtomicU64::new(0),
        })
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub fn acquire(&self) -> Option<FrameHandle> {
        self.pool.acquire()
    }

    /// Enqueue a filled frame. On a full ring the frame goes straight back
    /// to the pool and the caller learns about it; the newest frame is
    /// never silently lost.
    pub fn push(&self, frame: FrameHandle) -> bool {
        self.update_jitter_on_push();
        let slot = frame.into_raw_slot();
        if self.ring.try_push(slot) {
            true
        } else {
            self.pool.release_slot(slot);
            false
        }
    }

    pub fn pop(&self) -> Option<FrameHandle> {
        self.ring.try_pop().map(|slot| self.pool.handle_from_slot(slot))
    }

    /// Drain the ring and keep only the newest frame, releasing the rest.
    pub fn pop_latest(&self) -> Option<FrameHandle> {
        let mut latest: Option<u32> = None;
        let mut skipped = 0u64;
        while let Some(slot) = self.ring.try_pop() {
            if let Some(old) = latest.replace(slot) {
                self.pool.release_slot(old);
                skipped += 1;
            }
        }
        if skipped > 0 {
            self.skipped_frames.fetch_add(skipped, Ordering::Relaxed);
            self.bursts.fetch_add(1, Ordering::Relaxed);
        }
        latest.map(|slot| self.pool.handle_from_slot(slot))
    }

    /// Skip to the newest frame under jitter or backlog, otherwise consume
    /// in order.
    pub fn pop_adaptive(&self) -> Option<FrameHandle> {
        let avg_ms = self.avg_jitter_us.load(Ordering::Relaxed) as f64 / 1000.0;
        if avg_ms > JITTER_SKIP_THRESHOLD_MS || self.ring.len() > DEPTH_SKIP_THRESHOLD {
            self.pop_latest()
        } else {
            self.pop()
        }
    }

    pub fn clear(&self) {
        while let Some(slot) = self.ring.try_pop() {
            self.pool.release_slot(slot);
        }
    }

    pub fn resize(&self, width: u32, height: u32) {
        self.pool.resize(width, height);
    }

    pub fn depth(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn jitter_stats(&self) -> JitterStats {
        let state = self.jitter.lock();
        JitterStats {
            current_ms: state.current_ms,
            avg_ms: self.avg_jitter_us.load(Ordering::Relaxed) as f64 / 1000.0,
            max_ms: state.max_ms,
            total_frames: self.total_frames.load(Ordering::Relaxed),
            skipped_frames: self.skipped_frames.load(Ordering::Relaxed),
            bursts: self.bursts.load(Ordering::Relaxed),
        }
    }

    /// RFC 3550 inter-arrival jitter: `jitter += (|D| - jitter) / 16`.
    fn update_jitter_on_push(&self) {
        self.total_frames.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut state = self.jitter.lock();

        let Some(last) = state.last_push.replace(now) else {
            return;
        };
        let interval_ms = now.duration_since(last).as_secs_f64() * 1000.0;
        if state.last_interval_ms > 0.0 {
            let deviation = (interval_ms - state.last_interval_ms).abs();
            state.current_ms = deviation;
            if deviation > state.max_ms {
                state.max_ms = deviation;
            }
            let avg = self.avg_jitter_us.load(Ordering::Relaxed) as f64 / 1000.0;
            let avg = avg + (deviation - avg) / 16.0;
            self.avg_jitter_us
                .store((avg * 1000.0) as u64, Ordering::Relaxed);
        }
        state.last_interval_ms = interval_ms;
    }
}

impl Drop for FrameQueue {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(queue: &Arc<FrameQueue>, seq: u64) -> FrameHandle {
        let mut frame = queue.acquire().expect("pool slot");
        frame.meta_mut().sequence = seq;
        frame
    }

    #[test]
    fn pop_returns_frames_in_decode_order() {
        let queue = FrameQueue::new(8, 8, 64, 64);
        for seq in 0..3 {
            assert!(queue.push(filled(&queue, seq)));
        }
        for seq in 0..3 {
            assert_eq!(queue.pop().unwrap().meta().sequence, seq);
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn pop_latest_keeps_newest_and_restores_pool() {
        let queue = FrameQueue::new(8, 8, 64, 64);
        for seq in 0..5 {
            assert!(queue.push(filled(&queue, seq)));
        }
        let newest = queue.pop_latest().unwrap();
        assert_eq!(newest.meta().sequence, 4);
        assert!(queue.is_empty());
        drop(newest);
        // All five frames are back in the pool.
        assert_eq!(queue.pool().available(), queue.pool().pool_size());
        assert_eq!(queue.jitter_stats().skipped_frames, 4);
        assert_eq!(queue.jitter_stats().bursts, 1);
    }

    #[test]
    fn full_ring_returns_frame_to_pool() {
        // Ring capacity 2, pool large enough to keep acquiring.
        let queue = FrameQueue::new(8, 2, 64, 64);
        assert!(queue.push(filled(&queue, 0)));
        assert!(queue.push(filled(&queue, 1)));
        let available_before = queue.pool().available();
        assert!(!queue.push(filled(&queue, 2)));
        // The rejected frame went straight back.
        assert_eq!(queue.pool().available(), available_before);
    }

    #[test]
    fn live_handles_never_exceed_pool_size() {
        let queue = FrameQueue::new(4, 8, 32, 32);
        let mut live = Vec::new();
        while let Some(h) = queue.acquire() {
            live.push(h);
        }
        assert_eq!(live.len(), 4);
        drop(live);
        assert_eq!(queue.pool().available(), 4);
    }

    #[test]
    fn frames_across_resize_keep_consistent_dimensions() {
        let queue = FrameQueue::new(4, 8, 640, 480);
        assert!(queue.push(filled(&queue, 0)));

        queue.clear();
        queue.resize(1280, 720);

        assert!(queue.push(filled(&queue, 1)));
        let frame = queue.pop().unwrap();
        let g = frame.geometry();
        assert_eq!((g.width, g.height), (1280, 720));
        // Plane strides were derived from the same geometry, never mixed.
        assert_eq!(g.stride_y % 32, 0);
    }
}
