//! Single-slot atomic hand-off between the decoder and the renderer.
//!
//! Both sides use `swap`: the writer displaces whatever frame is still
//! parked there (returning it to the pool, so a slow renderer only ever
//! sees the newest frame) and the reader takes the slot empty. The word
//! holds `slot_index + 1`, zero meaning empty, so no pointer crosses the
//! thread boundary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::pool::{FrameHandle, FramePool};

const EMPTY: u64 = 0;

pub struct Mailbox {
    pool: Arc<FramePool>,
    word: AtomicU64,
}

impl Mailbox {
    pub fn new(pool: Arc<FramePool>) -> Self {
        Self {
            pool,
            word: AtomicU64::new(EMPTY),
        }
    }

    /// Park a frame for the renderer, displacing any frame it has not yet
    /// taken. Returns true when an older frame was displaced.
    pub fn publish(&self, frame: FrameHandle) -> bool {
        let encoded = frame.into_raw_slot() as u64 + 1;
        let previous = self.word.swap(encoded, Ordering::SeqCst);
        if previous != EMPTY {
            self.pool.release_slot((previous - 1) as u32);
            true
        } else {
            false
        }
    }

    /// Take the parked frame, if any.
    pub fn take(&self) -> Option<FrameHandle> {
        let word = self.word.swap(EMPTY, Ordering::SeqCst);
        if word == EMPTY {
            None
        } else {
            Some(self.pool.handle_from_slot((word - 1) as u32))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.word.load(Ordering::SeqCst) == EMPTY
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        if let Some(frame) = self.take() {
            drop(frame);
        }
    }
}
