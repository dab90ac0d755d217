//! Control sender: the one gate between input conversion and the wire.
//!
//! Immediate mode only: every message is written on the caller's thread.
//! The reliable channel's writer is thread-safe and the TCP socket write is
//! atomic for these tiny payloads, so no queue and no retries live here.
//! Reliability is the channel's job; this layer just counts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use kagami_media::Metrics;
use kagami_transport::control::{ACTION_DOWN, ACTION_UP};
use kagami_transport::{Channel, ControlMsg, FastMsg};

/// Pending-byte levels: warn first, shed load afterwards. Control traffic
/// is tiny, so a deep backlog means the link itself is in trouble.
const WARN_PENDING_BYTES: usize = 1024;
const DROP_PENDING_BYTES: usize = 2048;

/// What the input converter needs from the outbound path. Implemented by
/// [`ControlSender`] for production and by recorders in tests.
pub trait ControlOutput: Send + Sync {
    /// Compact touch message; coordinates are normalised [0,1].
    fn fast_touch(&self, seq: u32, action: u8, x: f64, y: f64);
    fn fast_key(&self, down: bool, keycode: u16);
    fn control_msg(&self, msg: &ControlMsg);
}

pub struct ControlSender {
    channel: Arc<dyn Channel>,
    running: AtomicBool,
    sent: AtomicU64,
    dropped: AtomicU64,
    metrics: Arc<Metrics>,
}

impl ControlSender {
    pub fn new(channel: Arc<dyn Channel>, metrics: Arc<Metrics>) -> Self {
        Self {
            channel,
            running: AtomicBool::new(true),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn send(&self, data: &[u8]) -> bool {
        if data.is_empty() || !self.running.load(Ordering::Acquire) {
            return false;
        }

        let pending = self.channel.pending_bytes();
        if pending >= DROP_PENDING_BYTES {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.metrics.report_input_dropped();
            return false;
        }
        if pending >= WARN_PENDING_BYTES {
            log::warn!("control: {pending} bytes pending on the channel");
        }

        match self.channel.send(data) {
            Ok(n) if n == data.len() => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(_) | Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.report_input_dropped();
                false
            }
        }
    }
}

impl ControlOutput for ControlSender {
    fn fast_touch(&self, seq: u32, action: u8, x: f64, y: f64) {
        let x = FastMsg::quantize(x);
        let y = FastMsg::quantize(y);
        let msg = match action {
            ACTION_DOWN => FastMsg::TouchDown { seq, x, y },
            ACTION_UP => FastMsg::TouchUp { seq, x, y },
            _ => FastMsg::TouchMove { seq, x, y },
        };
        self.send(&msg.serialize());
    }

    fn fast_key(&self, down: bool, keycode: u16) {
        let msg = if down {
            FastMsg::KeyDown { keycode }
        } else {
            FastMsg::KeyUp { keycode }
        };
        self.send(&msg.serialize());
    }

    fn control_msg(&self, msg: &ControlMsg) {
        self.send(&msg.serialize());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kagami_transport::Result as TransportResult;
    use kagami_transport::TransportError;
    use parking_lot::Mutex;

    struct FakeChannel {
        pending: usize,
        written: Mutex<Vec<Vec<u8>>>,
        fail: bool,
    }

    impl Channel for FakeChannel {
        fn send(&self, data: &[u8]) -> TransportResult<usize> {
            if self.fail {
                return Err(TransportError::Dropped);
            }
            self.written.lock().push(data.to_vec());
            Ok(data.len())
        }

        fn recv(&self, _buf: &mut [u8]) -> TransportResult<usize> {
            Ok(0)
        }

        fn close(&self) {}

        fn pending_bytes(&self) -> usize {
            self.pending
        }
    }

    fn sender(pending: usize, fail: bool) -> (ControlSender, Arc<FakeChannel>) {
        let channel = Arc::new(FakeChannel {
            pending,
            written: Mutex::new(Vec::new()),
            fail,
        });
        let sender = ControlSender::new(channel.clone(), Arc::new(Metrics::new()));
        (sender, channel)
    }

    #[test]
    fn sends_and_counts() {
        let (sender, channel) = sender(0, false);
        assert!(sender.send(b"hello"));
        assert_eq!(sender.sent_count(), 1);
        assert_eq!(channel.written.lock().len(), 1);
    }

    #[test]
    fn backlog_sheds_messages() {
        let (sender, channel) = sender(4096, false);
        assert!(!sender.send(b"hello"));
        assert_eq!(sender.dropped_count(), 1);
        assert!(channel.written.lock().is_empty());
    }

    #[test]
    fn channel_failure_counts_as_drop() {
        let (sender, _) = sender(0, true);
        assert!(!sender.send(b"hello"));
        assert_eq!(sender.dropped_count(), 1);
    }

    #[test]
    fn stopped_sender_refuses() {
        let (sender, _) = sender(0, false);
        sender.stop();
        assert!(!sender.send(b"hello"));
        assert_eq!(sender.sent_count(), 0);
    }

    #[test]
    fn fast_touch_quantizes_coordinates() {
        let (sender, channel) = sender(0, false);
        sender.fast_touch(9, ACTION_DOWN, 0.5, 1.0);
        let written = channel.written.lock();
        let parsed = FastMsg::parse(&written[0]).unwrap();
        assert_eq!(
            parsed,
            FastMsg::TouchDown {
                seq: 9,
                x: 32767,
                y: 65535
            }
        );
    }
}
