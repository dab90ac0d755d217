//! The byte-stream contract both transports honour.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::control::FastMsg;
use crate::{Result, TransportError};

/// A bidirectional byte channel to the agent.
///
/// `recv` blocks for at most ~100 ms so shutdown stays prompt: it returns
/// `Ok(n)` with data, `Ok(0)` once the peer is gone, and
/// [`TransportError::TimedOut`] when the deadline passes with nothing to
/// read. `send` never blocks on the network; a full buffer reports
/// [`TransportError::Dropped`] and the caller counts it.
pub trait Channel: Send + Sync {
    fn send(&self, data: &[u8]) -> Result<usize>;
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;
    fn close(&self);

    /// Bytes queued locally but not yet on the wire. TCP keeps its queue in
    /// the kernel, so only the reliable-UDP channel reports anything.
    fn pending_bytes(&self) -> usize {
        0
    }

    /// Serialise and write one compact touch message in a single call.
    fn send_touch(&self, seq: u32, action: u8, x: u16, y: u16) -> Result<usize> {
        let msg = match action {
            crate::control::ACTION_DOWN => FastMsg::TouchDown { seq, x, y },
            crate::control::ACTION_UP => FastMsg::TouchUp { seq, x, y },
            _ => FastMsg::TouchMove { seq, x, y },
        };
        self.send(&msg.serialize())
    }

    /// Serialise and write one compact key message in a single call.
    fn send_key(&self, down: bool, keycode: u16) -> Result<usize> {
        let msg = if down {
            FastMsg::KeyDown { keycode }
        } else {
            FastMsg::KeyUp { keycode }
        };
        self.send(&msg.serialize())
    }

    /// Fill `buf` completely, riding out deadline wakeups until `stop` is
    /// raised or the peer disconnects.
    fn recv_exact(&self, buf: &mut [u8], stop: &AtomicBool) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if stop.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            match self.recv(&mut buf[filled..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => filled += n,
                Err(TransportError::TimedOut) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
