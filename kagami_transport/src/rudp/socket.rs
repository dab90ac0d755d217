//! UDP socket driver for the ARQ core.
//!
//! One background thread per channel owns the socket reads and the 10 ms
//! ARQ tick. Application threads only touch the state machine under a short
//! mutex, so `send` is safe from any thread and never blocks on the network.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::channel::Channel;
use crate::fec::{FecDecoder, FecEncoder};
use crate::rudp::arq::{Arq, ArqConfig, ArqStats};
use crate::{Result, TransportError};

/// Conversation id of the video stream; the control conversation uses the
/// next port, same id.
pub const VIDEO_CONV: u32 = 0x1122_3344;

const TICK: Duration = Duration::from_millis(10);
const RECV_DEADLINE: Duration = Duration::from_millis(100);

/// Refuse new sends once this many messages are queued or in flight.
const SEND_BACKLOG_LIMIT: usize = 4096;

#[derive(Clone, Copy, Debug, Default)]
pub struct RudpStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub pending_bytes: usize,
    pub retransmits: u64,
    pub fec_recovered: u64,
}

struct Shared {
    sock: UdpSocket,
    arq: Mutex<ArqState>,
    readable: Condvar,
    stop: AtomicBool,
    epoch: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

struct ArqState {
    arq: Arq,
    fec_enc: Option<FecEncoder>,
    fec_dec: Option<FecDecoder>,
    /// Reassembled messages flattened into stream order; `recv` hands out
    /// byte runs so callers can read exact-sized headers.
    stream: Vec<u8>,
    stream_pos: usize,
}

impl ArqState {
    fn drain_arq_messages(&mut self) {
        while let Some(msg) = self.arq.recv() {
            if self.stream_pos > 0 && self.stream_pos == self.stream.len() {
                self.stream.clear();
                self.stream_pos = 0;
            }
            self.stream.extend_from_slice(&msg);
        }
    }

    fn has_data(&self) -> bool {
        self.stream_pos < self.stream.len()
    }
}

pub struct RudpChannel {
    shared: Arc<Shared>,
    io_thread: Mutex<Option<JoinHandle<()>>>,
}

impl RudpChannel {
    /// Bind a local port and connect the conversation to the agent.
    pub fn connect(
        local_port: u16,
        remote: SocketAddr,
        conv: u32,
        cfg: ArqConfig,
        fec_group: Option<u8>,
    ) -> Result<Self> {
        let sock = UdpSocket::bind(("0.0.0.0", local_port))?;
        sock.connect(remote)?;
        sock.set_read_timeout(Some(TICK))?;

        let mtu = cfg.mtu;
        let shared = Arc::new(Shared {
            sock,
            arq: Mutex::new(ArqState {
                arq: Arq::new(conv, cfg),
                fec_enc: fec_group.map(|n| FecEncoder::new(n, mtu + 64)),
                fec_dec: fec_group.map(|_| FecDecoder::new(16)),
                stream: Vec::new(),
                stream_pos: 0,
            }),
            readable: Condvar::new(),
            stop: AtomicBool::new(false),
            epoch: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        });

        let io_shared = shared.clone();
        let io_thread = thread::Builder::new()
            .name("rudp-io".into())
            .spawn(move || io_loop(io_shared))
            .map_err(std::io::Error::from)?;

        Ok(Self {
            shared,
            io_thread: Mutex::new(Some(io_thread)),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.shared
            .sock
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> RudpStats {
        let state = self.shared.arq.lock();
        let ArqStats {
            retransmits,
            fast_retransmits,
            ..
        } = state.arq.stats();
        RudpStats {
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_received.load(Ordering::Relaxed),
            pending_bytes: state.arq.pending_bytes(),
            retransmits: retransmits + fast_retransmits,
            fec_recovered: state.fec_dec.as_ref().map_or(0, |d| d.recovered_total()),
        }
    }
}

impl Channel for RudpChannel {
    fn send(&self, data: &[u8]) -> Result<usize> {
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut state = self.shared.arq.lock();
        if state.arq.wait_send() >= SEND_BACKLOG_LIMIT {
            return Err(TransportError::Dropped);
        }
        let written = state.arq.send(data)?;
        // Flush immediately rather than waiting out the tick; input latency
        // is bounded by this call, not the 10 ms cadence.
        let now = self.shared.epoch.elapsed().as_millis() as u32;
        flush_to_socket(&self.shared, &mut state, now, true);
        Ok(written)
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.shared.arq.lock();
        if !state.has_data() {
            if self.shared.stop.load(Ordering::Acquire) {
                return Ok(0);
            }
            let _ = self.shared.readable.wait_for(&mut state, RECV_DEADLINE);
        }
        if !state.has_data() {
            return if self.shared.stop.load(Ordering::Acquire) {
                Ok(0)
            } else {
                Err(TransportError::TimedOut)
            };
        }
        let n = buf.len().min(state.stream.len() - state.stream_pos);
        buf[..n].copy_from_slice(&state.stream[state.stream_pos..state.stream_pos + n]);
        state.stream_pos += n;
        Ok(n)
    }

    fn close(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.readable.notify_all();
        if let Some(handle) = self.io_thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn pending_bytes(&self) -> usize {
        self.shared.arq.lock().arq.pending_bytes()
    }
}

impl Drop for RudpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn io_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; 64 * 1024];
    while !shared.stop.load(Ordering::Acquire) {
        match shared.sock.recv(&mut buf) {
            Ok(n) if n > 0 => {
                shared.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                let mut state = shared.arq.lock();
                let ArqState { arq, fec_dec, .. } = &mut *state;
                if let Some(dec) = fec_dec {
                    dec.decode(&buf[..n], |payload| {
                        if let Err(err) = arq.input(payload) {
                            log::warn!("rudp: dropping bad datagram: {err}");
                        }
                    });
                } else if let Err(err) = arq.input(&buf[..n]) {
                    log::warn!("rudp: dropping bad datagram: {err}");
                }
                state.drain_arq_messages();
                if state.has_data() {
                    shared.readable.notify_all();
                }
            }
            Ok(_) => {}
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {}
            Err(err) if err.kind() == ErrorKind::ConnectionRefused => {
                // ICMP port-unreachable from a peer that has not bound yet;
                // the ARQ retransmit covers the gap.
            }
            Err(err) => {
                log::warn!("rudp: socket error, stopping io thread: {err}");
                break;
            }
        }

        let now = shared.epoch.elapsed().as_millis() as u32;
        let mut state = shared.arq.lock();
        flush_to_socket(&shared, &mut state, now, false);
        if state.arq.is_dead_link() {
            log::error!("rudp: peer unreachable (dead link)");
            break;
        }
    }

    // Unblock any reader stuck on the deadline wait.
    shared.stop.store(true, Ordering::Release);
    shared.readable.notify_all();
}

fn flush_to_socket(shared: &Shared, state: &mut ArqState, now: u32, immediate: bool) {
    let ArqState { arq, fec_enc, .. } = state;
    let sock = &shared.sock;
    let sent = &shared.bytes_sent;
    let mut emit = |datagram: &[u8]| {
        let mut transmit = |pkt: &[u8]| {
            match sock.send(pkt) {
                Ok(n) => {
                    sent.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => log::debug!("rudp: send failed: {err}"),
            };
        };
        match fec_enc {
            Some(enc) => enc.encode(datagram, |pkt| transmit(pkt)),
            None => transmit(datagram),
        }
    };
    if immediate {
        arq.flush_now(now, &mut emit);
    } else {
        arq.update(now, &mut emit);
    }
}
