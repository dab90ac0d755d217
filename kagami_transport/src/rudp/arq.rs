//! Selective-repeat ARQ core.
//!
//! A pure state machine: datagrams in via [`Arq::input`], application bytes
//! in via [`Arq::send`], and everything leaving for the network comes out of
//! the `emit` callback passed to [`Arq::update`]. No sockets, no clocks of
//! its own; the driver owns both. That keeps the retransmission logic fully
//! deterministic under test.
//!
//! Wire layout per segment (little-endian):
//! `conv u32 | cmd u8 | frg u8 | wnd u16 | ts u32 | sn u32 | una u32 | len u32 | payload`

use std::collections::VecDeque;

use crate::{Result, TransportError};

pub const OVERHEAD: usize = 24;

const CMD_PUSH: u8 = 81;
const CMD_ACK: u8 = 82;
const CMD_WINDOW_ASK: u8 = 83;
const CMD_WINDOW_TELL: u8 = 84;

const RTO_MIN_MS: u32 = 30;
const RTO_DEFAULT_MS: u32 = 100;
const RTO_MAX_MS: u32 = 10_000;

const PROBE_INIT_MS: u32 = 7_000;
const PROBE_LIMIT_MS: u32 = 120_000;

const ASK_SEND: u8 = 1;
const ASK_TELL: u8 = 2;

/// Transmissions of one segment after which the link is declared dead.
const DEAD_LINK_XMIT: u32 = 20;

#[derive(Clone, Copy, Debug)]
pub struct ArqConfig {
    pub mtu: usize,
    pub send_window: u16,
    pub recv_window: u16,
    /// Flush cadence in milliseconds.
    pub interval: u32,
    /// Duplicate-ack count that triggers a fast retransmit (0 = disabled).
    pub fast_resend: u32,
    /// Skip the doubling back-off on retransmit timeouts.
    pub nodelay: bool,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            mtu: 1400,
            send_window: 256,
            recv_window: 256,
            interval: 10,
            fast_resend: 2,
            nodelay: true,
        }
    }
}

impl ArqConfig {
    /// Preset scaled to the encoder bitrate: a stream pushing more bits
    /// needs deeper windows and a full MTU to keep one RTT of data in
    /// flight.
    pub fn for_bitrate(bitrate_bps: u32) -> Self {
        let mut cfg = Self::default();
        if bitrate_bps >= 8_000_000 {
            cfg.send_window = 1024;
            cfg.recv_window = 1024;
        } else if bitrate_bps >= 2_000_000 {
            cfg.send_window = 512;
            cfg.recv_window = 512;
        }
        cfg
    }
}

#[derive(Clone, Debug, Default)]
struct Segment {
    cmd: u8,
    frg: u8,
    wnd: u16,
    ts: u32,
    sn: u32,
    una: u32,
    payload: Vec<u8>,

    // Sender-side book-keeping.
    resend_at: u32,
    rto: u32,
    fast_acks: u32,
    xmit: u32,
}

impl Segment {
    fn encode_into(&self, conv: u32, out: &mut Vec<u8>) {
        out.extend_from_slice(&conv.to_le_bytes());
        out.push(self.cmd);
        out.push(self.frg);
        out.extend_from_slice(&self.wnd.to_le_bytes());
        out.extend_from_slice(&self.ts.to_le_bytes());
        out.extend_from_slice(&self.sn.to_le_bytes());
        out.extend_from_slice(&self.una.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ArqStats {
    pub retransmits: u64,
    pub fast_retransmits: u64,
    pub segments_sent: u64,
    pub segments_received: u64,
}

pub struct Arq {
    conv: u32,
    cfg: ArqConfig,
    mss: usize,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    /// Latest window advertised by the peer, in segments.
    rmt_wnd: u16,

    srtt: u32,
    rttvar: u32,
    rto: u32,

    current: u32,
    next_flush: u32,

    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: Vec<Segment>,
    rcv_queue: VecDeque<Segment>,
    ack_list: Vec<(u32, u32)>,

    probe_flags: u8,
    probe_at: u32,
    probe_wait: u32,

    dead_link: bool,
    stats: ArqStats,
}

impl Arq {
    pub fn new(conv: u32, cfg: ArqConfig) -> Self {
        let mss = cfg.mtu - OVERHEAD;
        Self {
            conv,
            cfg,
            mss,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            rmt_wnd: cfg.recv_window,
            srtt: 0,
            rttvar: 0,
            rto: RTO_DEFAULT_MS,
            current: 0,
            next_flush: 0,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: Vec::new(),
            rcv_queue: VecDeque::new(),
            ack_list: Vec::new(),
            probe_flags: 0,
            probe_at: 0,
            probe_wait: 0,
            dead_link: false,
            stats: ArqStats::default(),
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn stats(&self) -> ArqStats {
        self.stats
    }

    /// Peer declared unreachable after too many retransmissions of one
    /// segment.
    pub fn is_dead_link(&self) -> bool {
        self.dead_link
    }

    /// Bytes queued or in flight on the send side.
    pub fn pending_bytes(&self) -> usize {
        self.snd_queue
            .iter()
            .chain(self.snd_buf.iter())
            .map(|s| s.payload.len())
            .sum()
    }

    pub fn wait_send(&self) -> usize {
        self.snd_queue.len() + self.snd_buf.len()
    }

    /// Queue one message. Fragments over MSS; a message needing more than
    /// 255 fragments is refused.
    pub fn send(&mut self, mut data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let count = data.len().div_ceil(self.mss);
        if count > 255 {
            return Err(TransportError::Dropped);
        }
        let total = data.len();
        for i in 0..count {
            let take = data.len().min(self.mss);
            let seg = Segment {
                cmd: CMD_PUSH,
                frg: (count - i - 1) as u8,
                payload: data[..take].to_vec(),
                ..Default::default()
            };
            self.snd_queue.push_back(seg);
            data = &data[take..];
        }
        Ok(total)
    }

    /// Size of the next complete message, if one is fully reassembled.
    pub fn peek_size(&self) -> Option<usize> {
        let first = self.rcv_queue.front()?;
        if first.frg == 0 {
            return Some(first.payload.len());
        }
        if self.rcv_queue.len() < first.frg as usize + 1 {
            return None;
        }
        let mut size = 0;
        for seg in &self.rcv_queue {
            size += seg.payload.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(size)
    }

    /// Pop one reassembled message.
    pub fn recv(&mut self) -> Option<Vec<u8>> {
        let size = self.peek_size()?;
        let mut out = Vec::with_capacity(size);
        while let Some(seg) = self.rcv_queue.pop_front() {
            let last = seg.frg == 0;
            out.extend_from_slice(&seg.payload);
            if last {
                break;
            }
        }
        self.move_ready_segments();
        Some(out)
    }

    /// Feed one datagram from the network. A datagram may carry several
    /// segments; segments for another conversation are rejected wholesale.
    pub fn input(&mut self, mut data: &[u8]) -> Result<()> {
        if data.len() < OVERHEAD {
            return Err(TransportError::Malformed("arq segment"));
        }
        let mut latest_ts = None;

        while data.len() >= OVERHEAD {
            let conv = u32::from_le_bytes(data[0..4].try_into().unwrap());
            if conv != self.conv {
                return Err(TransportError::Malformed("arq conversation"));
            }
            let cmd = data[4];
            let frg = data[5];
            let wnd = u16::from_le_bytes(data[6..8].try_into().unwrap());
            let ts = u32::from_le_bytes(data[8..12].try_into().unwrap());
            let sn = u32::from_le_bytes(data[12..16].try_into().unwrap());
            let una = u32::from_le_bytes(data[16..20].try_into().unwrap());
            let len = u32::from_le_bytes(data[20..24].try_into().unwrap()) as usize;
            if data.len() < OVERHEAD + len {
                return Err(TransportError::Malformed("arq payload"));
            }
            let payload = &data[OVERHEAD..OVERHEAD + len];
            data = &data[OVERHEAD + len..];

            self.stats.segments_received += 1;
            self.rmt_wnd = wnd;
            self.ack_up_to(una);

            match cmd {
                CMD_ACK => {
                    self.ack_segment(sn);
                    if time_after_eq(self.current, ts) {
                        self.update_rtt(self.current.wrapping_sub(ts));
                    }
                    latest_ts = Some((sn, ts));
                }
                CMD_PUSH => {
                    if seq_diff(sn, self.rcv_nxt.wrapping_add(self.cfg.recv_window as u32)) < 0 {
                        self.ack_list.push((sn, ts));
                        if seq_diff(sn, self.rcv_nxt) >= 0 {
                            self.store_segment(Segment {
                                cmd,
                                frg,
                                wnd,
                                ts,
                                sn,
                                una,
                                payload: payload.to_vec(),
                                ..Default::default()
                            });
                        }
                    }
                }
                CMD_WINDOW_ASK => self.probe_flags |= ASK_TELL,
                CMD_WINDOW_TELL => {} // window already absorbed above
                _ => return Err(TransportError::Malformed("arq command")),
            }
        }

        // Segments acknowledged past by newer acks count toward fast resend.
        if let Some((max_sn, _)) = latest_ts {
            for seg in self.snd_buf.iter_mut() {
                if seq_diff(seg.sn, max_sn) < 0 {
                    seg.fast_acks += 1;
                }
            }
        }
        Ok(())
    }

    /// Advance the clock and flush anything due: pending acks, window
    /// probes, fresh data within the send window, and retransmissions.
    pub fn update(&mut self, now: u32, emit: &mut dyn FnMut(&[u8])) {
        self.current = now;
        if self.next_flush == 0 || time_after_eq(now, self.next_flush) {
            self.next_flush = now.wrapping_add(self.cfg.interval);
            self.flush(emit);
        }
    }

    /// Flush without waiting for the next tick. Used on the send path so a
    /// control message's latency is bounded by the call, not the cadence.
    pub fn flush_now(&mut self, now: u32, emit: &mut dyn FnMut(&[u8])) {
        self.current = now;
        self.next_flush = now.wrapping_add(self.cfg.interval);
        self.flush(emit);
    }

    fn flush(&mut self, emit: &mut dyn FnMut(&[u8])) {
        let wnd_unused = self.recv_window_unused();
        let mut datagram: Vec<u8> = Vec::with_capacity(self.cfg.mtu);

        // Acks first: the peer's RTT estimate depends on them going out on
        // the very next flush.
        let acks = std::mem::take(&mut self.ack_list);
        for (sn, ts) in acks {
            self.push_segment_bytes(
                &Segment {
                    cmd: CMD_ACK,
                    wnd: wnd_unused,
                    sn,
                    ts,
                    una: self.rcv_nxt,
                    ..Default::default()
                },
                &mut datagram,
                emit,
            );
        }

        self.update_probe_state();
        let probe = std::mem::take(&mut self.probe_flags);
        if probe & ASK_SEND != 0 {
            self.push_segment_bytes(
                &Segment {
                    cmd: CMD_WINDOW_ASK,
                    wnd: wnd_unused,
                    una: self.rcv_nxt,
                    ..Default::default()
                },
                &mut datagram,
                emit,
            );
        }
        if probe & ASK_TELL != 0 {
            self.push_segment_bytes(
                &Segment {
                    cmd: CMD_WINDOW_TELL,
                    wnd: wnd_unused,
                    una: self.rcv_nxt,
                    ..Default::default()
                },
                &mut datagram,
                emit,
            );
        }

        // Move fresh segments into flight while the smaller of ours and the
        // peer's window has room.
        let cwnd = self.cfg.send_window.min(self.rmt_wnd) as u32;
        while seq_diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.sn = self.snd_nxt;
            seg.ts = self.current;
            seg.rto = self.rto;
            seg.resend_at = self.current.wrapping_add(seg.rto);
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(seg);
        }

        // Transmit: first send, RTO expiry, or fast resend.
        let fast_resend = self.cfg.fast_resend;
        let current = self.current;
        let mut to_send: Vec<usize> = Vec::new();
        for (i, seg) in self.snd_buf.iter_mut().enumerate() {
            let mut send = false;
            if seg.xmit == 0 {
                send = true;
            } else if time_after_eq(current, seg.resend_at) {
                send = true;
                seg.rto = if self.cfg.nodelay {
                    seg.rto + seg.rto / 2
                } else {
                    seg.rto * 2
                }
                .min(RTO_MAX_MS);
                self.stats.retransmits += 1;
            } else if fast_resend > 0 && seg.fast_acks >= fast_resend {
                send = true;
                seg.fast_acks = 0;
                self.stats.fast_retransmits += 1;
            }
            if send {
                seg.xmit += 1;
                seg.ts = current;
                seg.resend_at = current.wrapping_add(seg.rto);
                if seg.xmit >= DEAD_LINK_XMIT {
                    self.dead_link = true;
                }
                to_send.push(i);
            }
        }
        for i in to_send {
            let mut seg = self.snd_buf[i].clone();
            seg.wnd = wnd_unused;
            seg.una = self.rcv_nxt;
            self.push_segment_bytes(&seg, &mut datagram, emit);
            self.stats.segments_sent += 1;
        }

        if !datagram.is_empty() {
            emit(&datagram);
        }
    }

    fn push_segment_bytes(
        &self,
        seg: &Segment,
        datagram: &mut Vec<u8>,
        emit: &mut dyn FnMut(&[u8]),
    ) {
        if datagram.len() + OVERHEAD + seg.payload.len() > self.cfg.mtu {
            emit(datagram);
            datagram.clear();
        }
        seg.encode_into(self.conv, datagram);
    }

    fn recv_window_unused(&self) -> u16 {
        (self.cfg.recv_window as usize).saturating_sub(self.rcv_queue.len()) as u16
    }

    fn update_probe_state(&mut self) {
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT_MS;
                self.probe_at = self.current.wrapping_add(self.probe_wait);
            } else if time_after_eq(self.current, self.probe_at) {
                self.probe_wait = (self.probe_wait + self.probe_wait / 2).min(PROBE_LIMIT_MS);
                self.probe_at = self.current.wrapping_add(self.probe_wait);
                self.probe_flags |= ASK_SEND;
            }
        } else {
            self.probe_wait = 0;
        }
    }

    /// RFC-6298 smoothing with a floor suited to interactive streaming.
    fn update_rtt(&mut self, rtt: u32) {
        if self.srtt == 0 {
            self.srtt = rtt;
            self.rttvar = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.srtt);
            self.rttvar = (3 * self.rttvar + delta) / 4;
            self.srtt = (7 * self.srtt + rtt) / 8;
        }
        self.rto = (self.srtt + (self.cfg.interval).max(4 * self.rttvar))
            .clamp(RTO_MIN_MS, RTO_MAX_MS);
    }

    fn ack_up_to(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if seq_diff(seg.sn, una) < 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
        self.snd_una = una.max(self.snd_una);
    }

    fn ack_segment(&mut self, sn: u32) {
        if let Some(i) = self.snd_buf.iter().position(|s| s.sn == sn) {
            self.snd_buf.remove(i);
        }
        // snd_buf stays sorted by sn, so the front is the new lower edge.
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.sn,
            None => self.snd_nxt,
        };
    }

    fn store_segment(&mut self, seg: Segment) {
        // Insert sorted by sequence, dropping duplicates.
        match self.rcv_buf.binary_search_by(|s| seq_diff(s.sn, seg.sn).cmp(&0)) {
            Ok(_) => {}
            Err(pos) => self.rcv_buf.insert(pos, seg),
        }
        self.move_ready_segments();
    }

    fn move_ready_segments(&mut self) {
        while !self.rcv_buf.is_empty() {
            if self.rcv_buf[0].sn == self.rcv_nxt
                && self.rcv_queue.len() < self.cfg.recv_window as usize
            {
                let seg = self.rcv_buf.remove(0);
                self.rcv_queue.push_back(seg);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            } else {
                break;
            }
        }
    }
}

/// Signed distance between wrapping sequence numbers.
fn seq_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

fn time_after_eq(now: u32, when: u32) -> bool {
    now.wrapping_sub(when) as i32 >= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive two endpoints over a lossy in-memory link until `deadline_ms`.
    fn pump(a: &mut Arq, b: &mut Arq, ms: u32, start: u32, mut drop: impl FnMut(u64) -> bool) {
        let mut counter = 0u64;
        for now in start..start + ms {
            let mut a_out = Vec::new();
            let mut b_out = Vec::new();
            a.update(now, &mut |pkt| a_out.push(pkt.to_vec()));
            b.update(now, &mut |pkt| b_out.push(pkt.to_vec()));
            for pkt in a_out {
                counter += 1;
                if !drop(counter) {
                    b.input(&pkt).unwrap();
                }
            }
            for pkt in b_out {
                counter += 1;
                if !drop(counter) {
                    a.input(&pkt).unwrap();
                }
            }
        }
    }

    #[test]
    fn lossless_transfer_preserves_messages() {
        let mut a = Arq::new(0x1122_3344, ArqConfig::default());
        let mut b = Arq::new(0x1122_3344, ArqConfig::default());

        let messages: Vec<Vec<u8>> = vec![
            b"hello".to_vec(),
            vec![7u8; 5000], // forces fragmentation over the 1376-byte MSS
            b"tail".to_vec(),
        ];
        for m in &messages {
            a.send(m).unwrap();
        }

        pump(&mut a, &mut b, 200, 1, |_| false);

        for expected in &messages {
            assert_eq!(b.recv().as_ref(), Some(expected));
        }
        assert!(b.recv().is_none());
        assert_eq!(a.wait_send(), 0);
    }

    #[test]
    fn retransmission_recovers_from_loss() {
        let mut a = Arq::new(7, ArqConfig::default());
        let mut b = Arq::new(7, ArqConfig::default());

        for i in 0..20u8 {
            a.send(&vec![i; 100]).unwrap();
        }
        // Drop every third datagram in both directions.
        pump(&mut a, &mut b, 2000, 1, |n| n % 3 == 0);

        for i in 0..20u8 {
            assert_eq!(b.recv(), Some(vec![i; 100]), "message {i}");
        }
        assert!(a.stats().retransmits + a.stats().fast_retransmits > 0);
    }

    #[test]
    fn mismatched_conversation_is_rejected() {
        let mut a = Arq::new(1, ArqConfig::default());
        let mut b = Arq::new(2, ArqConfig::default());
        a.send(b"x").unwrap();
        let mut pkts = Vec::new();
        a.update(1, &mut |p| pkts.push(p.to_vec()));
        for p in pkts {
            assert!(b.input(&p).is_err());
        }
    }

    #[test]
    fn oversized_message_is_refused() {
        let mut a = Arq::new(1, ArqConfig::default());
        let too_big = vec![0u8; (1400 - OVERHEAD) * 256 + 1];
        assert!(a.send(&too_big).is_err());
    }

    #[test]
    fn bitrate_presets_scale_windows() {
        assert_eq!(ArqConfig::for_bitrate(16_000_000).send_window, 1024);
        assert_eq!(ArqConfig::for_bitrate(4_000_000).send_window, 512);
        assert_eq!(ArqConfig::for_bitrate(500_000).send_window, 256);
    }

    #[test]
    fn pending_bytes_drain_after_delivery() {
        let mut a = Arq::new(9, ArqConfig::default());
        let mut b = Arq::new(9, ArqConfig::default());
        a.send(&[1u8; 300]).unwrap();
        assert_eq!(a.pending_bytes(), 300);
        pump(&mut a, &mut b, 100, 1, |_| false);
        assert_eq!(a.pending_bytes(), 0);
    }
}
