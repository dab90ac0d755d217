//! Demuxer thread: walks the framed video stream and hands encoded packets
//! to the decoder.
//!
//! Codec configuration packets (SPS/PPS/VPS) are never delivered alone:
//! they are stashed and prepended to the next media packet, which is then
//! tagged as a keyframe, so the decoder always sees configuration and the
//! frame it belongs to as one unit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use kagami_transport::wire::{PacketHeader, HEADER_LEN};
use kagami_transport::{Channel, TransportError};

/// One encoded access unit on its way to the decoder.
#[derive(Clone, Debug)]
pub struct EncodedPacket {
    pub data: Vec<u8>,
    pub pts: i64,
    pub key_frame: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DemuxEvent {
    /// The stream reached EOF or the channel died.
    StreamStopped,
}

const JOIN_DEADLINE: Duration = Duration::from_millis(500);

pub struct Demuxer {
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Demuxer {
    /// Spawn the demuxer thread. `sink` consumes each packet and returns
    /// false to abort the stream (decoder fatal error).
    pub fn spawn<S>(
        channel: Arc<dyn Channel>,
        mut sink: S,
        events: Sender<DemuxEvent>,
    ) -> std::io::Result<Self>
    where
        S: FnMut(EncodedPacket) -> bool + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let thread_stop = stop.clone();
        let thread_finished = finished.clone();
        let thread = std::thread::Builder::new()
            .name("demuxer".into())
            .spawn(move || {
                raise_thread_priority();
                run_loop(channel.as_ref(), &thread_stop, &mut sink);
                thread_finished.store(true, Ordering::Release);
                let _ = events.send(DemuxEvent::StreamStopped);
            })?;

        Ok(Self {
            stop,
            finished,
            thread: Some(thread),
        })
    }

    /// Request the loop to exit and wait out the join deadline. The channel
    /// read has a 100 ms budget, so the thread should be gone well inside
    /// it; if not, the handle is detached and a warning logged.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let deadline = Instant::now() + JOIN_DEADLINE;
        while !self.finished.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                log::warn!("demuxer did not exit within {JOIN_DEADLINE:?}, detaching");
                self.thread.take();
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Demuxer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(channel: &dyn Channel, stop: &AtomicBool, sink: &mut dyn FnMut(EncodedPacket) -> bool) {
    let mut pending: Vec<u8> = Vec::new();
    let mut header_buf = [0u8; HEADER_LEN];

    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }
        match channel.recv_exact(&mut header_buf, stop) {
            Ok(()) => {}
            Err(TransportError::Closed) => return,
            Err(err) => {
                log::warn!("demuxer: header read failed: {err}");
                return;
            }
        }
        let header = match PacketHeader::decode(&header_buf) {
            Ok(h) => h,
            Err(err) => {
                log::error!("demuxer: {err}, stream out of sync");
                return;
            }
        };

        let mut payload = vec![0u8; header.payload_len as usize];
        match channel.recv_exact(&mut payload, stop) {
            Ok(()) => {}
            Err(TransportError::Closed) => return,
            Err(err) => {
                log::warn!("demuxer: payload read failed: {err}");
                return;
            }
        }

        if header.is_config() {
            // Several configuration packets in a row concatenate.
            pending.extend_from_slice(&payload);
            continue;
        }

        let packet = if pending.is_empty() {
            EncodedPacket {
                data: payload,
                pts: header.pts.unwrap_or(0) as i64,
                key_frame: header.key_frame,
            }
        } else {
            let mut data = std::mem::take(&mut pending);
            data.extend_from_slice(&payload);
            EncodedPacket {
                data,
                pts: header.pts.unwrap_or(0) as i64,
                key_frame: true,
            }
        };

        if !sink(packet) {
            return;
        }
    }
}

#[cfg(unix)]
fn raise_thread_priority() {
    // Streaming decode wants to win the scheduler; failure just means we
    // run at the default priority.
    let rc = unsafe { libc::nice(-10) };
    if rc == -1 {
        log::debug!("demuxer: could not raise thread priority");
    }
}

#[cfg(not(unix))]
fn raise_thread_priority() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use kagami_transport::Result as TransportResult;
    use parking_lot::Mutex;

    /// Channel fake that serves a canned byte stream then reports EOF.
    struct ScriptedChannel {
        data: Mutex<Vec<u8>>,
    }

    impl ScriptedChannel {
        fn new(stream: Vec<u8>) -> Self {
            Self {
                data: Mutex::new(stream),
            }
        }
    }

    impl Channel for ScriptedChannel {
        fn send(&self, data: &[u8]) -> TransportResult<usize> {
            Ok(data.len())
        }

        fn recv(&self, buf: &mut [u8]) -> TransportResult<usize> {
            let mut data = self.data.lock();
            if data.is_empty() {
                return Ok(0);
            }
            let n = buf.len().min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
            data.drain(..n);
            Ok(n)
        }

        fn close(&self) {}
    }

    fn packet_bytes(header: PacketHeader, payload: &[u8]) -> Vec<u8> {
        let mut out = header.encode().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn collect_packets(stream: Vec<u8>) -> Vec<EncodedPacket> {
        let channel: Arc<dyn Channel> = Arc::new(ScriptedChannel::new(stream));
        let (tx, rx) = unbounded();
        let packets = Arc::new(Mutex::new(Vec::new()));
        let sink_packets = packets.clone();
        let mut demuxer = Demuxer::spawn(
            channel,
            move |pkt| {
                sink_packets.lock().push(pkt);
                true
            },
            tx,
        )
        .unwrap();

        // EOF arrives as soon as the canned bytes run out.
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            DemuxEvent::StreamStopped
        );
        demuxer.stop();
        Arc::try_unwrap(packets).unwrap().into_inner()
    }

    #[test]
    fn config_is_prepended_to_next_packet_as_keyframe() {
        let config = vec![0xc0; 40];
        let media = vec![0xda; 500];
        let mut stream = packet_bytes(PacketHeader::config(40), &config);
        stream.extend(packet_bytes(PacketHeader::media(1000, false, 500), &media));

        let packets = collect_packets(stream);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data.len(), 540);
        assert!(packets[0].key_frame);
        assert_eq!(&packets[0].data[..40], &config[..]);
        assert_eq!(&packets[0].data[40..], &media[..]);
        assert_eq!(packets[0].pts, 1000);
    }

    #[test]
    fn plain_packets_pass_through_in_order() {
        let mut stream = Vec::new();
        for pts in 0..3u64 {
            stream.extend(packet_bytes(
                PacketHeader::media(pts, pts == 0, 8),
                &[pts as u8; 8],
            ));
        }
        let packets = collect_packets(stream);
        assert_eq!(packets.len(), 3);
        assert!(packets[0].key_frame);
        assert!(!packets[1].key_frame);
        assert_eq!(packets[2].pts, 2);
    }

    #[test]
    fn sink_false_aborts_stream() {
        let mut stream = Vec::new();
        for pts in 0..5u64 {
            stream.extend(packet_bytes(PacketHeader::media(pts, false, 4), &[0; 4]));
        }
        let channel: Arc<dyn Channel> = Arc::new(ScriptedChannel::new(stream));
        let (tx, rx) = unbounded();
        let seen = Arc::new(Mutex::new(0u32));
        let sink_seen = seen.clone();
        let mut demuxer = Demuxer::spawn(
            channel,
            move |_| {
                *sink_seen.lock() += 1;
                false
            },
            tx,
        )
        .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            DemuxEvent::StreamStopped
        );
        demuxer.stop();
        assert_eq!(*seen.lock(), 1);
    }
}
