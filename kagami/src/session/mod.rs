//! Session controller: owns the transport, decoder, frame queue and
//! control sender for one device, and drives the connection lifecycle
//! state machine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};

use kagami_media::decode::{DecoderConfig, VideoCodec, VideoDecoder};
use kagami_media::{DemuxEvent, Demuxer, FrameQueue, Mailbox, Metrics, MetricsSnapshot};
use kagami_transport::rudp::{ArqConfig, RudpChannel};
use kagami_transport::wire::VideoHeader;
use kagami_transport::{Channel, ControlMsg, TcpChannel, TransportError};

use crate::control::ControlSender;
use crate::error::SessionError;
use crate::launcher::Launcher;

pub mod params;
pub mod state;

pub use params::{SessionParams, Transport};
pub use state::{is_valid_transition, SessionState};

const DEVICE_NAME_FIELD_LEN: usize = 64;
const FRAME_POOL_SLOTS: usize = 8;
const FRAME_RING_CAPACITY: usize = 8;
const METRICS_TICK: Duration = Duration::from_secs(1);

/// How many consecutive decode failures abort the stream instead of being
/// counted as dropped frames.
const DECODE_FAILURE_LIMIT: u32 = 10;

/// One-way observer record; components subscribe with the callbacks they
/// care about and unsubscribe by handle.
#[derive(Default)]
pub struct SessionObserver {
    pub on_state: Option<Box<dyn Fn(SessionState) + Send>>,
    pub on_metrics: Option<Box<dyn Fn(&MetricsSnapshot) + Send>>,
    pub on_error: Option<Box<dyn Fn(&SessionError) + Send>>,
}

pub struct Session {
    params: SessionParams,
    state: SessionState,
    launcher: Launcher,

    metrics: Arc<Metrics>,
    queue: Arc<FrameQueue>,
    mailbox: Arc<Mailbox>,

    video_channel: Option<Arc<dyn Channel>>,
    control_channel: Option<Arc<dyn Channel>>,
    rudp_video: Option<Arc<RudpChannel>>,
    control: Option<Arc<ControlSender>>,
    demuxer: Option<Demuxer>,
    demux_events: Option<Receiver<DemuxEvent>>,

    device_name: String,
    video_size: (u32, u32),

    observers: Vec<(u64, SessionObserver)>,
    next_observer_id: u64,
    last_metrics_tick: Instant,
}

impl Session {
    pub fn new(params: SessionParams, launcher: Launcher) -> Result<Self, SessionError> {
        params.validate()?;
        let queue = FrameQueue::new(
            FRAME_POOL_SLOTS,
            FRAME_RING_CAPACITY,
            params.max_size as u32,
            params.max_size as u32,
        );
        let mailbox = Arc::new(Mailbox::new(queue.pool().clone()));
        Ok(Self {
            params,
            state: SessionState::Disconnected,
            launcher,
            metrics: Arc::new(Metrics::new()),
            queue,
            mailbox,
            video_channel: None,
            control_channel: None,
            rudp_video: None,
            control: None,
            demuxer: None,
            demux_events: None,
            device_name: String::new(),
            video_size: (0, 0),
            observers: Vec::new(),
            next_observer_id: 1,
            last_metrics_tick: Instant::now(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Decoded frames for the renderer arrive here.
    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn control_sender(&self) -> Option<&Arc<ControlSender>> {
        self.control.as_ref()
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn video_size(&self) -> (u32, u32) {
        self.video_size
    }

    pub fn subscribe(&mut self, observer: SessionObserver) -> u64 {
        let id = self.next_observer_id;
        self.next_observer_id += 1;
        self.observers.push((id, observer));
        id
    }

    pub fn unsubscribe(&mut self, id: u64) {
        self.observers.retain(|(observer_id, _)| *observer_id != id);
    }

    /// Launch the agent, connect, handshake and start streaming.
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Connecting)?;

        if let Err(err) = self.launcher.start(&self.params) {
            self.fail(&err);
            return Err(err);
        }

        match self.connect_and_handshake() {
            Ok(()) => {}
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        }

        match self.start_streaming() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn connect_and_handshake(&mut self) -> Result<(), SessionError> {
        let deadline = Instant::now() + self.params.connect_timeout;

        match self.params.transport() {
            Transport::ReliableUdp => {
                let host = self
                    .params
                    .device_host()
                    .ok_or_else(|| SessionError::InvalidParameter("serial has no host".into()))?
                    .to_string();
                let cfg = ArqConfig::for_bitrate(self.params.bit_rate);

                let video = RudpChannel::connect(
                    self.params.video_port(),
                    format!("{host}:{}", self.params.video_port())
                        .parse()
                        .map_err(|_| {
                            SessionError::InvalidParameter(format!("bad device host '{host}'"))
                        })?,
                    kagami_transport::rudp::VIDEO_CONV,
                    cfg,
                    self.params.fec_group,
                )
                .map_err(|err| SessionError::ConnectionFailed(err.to_string()))?;

                let control = RudpChannel::connect(
                    self.params.control_port(),
                    format!("{host}:{}", self.params.control_port())
                        .parse()
                        .map_err(|_| {
                            SessionError::InvalidParameter(format!("bad device host '{host}'"))
                        })?,
                    kagami_transport::rudp::VIDEO_CONV,
                    ArqConfig::default(),
                    None,
                )
                .map_err(|err| SessionError::ConnectionFailed(err.to_string()))?;

                let video = Arc::new(video);
                self.transition(SessionState::Handshaking)?;

                // The agent opens the stream with a 12-byte codec/size
                // preamble.
                let mut preamble = [0u8; 12];
                read_exact_deadline(video.as_ref(), &mut preamble, deadline)?;
                let header = VideoHeader::decode(&preamble)
                    .map_err(|err| SessionError::HandshakeFailed(err.to_string()))?;
                if header.width > 0 && header.height > 0 {
                    self.video_size = (header.width, header.height);
                }
                self.device_name = self.params.serial.clone();

                self.rudp_video = Some(video.clone());
                self.video_channel = Some(video);
                self.control_channel = Some(Arc::new(control));
            }
            Transport::Tcp => {
                let listener =
                    std::net::TcpListener::bind(("127.0.0.1", self.params.video_port()))
                        .map_err(|err| SessionError::ConnectionFailed(err.to_string()))?;
                let control_listener =
                    std::net::TcpListener::bind(("127.0.0.1", self.params.control_port()))
                        .map_err(|err| SessionError::ConnectionFailed(err.to_string()))?;

                let video = TcpChannel::accept(&listener, self.params.connect_timeout)
                    .map_err(|err| match err {
                        TransportError::TimedOut => SessionError::Timeout,
                        other => SessionError::ConnectionFailed(other.to_string()),
                    })?;

                self.transition(SessionState::Handshaking)?;

                // 64 bytes of device identity, then codec id and video size.
                let mut info = [0u8; DEVICE_NAME_FIELD_LEN + 12];
                read_exact_deadline(&video, &mut info, deadline)?;
                let name_end = info[..DEVICE_NAME_FIELD_LEN]
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(DEVICE_NAME_FIELD_LEN);
                self.device_name =
                    String::from_utf8_lossy(&info[..name_end]).into_owned();
                let header = VideoHeader::decode(&info[DEVICE_NAME_FIELD_LEN..])
                    .map_err(|err| SessionError::HandshakeFailed(err.to_string()))?;
                if header.width > 0 && header.height > 0 {
                    self.video_size = (header.width, header.height);
                }

                let control = TcpChannel::accept(&control_listener, self.params.connect_timeout)
                    .map_err(|err| match err {
                        TransportError::TimedOut => SessionError::Timeout,
                        other => SessionError::ConnectionFailed(other.to_string()),
                    })?;

                self.video_channel = Some(Arc::new(video));
                self.control_channel = Some(Arc::new(control));
            }
        }

        log::info!(
            "session: handshake done, device '{}' streaming at {}x{}",
            self.device_name,
            self.video_size.0,
            self.video_size.1
        );
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<(), SessionError> {
        let video_channel = self
            .video_channel
            .clone()
            .ok_or(SessionError::NotInitialized)?;
        let control_channel = self
            .control_channel
            .clone()
            .ok_or(SessionError::NotInitialized)?;

        if self.video_size != (0, 0) {
            self.queue.resize(self.video_size.0, self.video_size.1);
        }

        let decoder = VideoDecoder::open(
            DecoderConfig {
                codec: VideoCodec::from_name(&self.params.codec_name),
                width: self.video_size.0,
                height: self.video_size.1,
                prefer_hardware: self.params.prefer_hardware_decode,
                semi_planar_passthrough: true,
            },
            self.queue.clone(),
            self.mailbox.clone(),
            self.metrics.clone(),
        )?;
        if decoder.fell_back_to_software() {
            self.notify_error(&SessionError::HardwareDecoderFallback);
        }

        let (events_tx, events_rx) = unbounded();
        let metrics = self.metrics.clone();
        let mut decoder = decoder;
        let mut consecutive_failures = 0u32;
        let demuxer = Demuxer::spawn(
            video_channel,
            move |packet| match decoder.decode(&packet) {
                Ok(()) => {
                    consecutive_failures = 0;
                    true
                }
                Err(err) => {
                    consecutive_failures += 1;
                    metrics.report_frame_dropped();
                    log::warn!("decode failed ({consecutive_failures} in a row): {err}");
                    consecutive_failures < DECODE_FAILURE_LIMIT
                }
            },
            events_tx,
        )
        .map_err(|err| SessionError::ConnectionFailed(err.to_string()))?;

        self.demuxer = Some(demuxer);
        self.demux_events = Some(events_rx);
        self.control = Some(Arc::new(ControlSender::new(
            control_channel,
            self.metrics.clone(),
        )));

        self.transition(SessionState::Streaming)?;
        Ok(())
    }

    /// Window hidden: stop rendering but keep the stream alive.
    pub fn pause(&mut self) {
        if self.state == SessionState::Streaming {
            let _ = self.transition(SessionState::Paused);
        }
    }

    pub fn resume(&mut self) {
        if self.state == SessionState::Paused {
            let _ = self.transition(SessionState::Streaming);
        }
    }

    /// Tear everything down in reverse start order. Safe from any state.
    pub fn stop(&mut self) {
        match self.state {
            SessionState::Disconnected => return,
            SessionState::Error => {
                let _ = self.transition(SessionState::Disconnected);
                return;
            }
            _ => {
                let _ = self.transition(SessionState::Disconnecting);
            }
        }

        // Give the agent the chance to exit cleanly.
        if let Some(control) = &self.control {
            control.control_msg(&ControlMsg::Disconnect);
            control.stop();
        }
        self.control = None;

        if let Some(channel) = &self.video_channel {
            // Closing the socket aborts the demuxer's blocking read.
            channel.close();
        }
        if let Some(mut demuxer) = self.demuxer.take() {
            demuxer.stop();
        }
        self.demux_events = None;

        if let Some(channel) = self.control_channel.take() {
            channel.close();
        }
        self.video_channel = None;
        self.rudp_video = None;
        self.queue.clear();

        self.launcher.stop();
        let _ = self.transition(SessionState::Disconnected);
    }

    /// Event-loop tick: watches the demuxer and fires the 1 Hz metrics
    /// update.
    pub fn poll(&mut self, now: Instant) {
        let stream_stopped = self
            .demux_events
            .as_ref()
            .is_some_and(|events| matches!(events.try_recv(), Ok(DemuxEvent::StreamStopped)));
        if stream_stopped && matches!(self.state, SessionState::Streaming | SessionState::Paused) {
            let err = SessionError::ConnectionLost;
            log::warn!("session: {err}");
            self.fail(&err);
        }

        if now.duration_since(self.last_metrics_tick) >= METRICS_TICK {
            self.last_metrics_tick = now;
            if let Some(rudp) = &self.rudp_video {
                let stats = rudp.stats();
                self.metrics.report_bytes_sent(stats.bytes_sent);
                self.metrics.report_bytes_received(stats.bytes_received);
                self.metrics.report_pending_bytes(stats.pending_bytes as i64);
                self.metrics.report_retransmits(stats.retransmits);
                self.metrics.report_fec_recovered(stats.fec_recovered);
            }
            let snapshot = self.metrics.snapshot();
            for (_, observer) in &self.observers {
                if let Some(on_metrics) = &observer.on_metrics {
                    on_metrics(&snapshot);
                }
            }
        }
    }

    fn transition(&mut self, to: SessionState) -> Result<(), SessionError> {
        if !is_valid_transition(self.state, to) {
            // A bug, not a runtime condition: reject and keep the state.
            log::error!("session: invalid transition {} -> {to}", self.state);
            return Err(SessionError::InvalidParameter(format!(
                "invalid state transition {} -> {to}",
                self.state
            )));
        }
        log::debug!("session: {} -> {to}", self.state);
        self.state = to;
        for (_, observer) in &self.observers {
            if let Some(on_state) = &observer.on_state {
                on_state(to);
            }
        }
        Ok(())
    }

    fn notify_error(&self, err: &SessionError) {
        for (_, observer) in &self.observers {
            if let Some(on_error) = &observer.on_error {
                on_error(err);
            }
        }
    }

    fn fail(&mut self, err: &SessionError) {
        self.notify_error(err);
        if self.state != SessionState::Error {
            let _ = self.transition(SessionState::Error);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_exact_deadline(
    channel: &dyn Channel,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<(), SessionError> {
    let mut filled = 0;
    while filled < buf.len() {
        if Instant::now() >= deadline {
            return Err(SessionError::Timeout);
        }
        match channel.recv(&mut buf[filled..]) {
            Ok(0) => return Err(SessionError::HandshakeFailed("peer closed".into())),
            Ok(n) => filled += n,
            Err(TransportError::TimedOut) => {}
            Err(err) => return Err(SessionError::HandshakeFailed(err.to_string())),
        }
    }
    Ok(())
}
