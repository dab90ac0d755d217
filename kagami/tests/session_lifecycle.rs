//! Full session lifecycle against a fake on-device agent speaking the TCP
//! dialect over loopback.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kagami::launcher::{AgentProcess, CommandOutcome, CommandRunner, Launcher};
use kagami::session::{Session, SessionParams, SessionState};

use kagami_transport::wire::{PacketHeader, VideoHeader};

const VIDEO_PORT: u16 = 28650;

/// Stands in for adb: every command "succeeds", and spawning the agent
/// starts a thread that dials back into the session's listeners the way
/// the reverse tunnel would.
struct FakeAgentRunner {
    stop: Arc<AtomicBool>,
}

struct FakeAgentProcess {
    stop: Arc<AtomicBool>,
}

impl AgentProcess for FakeAgentProcess {
    fn kill(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl CommandRunner for FakeAgentRunner {
    fn run(&self, _args: &[String]) -> std::io::Result<CommandOutcome> {
        Ok(CommandOutcome {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn spawn(&self, _args: &[String]) -> std::io::Result<Box<dyn AgentProcess>> {
        let stop = self.stop.clone();
        let thread_stop = stop.clone();
        std::thread::spawn(move || fake_agent(thread_stop));
        Ok(Box::new(FakeAgentProcess { stop }))
    }
}

fn connect_with_retry(port: u16) -> Option<TcpStream> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => return Some(stream),
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20))
            }
            Err(_) => return None,
        }
    }
}

fn fake_agent(stop: Arc<AtomicBool>) {
    let Some(mut video) = connect_with_retry(VIDEO_PORT) else {
        return;
    };

    // Handshake: 64-byte device name, then codec id + video size.
    let mut name = [0u8; 64];
    name[..11].copy_from_slice(b"fake-device");
    video.write_all(&name).unwrap();
    let header = VideoHeader {
        codec_id: 0x6832_3634, // "h264"
        width: 640,
        height: 360,
    };
    video.write_all(&header.encode()).unwrap();

    // One CONFIG packet and one (bogus) media packet; the decoder treats
    // undecodable bytes as dropped frames, not as a fatal error.
    let config = [0u8; 16];
    video
        .write_all(&PacketHeader::config(config.len() as u32).encode())
        .unwrap();
    video.write_all(&config).unwrap();
    let media = [0u8; 32];
    video
        .write_all(&PacketHeader::media(1000, true, media.len() as u32).encode())
        .unwrap();
    video.write_all(&media).unwrap();

    let Some(mut control) = connect_with_retry(VIDEO_PORT + 1) else {
        return;
    };
    control
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();

    // Stay alive until told to die, draining control messages like the
    // real agent would.
    let mut buf = [0u8; 256];
    while !stop.load(Ordering::Acquire) {
        match control.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => break,
        }
    }
}

fn test_params() -> SessionParams {
    SessionParams {
        serial: "FAKESERIAL".into(),
        agent_local_path: "/tmp/fake-agent.jar".into(),
        video_port: VIDEO_PORT,
        connect_timeout: Duration::from_secs(5),
        prefer_hardware_decode: false,
        ..Default::default()
    }
}

#[test]
fn session_streams_and_stops_within_deadline() {
    let stop = Arc::new(AtomicBool::new(false));
    let launcher = Launcher::new(Box::new(FakeAgentRunner { stop }));
    let mut session = Session::new(test_params(), launcher).unwrap();

    assert_eq!(session.state(), SessionState::Disconnected);
    session.start().unwrap();
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(session.device_name(), "fake-device");
    assert_eq!(session.video_size(), (640, 360));
    assert!(session.control_sender().is_some());

    // Window hide/show drives Paused and back.
    session.pause();
    assert_eq!(session.state(), SessionState::Paused);
    session.resume();
    assert_eq!(session.state(), SessionState::Streaming);

    let started = Instant::now();
    session.stop();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "teardown took {:?}",
        started.elapsed()
    );
}

#[test]
fn failed_launch_lands_in_error_then_disconnected() {
    struct BrokenRunner;

    impl CommandRunner for BrokenRunner {
        fn run(&self, _args: &[String]) -> std::io::Result<CommandOutcome> {
            Ok(CommandOutcome {
                success: false,
                stdout: String::new(),
                stderr: "device offline".into(),
            })
        }

        fn spawn(&self, _args: &[String]) -> std::io::Result<Box<dyn AgentProcess>> {
            unreachable!("launch fails before the agent starts")
        }
    }

    let mut params = test_params();
    params.video_port = VIDEO_PORT + 10;
    let mut session = Session::new(params, Launcher::new(Box::new(BrokenRunner))).unwrap();
    assert!(session.start().is_err());
    assert_eq!(session.state(), SessionState::Error);

    session.stop();
    assert_eq!(session.state(), SessionState::Disconnected);

    // The caller may restart after an error.
    assert!(session.start().is_err());
    assert_eq!(session.state(), SessionState::Error);
}
