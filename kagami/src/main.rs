use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use winit::{
    dpi,
    event::{ElementState, Event, KeyEvent, MouseButton, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    keyboard::PhysicalKey,
    raw_window_handle::{HasDisplayHandle, HasRawDisplayHandle, HasRawWindowHandle, HasWindowHandle},
    window::{CursorGrabMode, Window, WindowBuilder},
};

use kagami::control::ControlOutput;
use kagami::input::{InputConverter, MouseEvent, WindowHooks};
use kagami::keymap::{KeyMap, MouseButtonId, UserGestures};
use kagami::launcher::{AdbRunner, Launcher};
use kagami::script::{ScriptHost, ScriptShared};
use kagami::session::{Session, SessionObserver, SessionParams, SessionState};

use kagami_graphics::{FrameGrab, VideoRenderer};
use kagami_transport::TouchSequence;

struct CliOptions {
    params: SessionParams,
    keymap_path: Option<PathBuf>,
}

fn parse_args() -> Result<CliOptions> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!(
            "Usage: {} <device-serial> <agent-path> [--keymap file.json] [--keymap-dir dir] \
             [--max-size N] [--bit-rate BPS] [--max-fps N] [--codec h264|h265] [--no-hwdec]",
            args[0]
        );
        std::process::exit(1);
    }

    let mut params = SessionParams {
        serial: args[1].clone(),
        agent_local_path: args[2].clone(),
        connection_id: rand::rng().random(),
        ..Default::default()
    };
    let mut keymap_path = None;

    let mut iter = args[3..].iter();
    while let Some(flag) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow!("{name} needs a value"))
        };
        match flag.as_str() {
            "--keymap" => keymap_path = Some(PathBuf::from(value("--keymap")?)),
            "--keymap-dir" => params.keymap_dir = Some(value("--keymap-dir")?),
            "--max-size" => params.max_size = value("--max-size")?.parse()?,
            "--bit-rate" => params.bit_rate = value("--bit-rate")?.parse()?,
            "--max-fps" => params.max_fps = value("--max-fps")?.parse()?,
            "--codec" => params.codec_name = value("--codec")?,
            "--no-hwdec" => params.prefer_hardware_decode = false,
            other => return Err(anyhow!("unknown flag {other}")),
        }
    }

    Ok(CliOptions {
        params,
        keymap_path,
    })
}

/// Cursor control for the input converter, backed by the winit window.
struct CursorHooks {
    window: Arc<Window>,
}

impl WindowHooks for CursorHooks {
    fn grab_cursor(&self, grab: bool) {
        if grab {
            if self
                .window
                .set_cursor_grab(CursorGrabMode::Confined)
                .is_err()
            {
                let _ = self.window.set_cursor_grab(CursorGrabMode::Locked);
            }
            self.window.set_cursor_visible(false);
        } else {
            let _ = self.window.set_cursor_grab(CursorGrabMode::None);
            self.window.set_cursor_visible(true);
        }
    }

    fn set_cursor_position(&self, x: f64, y: f64) {
        let _ = self
            .window
            .set_cursor_position(dpi::PhysicalPosition::new(x, y));
    }
}

/// Frame grabs cross from the GUI thread to the script worker through a
/// request flag plus a cache; the render loop services requests between
/// frames.
#[derive(Default)]
struct GrabBridge {
    requested: AtomicBool,
    cache: Mutex<Option<FrameGrab>>,
    ready: Condvar,
}

impl GrabBridge {
    fn request(&self) -> Option<FrameGrab> {
        let mut cache = self.cache.lock();
        // Always a fresh frame, never last request's leftovers.
        *cache = None;
        self.requested.store(true, Ordering::Release);
        let _ = self
            .ready
            .wait_while_for(&mut cache, |c| c.is_none(), Duration::from_millis(200));
        cache.clone()
    }

    fn service(&self, renderer: &VideoRenderer) {
        if self.requested.swap(false, Ordering::AcqRel) {
            let mut cache = self.cache.lock();
            *cache = renderer.grab();
            self.ready.notify_all();
        }
    }
}

fn mouse_button_id(button: MouseButton) -> Option<MouseButtonId> {
    match button {
        MouseButton::Left => Some(MouseButtonId::Left),
        MouseButton::Middle => Some(MouseButtonId::Middle),
        MouseButton::Right => Some(MouseButtonId::Right),
        MouseButton::Back => Some(MouseButtonId::Back),
        MouseButton::Forward => Some(MouseButtonId::Forward),
        MouseButton::Other(_) => None,
    }
}

fn main() -> Result<()> {
    let env = env_logger::Env::default().filter_or("KAGAMI_LOG", "info");
    env_logger::init_from_env(env);

    let options = parse_args()?;

    let launcher = Launcher::new(Box::new(AdbRunner::default()));
    let mut session = Session::new(options.params, launcher)?;
    session.subscribe(SessionObserver {
        on_state: Some(Box::new(|state| log::info!("session state: {state}"))),
        on_metrics: Some(Box::new(|snapshot| {
            log::debug!(
                "fps {} decode {:.1}ms render {:.1}ms queue {} pool {}/{}",
                snapshot.fps,
                snapshot.decode.avg_ms,
                snapshot.render.avg_ms,
                snapshot.queue_depth,
                snapshot.pool_used,
                snapshot.pool_total,
            );
        })),
        on_error: Some(Box::new(|err| match err.hint() {
            Some(hint) => log::error!("{err} ({hint})"),
            None => log::error!("{err}"),
        })),
    });

    log::info!("connecting to {}", session.params().serial);
    session.start()?;
    let (video_w, video_h) = session.video_size();
    log::info!(
        "streaming from '{}' at {video_w}x{video_h}",
        session.device_name()
    );

    // Window sized to the device aspect, capped to a sane desktop size.
    let event_loop = EventLoop::new()?;
    let scale = (900.0 / video_h.max(1) as f64).min(1.0);
    let window = Arc::new(
        WindowBuilder::new()
            .with_title(format!("kagami - {}", session.device_name()))
            .with_inner_size(dpi::PhysicalSize::new(
                (video_w as f64 * scale).max(320.0),
                (video_h as f64 * scale).max(240.0),
            ))
            .build(&event_loop)?,
    );

    let mut renderer = VideoRenderer::new(
        window.window_handle()?.raw_window_handle()?,
        window.display_handle()?.raw_display_handle()?,
        session.metrics().clone(),
    )?;

    let control = session
        .control_sender()
        .cloned()
        .ok_or_else(|| anyhow!("session has no control channel"))?;
    let control: Arc<dyn ControlOutput> = control;
    let seqs = Arc::new(TouchSequence::new());
    let script_shared = Arc::new(ScriptShared::default());

    let grab_bridge = Arc::new(GrabBridge::default());
    {
        let bridge = grab_bridge.clone();
        script_shared.set_frame_grab(Box::new(move || bridge.request()));
    }
    if let Some(dir) = &session.params().keymap_dir {
        let dir = PathBuf::from(dir);
        match UserGestures::load(&dir) {
            Ok(gestures) => log::info!(
                "loaded {} buttons and {} swipes from {dir:?}",
                gestures.buttons.len(),
                gestures.swipes.len()
            ),
            Err(err) => log::warn!("{err}"),
        }
        script_shared.set_images_dir(dir.join("images"));
    }

    let mut converter = InputConverter::new(
        control.clone(),
        seqs.clone(),
        Arc::new(CursorHooks {
            window: window.clone(),
        }),
        session.metrics().clone(),
    );
    converter.set_script_host(ScriptHost::new(control, seqs, script_shared));

    if let Some(path) = &options.keymap_path {
        let json = std::fs::read_to_string(path)?;
        converter.load_keymap(KeyMap::parse(&json)?);
        log::info!("key map loaded from {path:?}");
    } else if let Some(json) = session.params().keymap_json.clone() {
        converter.load_keymap(KeyMap::parse(&json)?);
    }

    let window_size = window.inner_size();
    converter.update_sizes(session.video_size(), (window_size.width, window_size.height));

    // When the window is hidden we still drain the mailbox on a short
    // timer so the decoder is never back-pressured.
    let mut last_hidden_drain = Instant::now();

    event_loop.run(move |event, eltw| {
        eltw.set_control_flow(ControlFlow::Poll);

        match event {
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => {
                    session.stop();
                    eltw.exit();
                }
                WindowEvent::Resized(size) => {
                    converter.update_sizes(session.video_size(), (size.width, size.height));
                }
                WindowEvent::Occluded(hidden) => {
                    if hidden {
                        session.pause();
                    } else {
                        session.resume();
                    }
                }
                WindowEvent::KeyboardInput {
                    event:
                        KeyEvent {
                            physical_key: PhysicalKey::Code(code),
                            state,
                            repeat,
                            ..
                        },
                    ..
                } => {
                    converter.key_event(code, state == ElementState::Pressed, repeat);
                }
                WindowEvent::MouseInput { state, button, .. } => {
                    if let Some(button) = mouse_button_id(button) {
                        let event = if state == ElementState::Pressed {
                            MouseEvent::Pressed(button)
                        } else {
                            MouseEvent::Released(button)
                        };
                        converter.mouse_event(event);
                    }
                }
                WindowEvent::CursorMoved { position, .. } => {
                    converter.mouse_event(MouseEvent::Moved {
                        position: (position.x, position.y),
                    });
                }
                WindowEvent::RedrawRequested => {
                    if session.state() == SessionState::Paused {
                        // Consume without drawing.
                        drop(session.mailbox().take());
                    } else {
                        let frame = session.mailbox().take();
                        if let Err(err) = renderer.render(frame) {
                            log::error!("render failed: {err}");
                        }
                        grab_bridge.service(&renderer);
                    }
                }
                _ => (),
            },
            Event::AboutToWait => {
                let now = Instant::now();
                converter.poll(now);
                session.poll(now);

                if session.state() == SessionState::Paused {
                    if now.duration_since(last_hidden_drain) >= Duration::from_millis(16) {
                        last_hidden_drain = now;
                        drop(session.mailbox().take());
                    }
                } else {
                    window.request_redraw();
                }

                if session.state() == SessionState::Error {
                    log::error!("session failed, shutting down");
                    session.stop();
                    eltw.exit();
                }
            }
            _ => (),
        }
    })?;

    Ok(())
}
