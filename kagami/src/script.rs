//! Script host for bespoke key behaviours.
//!
//! Each `script` key-map node carries rhai source. Scripts are compiled
//! once (AST cached by source) and run on a dedicated worker thread, so a
//! script `delay` never stalls the window loop and key events keep being
//! delivered while a script sleeps. Calls back into the input converter
//! (view reset, steer retune) travel through a command queue the converter
//! drains on its poll tick.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, Map, AST};

use kagami_graphics::FrameGrab;
use kagami_transport::control::{ACTION_DOWN, ACTION_MOVE, ACTION_UP};
use kagami_transport::TouchSequence;

use crate::control::ControlOutput;
use crate::input::keycode::android_keycode_by_name;

/// Requests a script makes of the input converter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConverterCommand {
    ResetView,
    DirectionReset,
    SetRadialParam {
        up: f64,
        down: f64,
        left: f64,
        right: f64,
    },
    SetCursorCapture(bool),
}

#[derive(Clone, Copy, Debug, Default)]
struct InvokeContext {
    anchor: (f64, f64),
    pressed: bool,
    key_id: i64,
}

pub type FrameGrabFn = Box<dyn Fn() -> Option<FrameGrab> + Send + Sync>;

/// State shared between the converter (writer) and script functions
/// (readers), plus the command queue flowing the other way.
#[derive(Default)]
pub struct ScriptShared {
    video_size: Mutex<(u32, u32)>,
    mouse_pos: Mutex<(f64, f64)>,
    key_states: Mutex<HashMap<String, bool>>,
    key_positions: Mutex<HashMap<String, (f64, f64)>>,
    commands: Mutex<Vec<ConverterCommand>>,
    hold_seqs: Mutex<HashMap<i64, u32>>,
    frame_grab: Mutex<Option<FrameGrabFn>>,
    images_dir: Mutex<Option<PathBuf>>,
    context: Mutex<InvokeContext>,
}

impl ScriptShared {
    pub fn set_video_size(&self, width: u32, height: u32) {
        *self.video_size.lock() = (width, height);
    }

    pub fn set_mouse_pos(&self, x: f64, y: f64) {
        *self.mouse_pos.lock() = (x, y);
    }

    pub fn set_key_state(&self, key_name: String, pressed: bool) {
        self.key_states.lock().insert(key_name, pressed);
    }

    pub fn set_key_position(&self, key_name: String, pos: (f64, f64)) {
        self.key_positions.lock().insert(key_name, pos);
    }

    pub fn set_frame_grab(&self, grab: FrameGrabFn) {
        *self.frame_grab.lock() = Some(grab);
    }

    pub fn set_images_dir(&self, dir: PathBuf) {
        *self.images_dir.lock() = Some(dir);
    }

    pub fn drain_commands(&self) -> Vec<ConverterCommand> {
        std::mem::take(&mut self.commands.lock())
    }

    fn push_command(&self, command: ConverterCommand) {
        self.commands.lock().push(command);
    }

    fn anchored(&self, x: f64, y: f64) -> (f64, f64) {
        let ctx = self.context.lock();
        let tx = if x < 0.0 { ctx.anchor.0 } else { x };
        let ty = if y < 0.0 { ctx.anchor.1 } else { y };
        (tx.clamp(0.0, 1.0), ty.clamp(0.0, 1.0))
    }
}

enum Job {
    Invoke {
        source: String,
        context: InvokeContext,
    },
    Shutdown,
}

pub struct ScriptHost {
    shared: Arc<ScriptShared>,
    jobs: Sender<Job>,
    worker: Option<JoinHandle<()>>,
}

impl ScriptHost {
    pub fn new(
        out: Arc<dyn ControlOutput>,
        seqs: Arc<TouchSequence>,
        shared: Arc<ScriptShared>,
    ) -> Self {
        let engine = build_engine(out, seqs.clone(), shared.clone());
        let (jobs, job_rx) = unbounded::<Job>();

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("script-host".into())
            .spawn(move || {
                let mut cache: HashMap<String, AST> = HashMap::new();
                while let Ok(job) = job_rx.recv() {
                    let Job::Invoke { source, context } = job else {
                        break;
                    };
                    run_one(&engine, &worker_shared, &mut cache, source, context);
                }
            })
            .expect("spawn script host");

        Self {
            shared,
            jobs,
            worker: Some(worker),
        }
    }

    pub fn shared(&self) -> &Arc<ScriptShared> {
        &self.shared
    }

    /// Queue one script run; returns immediately.
    pub fn invoke(&self, source: &str, anchor: (f64, f64), pressed: bool, key_id: i64) {
        let job = Job::Invoke {
            source: source.to_owned(),
            context: InvokeContext {
                anchor,
                pressed,
                key_id,
            },
        };
        if self.jobs.send(job).is_err() {
            log::warn!("script host is gone, dropping invocation");
        }
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_one(
    engine: &Engine,
    shared: &ScriptShared,
    cache: &mut HashMap<String, AST>,
    source: String,
    context: InvokeContext,
) {
    use std::collections::hash_map::Entry;

    let ast = match cache.entry(source) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => match engine.compile(entry.key()) {
            Ok(ast) => entry.insert(ast),
            Err(err) => {
                log::warn!("script compile error: {err}");
                return;
            }
        },
    };

    // Registered functions read the invocation context from the shared
    // state; jobs run strictly one at a time on this thread.
    *shared.context.lock() = context;

    if let Err(err) = engine.eval_ast::<Dynamic>(ast) {
        log::warn!("script error: {err}");
    }
}

fn build_engine(
    out: Arc<dyn ControlOutput>,
    seqs: Arc<TouchSequence>,
    shared: Arc<ScriptShared>,
) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_expr_depths(64, 64);

    // click(x, y) / click() at the anchor: momentary tap.
    {
        let (out, seqs, shared) = (out.clone(), seqs.clone(), shared.clone());
        let click = move |x: f64, y: f64| {
            if !shared.context.lock().pressed {
                return;
            }
            let (tx, ty) = shared.anchored(x, y);
            let seq = seqs.next();
            out.fast_touch(seq, ACTION_DOWN, tx, ty);
            out.fast_touch(seq, ACTION_UP, tx, ty);
        };
        let with_pos = click.clone();
        engine.register_fn("click", move || with_pos(-1.0, -1.0));
        engine.register_fn("click", click);
    }

    // holdpress: DOWN on key press, UP on the matching release. Each bound
    // key owns its sequence id so repeats do not leak touch points.
    {
        let (out, seqs, shared) = (out.clone(), seqs.clone(), shared.clone());
        let holdpress = move |x: f64, y: f64| {
            let (pressed, key_id) = {
                let ctx = shared.context.lock();
                (ctx.pressed, ctx.key_id)
            };
            let (tx, ty) = shared.anchored(x, y);
            let mut holds = shared.hold_seqs.lock();
            if pressed {
                if let Some(stale) = holds.remove(&key_id) {
                    out.fast_touch(stale, ACTION_UP, tx, ty);
                }
                let seq = seqs.next();
                holds.insert(key_id, seq);
                out.fast_touch(seq, ACTION_DOWN, tx, ty);
            } else if let Some(seq) = holds.remove(&key_id) {
                out.fast_touch(seq, ACTION_UP, tx, ty);
            }
        };
        let with_pos = holdpress.clone();
        engine.register_fn("holdpress", move || with_pos(-1.0, -1.0));
        engine.register_fn("holdpress", holdpress);
    }

    // release(): lift at the anchor with a fresh id.
    {
        let (out, seqs, shared) = (out.clone(), seqs.clone(), shared.clone());
        engine.register_fn("release", move || {
            let (tx, ty) = shared.anchored(-1.0, -1.0);
            out.fast_touch(seqs.next(), ACTION_UP, tx, ty);
        });
    }

    // slide: DOWN, interpolated MOVEs with delays, UP.
    {
        let (out, seqs, shared) = (out.clone(), seqs.clone(), shared.clone());
        engine.register_fn(
            "slide",
            move |sx: f64, sy: f64, ex: f64, ey: f64, duration_ms: i64, steps: i64| {
                if !shared.context.lock().pressed {
                    return;
                }
                let steps = steps.max(1);
                let seq = seqs.next();
                out.fast_touch(seq, ACTION_DOWN, sx, sy);
                let step_delay = (duration_ms.max(0) as u64) / steps as u64;
                for i in 1..=steps {
                    if step_delay > 0 {
                        std::thread::sleep(Duration::from_millis(step_delay));
                    }
                    let t = i as f64 / steps as f64;
                    out.fast_touch(seq, ACTION_MOVE, sx + (ex - sx) * t, sy + (ey - sy) * t);
                }
                out.fast_touch(seq, ACTION_UP, ex, ey);
            },
        );
    }

    // key("BACK"): protocol key down/up following the bound key's state.
    {
        let (out, shared) = (out.clone(), shared.clone());
        engine.register_fn("key", move |name: &str| {
            let Some(code) = android_keycode_by_name(name) else {
                log::warn!("script: unknown key name '{name}'");
                return;
            };
            out.fast_key(shared.context.lock().pressed, code);
        });
    }

    engine.register_fn("delay", |ms: i64| {
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms as u64));
        }
    });

    {
        let shared = shared.clone();
        engine.register_fn("resetview", move || {
            shared.push_command(ConverterCommand::ResetView);
        });
    }
    {
        let shared = shared.clone();
        engine.register_fn("directionreset", move || {
            shared.push_command(ConverterCommand::DirectionReset);
        });
    }
    {
        let shared = shared.clone();
        engine.register_fn(
            "set_radial_param",
            move |up: f64, down: f64, left: f64, right: f64| {
                shared.push_command(ConverterCommand::SetRadialParam {
                    up,
                    down,
                    left,
                    right,
                });
            },
        );
    }
    {
        let shared = shared.clone();
        engine.register_fn("shotmode", move |enter: bool| {
            shared.push_command(ConverterCommand::SetCursorCapture(enter));
        });
    }

    {
        let shared = shared.clone();
        engine.register_fn("getmousepos", move || -> Map {
            let (x, y) = *shared.mouse_pos.lock();
            let mut map = Map::new();
            map.insert("x".into(), Dynamic::from_float(x));
            map.insert("y".into(), Dynamic::from_float(y));
            map
        });
    }
    {
        let shared = shared.clone();
        engine.register_fn("getkeypos", move |name: &str| -> Map {
            let mut map = Map::new();
            let pos = shared.key_positions.lock().get(name).copied();
            let (x, y) = pos.unwrap_or((-1.0, -1.0));
            map.insert("x".into(), Dynamic::from_float(x));
            map.insert("y".into(), Dynamic::from_float(y));
            map
        });
    }
    {
        let shared = shared.clone();
        engine.register_fn("get_key_state", move |name: &str| -> i64 {
            let states = shared.key_states.lock();
            states.get(name).copied().unwrap_or(false) as i64
        });
    }

    engine.register_fn("tip", |msg: &str| {
        log::info!("[script] {msg}");
    });

    // Template match over the newest rendered frame's luma plane.
    {
        let shared = shared.clone();
        let full = move |name: &str, x1: f64, y1: f64, x2: f64, y2: f64, threshold: f64| -> Map {
            find_image_impl(&shared, name, (x1, y1), (x2, y2), threshold)
        };
        let whole_frame = full.clone();
        engine.register_fn("find_image", move |name: &str| -> Map {
            whole_frame(name, 0.0, 0.0, 1.0, 1.0, 0.8)
        });
        engine.register_fn("find_image", full);
    }

    engine
}

fn find_image_impl(
    shared: &ScriptShared,
    name: &str,
    top_left: (f64, f64),
    bottom_right: (f64, f64),
    threshold: f64,
) -> Map {
    let mut result = Map::new();
    result.insert("found".into(), Dynamic::from_bool(false));
    result.insert("x".into(), Dynamic::from_float(-1.0));
    result.insert("y".into(), Dynamic::from_float(-1.0));
    result.insert("confidence".into(), Dynamic::from_float(0.0));

    let Some(grab) = shared.frame_grab.lock().as_ref().and_then(|f| f()) else {
        return result;
    };
    let Some(dir) = shared.images_dir.lock().clone() else {
        return result;
    };
    let mut path = dir.join(name);
    if path.extension().is_none() {
        path.set_extension("png");
    }
    let template = match image::open(&path) {
        Ok(img) => img.to_luma8(),
        Err(err) => {
            log::warn!("find_image: cannot load {path:?}: {err}");
            return result;
        }
    };

    let region_x0 = ((top_left.0.clamp(0.0, 1.0)) * grab.width as f64) as u32;
    let region_y0 = ((top_left.1.clamp(0.0, 1.0)) * grab.height as f64) as u32;
    let region_x1 = ((bottom_right.0.clamp(0.0, 1.0)) * grab.width as f64) as u32;
    let region_y1 = ((bottom_right.1.clamp(0.0, 1.0)) * grab.height as f64) as u32;

    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || region_x1 <= region_x0 + tw || region_y1 <= region_y0 + th {
        return result;
    }

    let mut best = (0u32, 0u32, f64::MAX);
    for y in (region_y0..=region_y1 - th).step_by(2) {
        for x in (region_x0..=region_x1 - tw).step_by(2) {
            let mut total = 0u64;
            // Sparse sampling keeps the scan cheap; matches are refined by
            // the threshold anyway.
            for ty in (0..th).step_by(2) {
                for tx in (0..tw).step_by(2) {
                    let frame_px =
                        grab.luma[((y + ty) * grab.width + (x + tx)) as usize] as i64;
                    let tmpl_px = template.get_pixel(tx, ty).0[0] as i64;
                    total += frame_px.abs_diff(tmpl_px);
                }
            }
            let samples = (th.div_ceil(2) * tw.div_ceil(2)) as f64;
            let mad = total as f64 / samples;
            if mad < best.2 {
                best = (x, y, mad);
            }
        }
    }

    let confidence = 1.0 - best.2 / 255.0;
    if confidence >= threshold {
        let cx = (best.0 + tw / 2) as f64 / grab.width as f64;
        let cy = (best.1 + th / 2) as f64 / grab.height as f64;
        result.insert("found".into(), Dynamic::from_bool(true));
        result.insert("x".into(), Dynamic::from_float(cx));
        result.insert("y".into(), Dynamic::from_float(cy));
    }
    result.insert("confidence".into(), Dynamic::from_float(confidence));
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        touches: Mutex<Vec<(u32, u8, f64, f64)>>,
        keys: Mutex<Vec<(bool, u16)>>,
    }

    impl ControlOutput for Recorder {
        fn fast_touch(&self, seq: u32, action: u8, x: f64, y: f64) {
            self.touches.lock().push((seq, action, x, y));
        }

        fn fast_key(&self, down: bool, keycode: u16) {
            self.keys.lock().push((down, keycode));
        }

        fn control_msg(&self, _msg: &kagami_transport::ControlMsg) {}
    }

    fn host() -> (ScriptHost, Arc<Recorder>, Arc<ScriptShared>) {
        let recorder = Arc::new(Recorder::default());
        let shared = Arc::new(ScriptShared::default());
        let host = ScriptHost::new(
            recorder.clone(),
            Arc::new(TouchSequence::new()),
            shared.clone(),
        );
        (host, recorder, shared)
    }

    fn settle() {
        std::thread::sleep(Duration::from_millis(150));
    }

    #[test]
    fn click_taps_at_anchor() {
        let (host, recorder, _) = host();
        host.invoke("click()", (0.3, 0.7), true, 1);
        settle();
        let touches = recorder.touches.lock();
        assert_eq!(touches.len(), 2);
        assert_eq!(touches[0].1, ACTION_DOWN);
        assert_eq!((touches[0].2, touches[0].3), (0.3, 0.7));
        assert_eq!(touches[1].1, ACTION_UP);
        // One gesture, one id.
        assert_eq!(touches[0].0, touches[1].0);
    }

    #[test]
    fn click_on_release_does_nothing() {
        let (host, recorder, _) = host();
        host.invoke("click()", (0.3, 0.7), false, 1);
        settle();
        assert!(recorder.touches.lock().is_empty());
    }

    #[test]
    fn holdpress_pairs_down_and_up_by_key() {
        let (host, recorder, _) = host();
        host.invoke("holdpress()", (0.2, 0.2), true, 7);
        host.invoke("holdpress()", (0.2, 0.2), false, 7);
        settle();
        let touches = recorder.touches.lock();
        assert_eq!(touches.len(), 2);
        assert_eq!(touches[0].1, ACTION_DOWN);
        assert_eq!(touches[1].1, ACTION_UP);
        assert_eq!(touches[0].0, touches[1].0);
    }

    #[test]
    fn repeated_holdpress_does_not_leak_touches() {
        let (host, recorder, _) = host();
        host.invoke("holdpress()", (0.2, 0.2), true, 7);
        host.invoke("holdpress()", (0.2, 0.2), true, 7);
        host.invoke("holdpress()", (0.2, 0.2), false, 7);
        settle();
        let touches = recorder.touches.lock();
        // DOWN, then stale UP + new DOWN, then final UP: every DOWN has an UP.
        let downs = touches.iter().filter(|t| t.1 == ACTION_DOWN).count();
        let ups = touches.iter().filter(|t| t.1 == ACTION_UP).count();
        assert_eq!(downs, 2);
        assert_eq!(ups, 2);
    }

    #[test]
    fn slide_interpolates_moves() {
        let (host, recorder, _) = host();
        host.invoke("slide(0.1, 0.5, 0.5, 0.5, 0, 4)", (0.0, 0.0), true, 1);
        settle();
        let touches = recorder.touches.lock();
        assert_eq!(touches[0].1, ACTION_DOWN);
        let moves: Vec<_> = touches.iter().filter(|t| t.1 == ACTION_MOVE).collect();
        assert_eq!(moves.len(), 4);
        assert!((moves[1].2 - 0.3).abs() < 1e-9);
        assert_eq!(touches.last().unwrap().1, ACTION_UP);
    }

    #[test]
    fn key_sends_android_keycode() {
        let (host, recorder, _) = host();
        host.invoke(r#"key("BACK")"#, (0.0, 0.0), true, 1);
        host.invoke(r#"key("BACK")"#, (0.0, 0.0), false, 1);
        settle();
        let keys = recorder.keys.lock();
        assert_eq!(keys.as_slice(), &[(true, 4), (false, 4)]);
    }

    #[test]
    fn converter_commands_queue_up() {
        let (host, _, shared) = host();
        host.invoke("resetview(); set_radial_param(0.1, 0.2, 0.3, 0.4)", (0.0, 0.0), true, 1);
        settle();
        let commands = shared.drain_commands();
        assert_eq!(commands[0], ConverterCommand::ResetView);
        assert_eq!(
            commands[1],
            ConverterCommand::SetRadialParam {
                up: 0.1,
                down: 0.2,
                left: 0.3,
                right: 0.4
            }
        );
    }

    #[test]
    fn get_key_state_reads_shared_table() {
        let (host, recorder, shared) = host();
        shared.set_key_state("KeyW".into(), true);
        host.invoke(
            r#"if get_key_state("KeyW") == 1 { key("W") }"#,
            (0.0, 0.0),
            true,
            1,
        );
        settle();
        assert_eq!(recorder.keys.lock().len(), 1);
    }

    #[test]
    fn script_errors_do_not_kill_the_host() {
        let (host, recorder, _) = host();
        host.invoke("this is not rhai", (0.0, 0.0), true, 1);
        host.invoke("click()", (0.5, 0.5), true, 1);
        settle();
        assert_eq!(recorder.touches.lock().len(), 2);
    }
}
