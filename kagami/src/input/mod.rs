//! Input conversion: window events in, device protocol out.
//!
//! Three modes coexist. With the cursor visible, the primary button taps
//! the screen directly and the keyboard keeps working through its
//! bindings. With the cursor grabbed, mouse motion drives the viewport
//! touch and clicks fire their bound scripts. The steer-wheel runs in both
//! modes, so the user can keep walking while clicking through menus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use winit::keyboard::KeyCode;

use kagami_media::Metrics;
use kagami_transport::control::{ControlMsg, PositionRect, ACTION_DOWN, ACTION_MOVE, ACTION_UP};
use kagami_transport::control::POINTER_ID_GENERIC_FINGER;
use kagami_transport::TouchSequence;

use crate::control::ControlOutput;
use crate::input::keycode::android_keycode;
use crate::input::steer::SteerWheel;
use crate::input::viewport::Viewport;
use crate::keymap::{BindingTarget, KeyMap, KeyMapNode, MouseButtonId};
use crate::script::{ConverterCommand, ScriptHost};

pub mod keycode;
pub mod steer;
pub mod viewport;

/// The window-side services the converter needs: hiding/releasing the OS
/// cursor and warping it back to centre.
pub trait WindowHooks: Send + Sync {
    fn grab_cursor(&self, grab: bool);
    fn set_cursor_position(&self, x: f64, y: f64);
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MouseEvent {
    Pressed(MouseButtonId),
    Released(MouseButtonId),
    Moved { position: (f64, f64) },
}

/// Number of concurrent touch slots the protocol supports.
const TOUCH_SLOTS: usize = 10;

pub struct InputConverter {
    out: Arc<dyn ControlOutput>,
    seqs: Arc<TouchSequence>,
    window: Arc<dyn WindowHooks>,
    metrics: Arc<Metrics>,

    keymap: KeyMap,
    scripts: Option<ScriptHost>,

    cursor_captured: bool,
    /// Device video resolution; protocol positions scale against this.
    frame_size: (u32, u32),
    /// Window client size in pixels.
    show_size: (u32, u32),
    cursor_pos: (f64, f64),

    steer: SteerWheel,
    viewport: Viewport,
    key_states: HashMap<KeyCode, bool>,
    /// Fixed table mapping an owner key to a protocol touch slot.
    touch_slots: [Option<KeyCode>; TOUCH_SLOTS],
    primary_touch_down: bool,
}

impl InputConverter {
    pub fn new(
        out: Arc<dyn ControlOutput>,
        seqs: Arc<TouchSequence>,
        window: Arc<dyn WindowHooks>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            out,
            seqs,
            window,
            metrics,
            keymap: KeyMap::default(),
            scripts: None,
            cursor_captured: false,
            frame_size: (0, 0),
            show_size: (0, 0),
            cursor_pos: (0.0, 0.0),
            steer: SteerWheel::default(),
            viewport: Viewport::new((0.5, 0.5), (1.0, 1.0)),
            key_states: HashMap::new(),
            touch_slots: [None; TOUCH_SLOTS],
            primary_touch_down: false,
        }
    }

    pub fn set_script_host(&mut self, host: ScriptHost) {
        self.scripts = Some(host);
    }

    pub fn script_host(&self) -> Option<&ScriptHost> {
        self.scripts.as_ref()
    }

    pub fn load_keymap(&mut self, keymap: KeyMap) {
        if let Some(mouse_move) = keymap.mouse_move {
            self.viewport = Viewport::new(mouse_move.start_pos, mouse_move.speed_ratio);
        }
        if let Some(scripts) = &self.scripts {
            for (key, pos) in keymap.key_positions() {
                scripts.shared().set_key_position(format!("{key:?}"), pos);
            }
        }
        self.keymap = keymap;
    }

    pub fn is_cursor_captured(&self) -> bool {
        self.cursor_captured
    }

    pub fn update_sizes(&mut self, frame_size: (u32, u32), show_size: (u32, u32)) {
        self.frame_size = frame_size;
        self.show_size = show_size;
        if let Some(scripts) = &self.scripts {
            scripts.shared().set_video_size(frame_size.0, frame_size.1);
        }
    }

    pub fn mouse_event(&mut self, event: MouseEvent) {
        let started = Instant::now();

        if let MouseEvent::Moved { position } = event {
            self.cursor_pos = position;
        }

        // The capture toggle wins over everything, even bound buttons.
        if let BindingTarget::Mouse(switch) = self.keymap.switch_key {
            if event == MouseEvent::Pressed(switch) {
                self.toggle_cursor_capture();
                return;
            }
            if event == MouseEvent::Released(switch) {
                return;
            }
        }

        if !self.cursor_captured {
            self.cursor_visible_mouse(event);
        } else {
            self.captured_mouse(event);
        }

        self.metrics
            .report_input_latency(started.elapsed().as_secs_f64() * 1000.0);
        self.metrics.report_input_processed();
    }

    pub fn key_event(&mut self, key: KeyCode, pressed: bool, repeat: bool) {
        let started = Instant::now();

        if pressed || !repeat {
            self.key_states.insert(key, pressed);
            if let Some(scripts) = &self.scripts {
                scripts.shared().set_key_state(format!("{key:?}"), pressed);
            }
        }

        if self.keymap.switch_key == BindingTarget::Key(key) {
            if pressed && !repeat {
                self.toggle_cursor_capture();
            }
            return;
        }
        if repeat {
            return;
        }

        match self.keymap.node_for_key(key).cloned() {
            Some(KeyMapNode::SteerWheel) => {
                if let Some(desc) = self.keymap.steer_wheel().cloned() {
                    self.steer
                        .handle_key(&desc, key, pressed, Instant::now(), &self.seqs, &*self.out);
                }
            }
            Some(KeyMapNode::AndroidKey { keycode }) => {
                self.send_keycode(pressed, keycode);
            }
            Some(KeyMapNode::Script { anchor, source }) => {
                if let Some(scripts) = &self.scripts {
                    scripts.invoke(&source, anchor, pressed, key_slot_id(key));
                }
            }
            None => {
                // Unbound keys fall through to plain Android input so text
                // entry keeps working in menus.
                if let Some(keycode) = android_keycode(key) {
                    self.send_keycode(pressed, keycode as u16);
                }
            }
        }

        self.metrics
            .report_input_latency(started.elapsed().as_secs_f64() * 1000.0);
        self.metrics.report_input_processed();
    }

    /// Timer tick from the event loop: steer path steps, viewport
    /// deadlines and queued script commands.
    pub fn poll(&mut self, now: Instant) {
        self.steer.poll(now, &*self.out);
        if self.cursor_captured {
            self.viewport.poll(now, &self.seqs, &*self.out);
            if let Some(scripts) = &self.scripts {
                let pos = self.viewport.position();
                scripts.shared().set_mouse_pos(pos.0, pos.1);
            }
        }
        self.drain_script_commands();
    }

    fn drain_script_commands(&mut self) {
        let Some(scripts) = &self.scripts else {
            return;
        };
        for command in scripts.shared().drain_commands() {
            match command {
                ConverterCommand::ResetView => {
                    self.viewport.stop_touch(&*self.out);
                    self.viewport.enter();
                }
                ConverterCommand::DirectionReset => {
                    self.steer.reset(&*self.out);
                }
                ConverterCommand::SetRadialParam {
                    up,
                    down,
                    left,
                    right,
                } => {
                    self.keymap.set_steer_extends(up, down, left, right);
                }
                ConverterCommand::SetCursorCapture(capture) => {
                    if capture != self.cursor_captured {
                        self.toggle_cursor_capture();
                    }
                }
            }
        }
    }

    fn cursor_visible_mouse(&mut self, event: MouseEvent) {
        // Only the primary button touches the screen; the rest are eaten so
        // they cannot collide with gesture bindings.
        let (action, pressed) = match event {
            MouseEvent::Pressed(MouseButtonId::Left) => (ACTION_DOWN, true),
            MouseEvent::Released(MouseButtonId::Left) => (ACTION_UP, false),
            MouseEvent::Moved { .. } if self.primary_touch_down => (ACTION_MOVE, true),
            _ => return,
        };
        self.primary_touch_down = pressed;

        if self.show_size.0 == 0 || self.show_size.1 == 0 || self.frame_size.0 == 0 {
            return;
        }
        let x = self.cursor_pos.0 / self.show_size.0 as f64 * self.frame_size.0 as f64;
        let y = self.cursor_pos.1 / self.show_size.1 as f64 * self.frame_size.1 as f64;

        self.out.control_msg(&ControlMsg::InjectTouch {
            pointer_id: POINTER_ID_GENERIC_FINGER,
            action,
            action_buttons: 1,
            buttons: 1,
            position: PositionRect {
                x: x as i32,
                y: y as i32,
                width: self.frame_size.0 as u16,
                height: self.frame_size.1 as u16,
            },
            pressure: if action == ACTION_DOWN { 1.0 } else { 0.0 },
        });
    }

    fn captured_mouse(&mut self, event: MouseEvent) {
        match event {
            MouseEvent::Pressed(button) | MouseEvent::Released(button) => {
                let pressed = matches!(event, MouseEvent::Pressed(_));
                if let Some(KeyMapNode::Script { anchor, source }) =
                    self.keymap.node_for_mouse(button).cloned()
                {
                    if let Some(scripts) = &self.scripts {
                        scripts.invoke(&source, anchor, pressed, mouse_slot_id(button));
                    }
                }
            }
            MouseEvent::Moved { position } => {
                if !self.keymap.has_mouse_move() {
                    return;
                }
                let center = (
                    self.show_size.0 as f64 / 2.0,
                    self.show_size.1 as f64 / 2.0,
                );
                let warp = self.viewport.handle_mouse_move(
                    position,
                    center,
                    self.frame_size,
                    Instant::now(),
                    &self.seqs,
                    &*self.out,
                );
                if let Some(warp) = warp {
                    self.window.set_cursor_position(warp.x, warp.y);
                }
            }
        }
    }

    fn toggle_cursor_capture(&mut self) {
        self.cursor_captured = !self.cursor_captured;
        if self.cursor_captured {
            if self.keymap.has_mouse_move() {
                self.window.grab_cursor(true);
                self.viewport.enter();
            }
        } else {
            self.window.grab_cursor(false);
            self.viewport.stop_touch(&*self.out);
            self.steer.reset(&*self.out);
        }
        log::info!(
            "input: cursor {}",
            if self.cursor_captured {
                "captured (viewport mode)"
            } else {
                "visible"
            }
        );
    }

    fn send_keycode(&self, pressed: bool, keycode: u16) {
        self.out.control_msg(&ControlMsg::InjectKeycode {
            action: if pressed { ACTION_DOWN } else { ACTION_UP },
            keycode: keycode as u32,
            repeat: 0,
            metastate: 0,
        });
    }

    /// Claim a protocol touch slot for a key. Fails without side effects
    /// when all ten are taken.
    pub fn attach_touch_slot(&mut self, key: KeyCode) -> Option<u8> {
        if self.touch_slots.iter().any(|slot| *slot == Some(key)) {
            return None;
        }
        for (index, slot) in self.touch_slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(key);
                return Some(index as u8);
            }
        }
        None
    }

    pub fn detach_touch_slot(&mut self, key: KeyCode) {
        for slot in self.touch_slots.iter_mut() {
            if *slot == Some(key) {
                *slot = None;
                return;
            }
        }
    }

    pub fn touch_slot_of(&self, key: KeyCode) -> Option<u8> {
        self.touch_slots
            .iter()
            .position(|slot| *slot == Some(key))
            .map(|index| index as u8)
    }
}

/// Stable script key-ids: keyboard keys hash to a wide positive space,
/// mouse buttons take a small negative range of their own.
fn key_slot_id(key: KeyCode) -> i64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() >> 1) as i64
}

fn mouse_slot_id(button: MouseButtonId) -> i64 {
    -(1 + button as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub(crate) struct Recorder {
        pub touches: Mutex<Vec<(u32, u8, f64, f64)>>,
        pub keys: Mutex<Vec<(bool, u16)>>,
        pub msgs: Mutex<Vec<ControlMsg>>,
    }

    impl ControlOutput for Recorder {
        fn fast_touch(&self, seq: u32, action: u8, x: f64, y: f64) {
            self.touches.lock().push((seq, action, x, y));
        }

        fn fast_key(&self, down: bool, keycode: u16) {
            self.keys.lock().push((down, keycode));
        }

        fn control_msg(&self, msg: &ControlMsg) {
            self.msgs.lock().push(msg.clone());
        }
    }

    #[derive(Default)]
    pub(crate) struct NullWindow {
        pub grabs: Mutex<Vec<bool>>,
        pub warps: Mutex<Vec<(f64, f64)>>,
    }

    impl WindowHooks for NullWindow {
        fn grab_cursor(&self, grab: bool) {
            self.grabs.lock().push(grab);
        }

        fn set_cursor_position(&self, x: f64, y: f64) {
            self.warps.lock().push((x, y));
        }
    }

    fn converter() -> (InputConverter, Arc<Recorder>, Arc<NullWindow>) {
        let recorder = Arc::new(Recorder::default());
        let window = Arc::new(NullWindow::default());
        let converter = InputConverter::new(
            recorder.clone(),
            Arc::new(TouchSequence::new()),
            window.clone(),
            Arc::new(Metrics::new()),
        );
        (converter, recorder, window)
    }

    #[test]
    fn cursor_visible_click_scales_to_device() {
        let (mut converter, recorder, _) = converter();
        converter.update_sizes((1920, 1080), (800, 600));

        converter.mouse_event(MouseEvent::Moved {
            position: (120.0, 80.0),
        });
        converter.mouse_event(MouseEvent::Pressed(MouseButtonId::Left));
        converter.mouse_event(MouseEvent::Released(MouseButtonId::Left));

        let msgs = recorder.msgs.lock();
        assert_eq!(msgs.len(), 2);
        match &msgs[0] {
            ControlMsg::InjectTouch {
                pointer_id,
                action,
                position,
                pressure,
                ..
            } => {
                assert_eq!(*pointer_id, POINTER_ID_GENERIC_FINGER);
                assert_eq!(*action, ACTION_DOWN);
                assert_eq!((position.x, position.y), (288, 144));
                assert_eq!((position.width, position.height), (1920, 1080));
                assert_eq!(*pressure, 1.0);
            }
            other => panic!("expected touch, got {other:?}"),
        }
        match &msgs[1] {
            ControlMsg::InjectTouch {
                action, pressure, ..
            } => {
                assert_eq!(*action, ACTION_UP);
                assert_eq!(*pressure, 0.0);
            }
            other => panic!("expected touch, got {other:?}"),
        }
    }

    #[test]
    fn secondary_buttons_are_eaten_when_cursor_visible() {
        let (mut converter, recorder, _) = converter();
        converter.update_sizes((1920, 1080), (800, 600));
        converter.mouse_event(MouseEvent::Pressed(MouseButtonId::Right));
        converter.mouse_event(MouseEvent::Released(MouseButtonId::Right));
        assert!(recorder.msgs.lock().is_empty());
        assert!(recorder.touches.lock().is_empty());
    }

    #[test]
    fn unbound_key_falls_back_to_android_keycode() {
        let (mut converter, recorder, _) = converter();
        converter.key_event(KeyCode::KeyH, true, false);
        converter.key_event(KeyCode::KeyH, false, false);
        let msgs = recorder.msgs.lock();
        assert_eq!(msgs.len(), 2);
        assert!(matches!(
            msgs[0],
            ControlMsg::InjectKeycode {
                action: ACTION_DOWN,
                keycode: 36,
                ..
            }
        ));
    }

    #[test]
    fn switch_key_toggles_capture_and_resets_state() {
        let (mut converter, _, window) = converter();
        let keymap = crate::keymap::KeyMap::parse(
            r#"{
                "switchKey": "Backquote",
                "mouseMove": { "startPos": [0.5, 0.5], "speedRatio": [2.0, 2.0] },
                "nodes": []
            }"#,
        )
        .unwrap();
        converter.load_keymap(keymap);

        converter.key_event(KeyCode::Backquote, true, false);
        assert!(converter.is_cursor_captured());
        assert_eq!(window.grabs.lock().as_slice(), &[true]);

        converter.key_event(KeyCode::Backquote, true, false);
        assert!(!converter.is_cursor_captured());
        assert_eq!(window.grabs.lock().as_slice(), &[true, false]);
    }

    #[test]
    fn keyboard_keeps_working_while_cursor_visible() {
        let (mut converter, recorder, _) = converter();
        let keymap = crate::keymap::KeyMap::parse(
            r#"{
                "switchKey": "Backquote",
                "nodes": [
                    { "type": "steerWheel", "center": [0.15, 0.8],
                      "up":    { "key": "KeyW", "offset": 0.27 },
                      "right": { "key": "KeyD", "offset": 0.1 },
                      "down":  { "key": "KeyS", "offset": 0.2 },
                      "left":  { "key": "KeyA", "offset": 0.1 } }
                ]
            }"#,
        )
        .unwrap();
        converter.load_keymap(keymap);

        // Cursor visible (default): steer keys still drive the wheel.
        converter.key_event(KeyCode::KeyA, true, false);
        let touches = recorder.touches.lock();
        assert_eq!(touches[0].1, ACTION_DOWN);
        assert_eq!((touches[0].2, touches[0].3), (0.15, 0.8));
    }

    #[test]
    fn touch_slots_are_exclusive_and_bounded() {
        let (mut converter, _, _) = converter();
        let keys = [
            KeyCode::KeyA,
            KeyCode::KeyB,
            KeyCode::KeyC,
            KeyCode::KeyD,
            KeyCode::KeyE,
            KeyCode::KeyF,
            KeyCode::KeyG,
            KeyCode::KeyH,
            KeyCode::KeyI,
            KeyCode::KeyJ,
        ];
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(converter.attach_touch_slot(*key), Some(i as u8));
        }
        // Table full: no side effects.
        assert_eq!(converter.attach_touch_slot(KeyCode::KeyK), None);
        // Double attach of a held key fails.
        assert_eq!(converter.attach_touch_slot(KeyCode::KeyA), None);

        converter.detach_touch_slot(KeyCode::KeyC);
        assert_eq!(converter.touch_slot_of(KeyCode::KeyC), None);
        assert_eq!(converter.attach_touch_slot(KeyCode::KeyK), Some(2));
    }

    #[test]
    fn viewport_mode_warps_cursor_back() {
        let (mut converter, recorder, window) = converter();
        converter.update_sizes((1920, 1080), (800, 600));
        let keymap = crate::keymap::KeyMap::parse(
            r#"{
                "switchKey": "Backquote",
                "mouseMove": { "startPos": [0.5, 0.5], "speedRatio": [2.0, 2.0] },
                "nodes": []
            }"#,
        )
        .unwrap();
        converter.load_keymap(keymap);
        converter.key_event(KeyCode::Backquote, true, false);

        // First move after entering is the echo; second is real.
        converter.mouse_event(MouseEvent::Moved {
            position: (420.0, 300.0),
        });
        converter.mouse_event(MouseEvent::Moved {
            position: (420.0, 300.0),
        });

        assert_eq!(window.warps.lock().as_slice(), &[(400.0, 300.0)]);
        // The DOWN at the anchor has been sent.
        assert_eq!(recorder.touches.lock()[0].1, ACTION_DOWN);
    }
}
