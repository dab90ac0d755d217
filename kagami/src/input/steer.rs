//! Steer-wheel: four keys acting as one virtual joystick finger.
//!
//! The touch point starts at the configured centre and walks an
//! interpolated path toward centre + the sum of active direction extends.
//! Positions get a small jitter and inter-event delays are randomised in a
//! 2–8 ms band so the synthetic gesture does not look machine-stamped to
//! the app on the device.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;
use winit::keyboard::KeyCode;

use kagami_transport::control::{ACTION_DOWN, ACTION_MOVE, ACTION_UP};
use kagami_transport::TouchSequence;

use crate::control::ControlOutput;
use crate::keymap::SteerWheelDesc;

const DISTANCE_STEP: f64 = 0.01;
const POSITION_JITTER: f64 = 0.002;
const DELAY_MIN_MS: u64 = 2;
const DELAY_MAX_MS: u64 = 8;

#[derive(Default)]
pub struct SteerWheel {
    /// Up, right, down, left.
    pressed: [bool; 4],
    /// Zero while no gesture is live.
    seq: u32,
    current: (f64, f64),
    path: VecDeque<(f64, f64)>,
    delays: VecDeque<Duration>,
    next_emit: Option<Instant>,
    pressed_count: usize,
}

impl SteerWheel {
    pub fn is_active(&self) -> bool {
        self.seq != 0
    }

    /// Feed one bound key transition.
    pub fn handle_key(
        &mut self,
        desc: &SteerWheelDesc,
        key: KeyCode,
        is_press: bool,
        now: Instant,
        seqs: &TouchSequence,
        out: &dyn ControlOutput,
    ) {
        let Some(direction) = desc.keys.iter().position(|k| *k == key) else {
            return;
        };
        self.pressed[direction] = is_press;

        let mut offset = (0.0, 0.0);
        let mut pressed_count = 0;
        // Up, right, down, left in screen coordinates (y grows downward).
        let signs = [(0.0, -1.0), (1.0, 0.0), (0.0, 1.0), (-1.0, 0.0)];
        for i in 0..4 {
            if self.pressed[i] {
                pressed_count += 1;
                offset.0 += signs[i].0 * desc.extends[i];
                offset.1 += signs[i].1 * desc.extends[i];
            }
        }
        self.pressed_count = pressed_count;

        if pressed_count == 0 {
            self.path.clear();
            self.delays.clear();
            self.next_emit = None;
            if self.seq != 0 {
                out.fast_touch(self.seq, ACTION_UP, self.current.0, self.current.1);
                self.seq = 0;
            }
            return;
        }

        self.path.clear();
        self.delays.clear();

        let target = (desc.center.0 + offset.0, desc.center.1 + offset.1);
        if pressed_count == 1 && is_press {
            // Fresh gesture: finger lands on the centre and walks out.
            self.seq = seqs.next();
            self.current = desc.center;
            out.fast_touch(self.seq, ACTION_DOWN, desc.center.0, desc.center.1);
            self.build_path(desc.center, target);
        } else {
            // Direction change mid-gesture: re-aim from where we are.
            self.build_path(self.current, target);
        }
        self.next_emit = Some(now);
    }

    /// Emit due path steps. Driven from the event loop.
    pub fn poll(&mut self, now: Instant, out: &dyn ControlOutput) {
        while let Some(due) = self.next_emit {
            if now < due {
                return;
            }
            let Some(pos) = self.path.pop_front() else {
                self.next_emit = None;
                return;
            };
            self.current = pos;
            out.fast_touch(self.seq, ACTION_MOVE, pos.0, pos.1);

            if self.path.is_empty() {
                self.next_emit = None;
                if self.pressed_count == 0 && self.seq != 0 {
                    out.fast_touch(self.seq, ACTION_UP, pos.0, pos.1);
                    self.seq = 0;
                }
            } else {
                let delay = self
                    .delays
                    .pop_front()
                    .unwrap_or(Duration::from_millis(DELAY_MIN_MS));
                self.next_emit = Some(due + delay);
            }
        }
    }

    /// Lift the finger and forget all key state.
    pub fn reset(&mut self, out: &dyn ControlOutput) {
        self.path.clear();
        self.delays.clear();
        self.next_emit = None;
        if self.seq != 0 {
            out.fast_touch(self.seq, ACTION_UP, self.current.0, self.current.1);
            self.seq = 0;
        }
        self.pressed = [false; 4];
        self.pressed_count = 0;
    }

    fn build_path(&mut self, start: (f64, f64), end: (f64, f64)) {
        let dx = end.0 - start.0;
        let dy = end.1 - start.1;
        let steps = (dx.abs().max(dy.abs()) / DISTANCE_STEP).ceil() as usize;
        if steps == 0 {
            return;
        }
        let mut rng = rand::rng();
        for i in 1..=steps {
            let t = i as f64 / steps as f64;
            let jitter_x = rng.random_range(-POSITION_JITTER..POSITION_JITTER);
            let jitter_y = rng.random_range(-POSITION_JITTER..POSITION_JITTER);
            let mut x = start.0 + dx * t + jitter_x;
            let mut y = start.1 + dy * t + jitter_y;
            // The final step lands exactly on target.
            if i == steps {
                x = end.0;
                y = end.1;
            }
            self.path.push_back((x, y));
            self.delays
                .push_back(Duration::from_millis(rng.random_range(DELAY_MIN_MS..=DELAY_MAX_MS)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(u32, u8, f64, f64)>>,
    }

    impl ControlOutput for Recorder {
        fn fast_touch(&self, seq: u32, action: u8, x: f64, y: f64) {
            self.events.lock().push((seq, action, x, y));
        }

        fn fast_key(&self, _down: bool, _keycode: u16) {}

        fn control_msg(&self, _msg: &kagami_transport::ControlMsg) {}
    }

    fn desc() -> SteerWheelDesc {
        SteerWheelDesc {
            center: (0.15, 0.80),
            keys: [KeyCode::KeyW, KeyCode::KeyD, KeyCode::KeyS, KeyCode::KeyA],
            extends: [0.27, 0.1, 0.2, 0.1],
        }
    }

    fn drain(wheel: &mut SteerWheel, out: &Recorder, mut now: Instant) -> Instant {
        for _ in 0..1000 {
            wheel.poll(now, out);
            now += Duration::from_millis(8);
        }
        now
    }

    #[test]
    fn press_left_walks_from_center_toward_extend() {
        let wheel_desc = desc();
        let mut wheel = SteerWheel::default();
        let out = Recorder::default();
        let seqs = TouchSequence::new();
        let now = Instant::now();

        wheel.handle_key(&wheel_desc, KeyCode::KeyA, true, now, &seqs, &out);
        drain(&mut wheel, &out, now);

        let events = out.events.lock();
        let (seq0, action0, x0, y0) = events[0];
        assert_eq!(action0, ACTION_DOWN);
        assert_eq!((x0, y0), (0.15, 0.80));

        // All moves share the DOWN's sequence id and trend toward x=0.05.
        assert!(events[1..].iter().all(|(s, a, ..)| *s == seq0 && *a == ACTION_MOVE));
        let (_, _, last_x, last_y) = *events.last().unwrap();
        assert!((last_x - 0.05).abs() < 1e-9);
        assert!((last_y - 0.80).abs() < 1e-9);
        assert!(wheel.is_active());
    }

    #[test]
    fn release_emits_up_and_clears_gesture() {
        let wheel_desc = desc();
        let mut wheel = SteerWheel::default();
        let out = Recorder::default();
        let seqs = TouchSequence::new();
        let mut now = Instant::now();

        wheel.handle_key(&wheel_desc, KeyCode::KeyA, true, now, &seqs, &out);
        now = drain(&mut wheel, &out, now);
        wheel.handle_key(&wheel_desc, KeyCode::KeyA, false, now, &seqs, &out);

        let events = out.events.lock();
        let (_, action, ..) = *events.last().unwrap();
        assert_eq!(action, ACTION_UP);
        assert!(!wheel.is_active());
    }

    #[test]
    fn direction_change_reaims_without_new_down() {
        let wheel_desc = desc();
        let mut wheel = SteerWheel::default();
        let out = Recorder::default();
        let seqs = TouchSequence::new();
        let mut now = Instant::now();

        wheel.handle_key(&wheel_desc, KeyCode::KeyA, true, now, &seqs, &out);
        now = drain(&mut wheel, &out, now);
        wheel.handle_key(&wheel_desc, KeyCode::KeyW, true, now, &seqs, &out);
        drain(&mut wheel, &out, now);

        let events = out.events.lock();
        let downs = events.iter().filter(|(_, a, ..)| *a == ACTION_DOWN).count();
        assert_eq!(downs, 1);
        // The combined target is centre + left + up.
        let (_, _, x, y) = *events.last().unwrap();
        assert!((x - 0.05).abs() < 1e-9);
        assert!((y - 0.53).abs() < 1e-9);
    }

    #[test]
    fn unrelated_key_is_ignored() {
        let wheel_desc = desc();
        let mut wheel = SteerWheel::default();
        let out = Recorder::default();
        let seqs = TouchSequence::new();
        wheel.handle_key(&wheel_desc, KeyCode::KeyQ, true, Instant::now(), &seqs, &out);
        assert!(out.events.lock().is_empty());
    }
}
