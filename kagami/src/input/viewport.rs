//! Viewport ("first-person camera") state machine.
//!
//! While the cursor is grabbed, mouse *motion* drives a synthetic touch:
//! deltas accumulate and an 8 ms tick emits one MOVE at the accumulated
//! position. The OS cursor is pinned back to the window centre after every
//! move, and the one echo event that recentring produces is filtered out.
//! Drifting into the 5 % screen margin (or going idle for 100 ms) runs the
//! recentre protocol: MOVE to the clamped edge, UP, a 15 ms pause, DOWN at
//! the anchor under a fresh sequence id, MOVE by whatever delta was left.

use std::time::{Duration, Instant};

use kagami_transport::control::{ACTION_DOWN, ACTION_MOVE, ACTION_UP};
use kagami_transport::TouchSequence;

use crate::control::ControlOutput;

const EDGE_MARGIN: f64 = 0.05;
const MOVE_TICK: Duration = Duration::from_millis(8);
const REPRESS_DELAY: Duration = Duration::from_millis(15);
const IDLE_RECENTER: Duration = Duration::from_millis(100);

/// Ask the windowing layer to warp the OS cursor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CursorWarp {
    pub x: f64,
    pub y: f64,
}

pub struct Viewport {
    anchor: (f64, f64),
    speed_ratio: (f64, f64),

    touching: bool,
    seq: u32,
    position: (f64, f64),
    pending_delta: (f64, f64),
    ignore_echoes: u32,

    waiting_repress: bool,
    pending_center: (f64, f64),
    pending_overshoot: (f64, f64),
    repress_at: Option<Instant>,

    idle_at: Option<Instant>,
    next_tick: Option<Instant>,
}

impl Viewport {
    pub fn new(anchor: (f64, f64), speed_ratio: (f64, f64)) -> Self {
        Self {
            anchor,
            speed_ratio,
            touching: false,
            seq: 0,
            position: anchor,
            pending_delta: (0.0, 0.0),
            ignore_echoes: 0,
            waiting_repress: false,
            pending_center: anchor,
            pending_overshoot: (0.0, 0.0),
            repress_at: None,
            idle_at: None,
            next_tick: None,
        }
    }

    pub fn is_touching(&self) -> bool {
        self.touching
    }

    pub fn position(&self) -> (f64, f64) {
        self.position
    }

    /// Entering grab mode: the next synthetic mouse move is the warp echo.
    pub fn enter(&mut self) {
        self.ignore_echoes = 1;
    }

    /// Leaving grab mode or resetting from a script: lift the finger and
    /// drop all pending state.
    pub fn stop_touch(&mut self, out: &dyn ControlOutput) {
        self.repress_at = None;
        self.waiting_repress = false;
        self.pending_overshoot = (0.0, 0.0);
        self.pending_delta = (0.0, 0.0);
        self.idle_at = None;
        self.next_tick = None;
        if self.touching {
            out.fast_touch(self.seq, ACTION_UP, self.position.0, self.position.1);
            self.touching = false;
            self.seq = 0;
        }
    }

    /// One window mouse-move while grabbed. `cursor` and `window_center`
    /// are window pixels; `target_size` is the device resolution the
    /// deltas are normalised against. Returns the cursor warp that pins
    /// the pointer back to centre.
    pub fn handle_mouse_move(
        &mut self,
        cursor: (f64, f64),
        window_center: (f64, f64),
        target_size: (u32, u32),
        now: Instant,
        seqs: &TouchSequence,
        out: &dyn ControlOutput,
    ) -> Option<CursorWarp> {
        if self.ignore_echoes > 0 {
            self.ignore_echoes -= 1;
            return None;
        }

        let delta = (cursor.0 - window_center.0, cursor.1 - window_center.1);
        if delta.0.abs() + delta.1.abs() < 1.0 {
            return None;
        }

        // The warp below makes the OS report one synthetic move back to
        // centre; that one is not the user's.
        self.ignore_echoes = 1;

        if !self.touching && !self.waiting_repress {
            self.start_touch(now, seqs, out);
        }

        if target_size.0 > 0
            && target_size.1 > 0
            && self.speed_ratio.0 > 0.0
            && self.speed_ratio.1 > 0.0
        {
            self.pending_delta.0 += delta.0 / self.speed_ratio.0 / target_size.0 as f64;
            self.pending_delta.1 += delta.1 / self.speed_ratio.1 / target_size.1 as f64;
        }
        if self.next_tick.is_none() {
            self.next_tick = Some(now + MOVE_TICK);
        }

        Some(CursorWarp {
            x: window_center.0,
            y: window_center.1,
        })
    }

    /// Drive the 8 ms move tick, the 15 ms repress delay and the 100 ms
    /// idle recentre.
    pub fn poll(&mut self, now: Instant, seqs: &TouchSequence, out: &dyn ControlOutput) {
        if let Some(at) = self.repress_at {
            if now >= at {
                self.finish_recenter(now, seqs, out);
            }
        }

        if let Some(tick) = self.next_tick {
            if now >= tick {
                self.next_tick = Some(now + MOVE_TICK);
                self.flush_pending(now, out);
            }
        }

        if let Some(idle) = self.idle_at {
            if now >= idle && self.touching && !self.waiting_repress {
                // Finger has hovered long enough: lift and re-arm at the
                // anchor so the next motion has full travel again.
                out.fast_touch(self.seq, ACTION_UP, self.position.0, self.position.1);
                self.touching = false;
                self.begin_repress(self.anchor, (0.0, 0.0), now);
            }
        }
    }

    fn start_touch(&mut self, now: Instant, seqs: &TouchSequence, out: &dyn ControlOutput) {
        self.seq = seqs.next();
        out.fast_touch(self.seq, ACTION_DOWN, self.anchor.0, self.anchor.1);
        self.position = self.anchor;
        self.touching = true;
        self.idle_at = Some(now + IDLE_RECENTER);
    }

    fn flush_pending(&mut self, now: Instant, out: &dyn ControlOutput) {
        if self.waiting_repress {
            // Motion during the pause joins the overshoot.
            self.pending_overshoot.0 += self.pending_delta.0;
            self.pending_overshoot.1 += self.pending_delta.1;
            self.pending_delta = (0.0, 0.0);
            return;
        }
        if self.pending_delta == (0.0, 0.0) {
            return;
        }

        self.idle_at = Some(now + IDLE_RECENTER);
        let next = (
            self.position.0 + self.pending_delta.0,
            self.position.1 + self.pending_delta.1,
        );
        self.pending_delta = (0.0, 0.0);

        if out_of_bounds(next) && self.touching {
            self.idle_at = None;
            let edge = clamp_to_margin(next);
            out.fast_touch(self.seq, ACTION_MOVE, edge.0, edge.1);
            out.fast_touch(self.seq, ACTION_UP, edge.0, edge.1);
            self.touching = false;
            self.begin_repress(
                self.anchor,
                (next.0 - edge.0, next.1 - edge.1),
                now,
            );
            return;
        }

        self.position = next;
        if self.touching {
            out.fast_touch(self.seq, ACTION_MOVE, next.0, next.1);
        }
    }

    fn begin_repress(&mut self, center: (f64, f64), overshoot: (f64, f64), now: Instant) {
        self.waiting_repress = true;
        self.pending_center = center;
        self.pending_overshoot = overshoot;
        self.repress_at = Some(now + REPRESS_DELAY);
    }

    fn finish_recenter(&mut self, now: Instant, seqs: &TouchSequence, out: &dyn ControlOutput) {
        if !self.waiting_repress {
            self.repress_at = None;
            return;
        }
        self.seq = seqs.next();
        out.fast_touch(self.seq, ACTION_DOWN, self.pending_center.0, self.pending_center.1);
        self.touching = true;

        let mut next = (
            self.pending_center.0 + self.pending_overshoot.0,
            self.pending_center.1 + self.pending_overshoot.1,
        );
        if out_of_bounds(next) {
            next = clamp_to_margin(next);
        }
        out.fast_touch(self.seq, ACTION_MOVE, next.0, next.1);
        self.position = next;

        self.waiting_repress = false;
        self.pending_overshoot = (0.0, 0.0);
        self.repress_at = None;
        self.idle_at = Some(now + IDLE_RECENTER);
    }
}

fn out_of_bounds(pos: (f64, f64)) -> bool {
    pos.0 < EDGE_MARGIN
        || pos.0 > 1.0 - EDGE_MARGIN
        || pos.1 < EDGE_MARGIN
        || pos.1 > 1.0 - EDGE_MARGIN
}

fn clamp_to_margin(pos: (f64, f64)) -> (f64, f64) {
    (
        pos.0.clamp(EDGE_MARGIN, 1.0 - EDGE_MARGIN),
        pos.1.clamp(EDGE_MARGIN, 1.0 - EDGE_MARGIN),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(u32, u8, f64, f64)>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<(u32, u8, f64, f64)> {
            std::mem::take(&mut self.events.lock())
        }
    }

    impl ControlOutput for Recorder {
        fn fast_touch(&self, seq: u32, action: u8, x: f64, y: f64) {
            self.events.lock().push((seq, action, x, y));
        }

        fn fast_key(&self, _down: bool, _keycode: u16) {}

        fn control_msg(&self, _msg: &kagami_transport::ControlMsg) {}
    }

    const CENTER: (f64, f64) = (400.0, 300.0);
    const TARGET: (u32, u32) = (1920, 1080);

    fn mv(
        viewport: &mut Viewport,
        dx: f64,
        dy: f64,
        now: Instant,
        seqs: &TouchSequence,
        out: &Recorder,
    ) -> Option<CursorWarp> {
        viewport.handle_mouse_move(
            (CENTER.0 + dx, CENTER.1 + dy),
            CENTER,
            TARGET,
            now,
            seqs,
            out,
        )
    }

    /// The OS answers every warp with one synthetic move back to centre.
    fn echo(viewport: &mut Viewport, now: Instant, seqs: &TouchSequence, out: &Recorder) {
        let consumed = viewport.handle_mouse_move(CENTER, CENTER, TARGET, now, seqs, out);
        assert!(consumed.is_none());
    }

    #[test]
    fn accumulated_deltas_emit_one_move_per_tick() {
        let mut viewport = Viewport::new((0.5, 0.5), (2.0, 2.0));
        let seqs = TouchSequence::new();
        let out = Recorder::default();
        let start = Instant::now();

        // Three motion events inside one 8 ms window, Δx summing to +20,
        // each followed by the warp echo the recentring produces.
        assert!(mv(&mut viewport, 8.0, 0.0, start, &seqs, &out).is_some());
        echo(&mut viewport, start, &seqs, &out);
        mv(&mut viewport, 7.0, 0.0, start, &seqs, &out);
        echo(&mut viewport, start, &seqs, &out);
        mv(&mut viewport, 5.0, 0.0, start, &seqs, &out);
        echo(&mut viewport, start, &seqs, &out);

        viewport.poll(start + Duration::from_millis(9), &seqs, &out);

        let events = out.take();
        // DOWN at the anchor, then exactly one MOVE.
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].1, ACTION_DOWN);
        assert_eq!((events[0].2, events[0].3), (0.5, 0.5));
        let (_, action, x, y) = events[1];
        assert_eq!(action, ACTION_MOVE);
        assert!((x - (0.5 + 20.0 / 2.0 / 1920.0)).abs() < 1e-9);
        assert!((y - 0.5).abs() < 1e-12);
    }

    #[test]
    fn warp_echo_is_filtered() {
        let mut viewport = Viewport::new((0.5, 0.5), (2.0, 2.0));
        let seqs = TouchSequence::new();
        let out = Recorder::default();
        let now = Instant::now();

        viewport.enter();
        // First event after entering is the warp echo: swallowed.
        assert!(mv(&mut viewport, 10.0, 0.0, now, &seqs, &out).is_none());
        assert!(out.take().is_empty());
        // The next one is real.
        assert!(mv(&mut viewport, 10.0, 0.0, now, &seqs, &out).is_some());
    }

    #[test]
    fn edge_crossing_runs_recenter_protocol() {
        let mut viewport = Viewport::new((0.5, 0.5), (1.0, 1.0));
        let seqs = TouchSequence::new();
        let out = Recorder::default();
        let mut now = Instant::now();

        // Walk x to the margin in big steps: 0.5 → past 0.95.
        // Each pixel delta of 192 advances x by 0.1 at speed 1, target 1920.
        for _ in 0..5 {
            mv(&mut viewport, 192.0, 0.0, now, &seqs, &out);
            echo(&mut viewport, now, &seqs, &out);
            now += Duration::from_millis(9);
            viewport.poll(now, &seqs, &out);
        }
        let events = out.take();
        let down_seq = events[0].0;
        assert_eq!(events[0].1, ACTION_DOWN);

        // Find the edge sequence: MOVE to 0.95, UP at 0.95.
        let edge_move = events
            .iter()
            .position(|(_, a, x, _)| *a == ACTION_MOVE && (*x - 0.95).abs() < 1e-9)
            .expect("clamped edge move");
        assert_eq!(events[edge_move + 1].1, ACTION_UP);
        assert!((events[edge_move + 1].2 - 0.95).abs() < 1e-9);
        assert_eq!(events.len(), edge_move + 2, "no events before the repress");

        // After the 15 ms pause: DOWN at the anchor with a fresh id, then a
        // MOVE by the leftover overshoot.
        now += REPRESS_DELAY;
        viewport.poll(now, &seqs, &out);
        let events = out.take();
        assert_eq!(events[0].1, ACTION_DOWN);
        assert_eq!((events[0].2, events[0].3), (0.5, 0.5));
        assert_ne!(events[0].0, down_seq);
        assert_eq!(events[1].1, ACTION_MOVE);
        // The finger was headed for x=1.0 and stopped at the 0.95 edge.
        let overshoot = 1.0 - 0.95;
        assert!((events[1].2 - (0.5 + overshoot)).abs() < 1e-9);
    }

    #[test]
    fn idle_triggers_recenter() {
        let mut viewport = Viewport::new((0.5, 0.5), (2.0, 2.0));
        let seqs = TouchSequence::new();
        let out = Recorder::default();
        let mut now = Instant::now();

        mv(&mut viewport, 20.0, 0.0, now, &seqs, &out);
        now += Duration::from_millis(9);
        viewport.poll(now, &seqs, &out);
        let first = out.take();
        let first_seq = first[0].0;

        // No motion for over 100 ms: UP, pause, DOWN at the anchor.
        now += IDLE_RECENTER + Duration::from_millis(1);
        viewport.poll(now, &seqs, &out);
        let events = out.take();
        assert_eq!(events.last().unwrap().1, ACTION_UP);

        now += REPRESS_DELAY;
        viewport.poll(now, &seqs, &out);
        let events = out.take();
        assert_eq!(events[0].1, ACTION_DOWN);
        assert_eq!((events[0].2, events[0].3), (0.5, 0.5));
        assert_ne!(events[0].0, first_seq);
        assert!(viewport.is_touching());
    }

    #[test]
    fn stop_touch_lifts_finger() {
        let mut viewport = Viewport::new((0.5, 0.5), (2.0, 2.0));
        let seqs = TouchSequence::new();
        let out = Recorder::default();
        let now = Instant::now();

        mv(&mut viewport, 20.0, 0.0, now, &seqs, &out);
        viewport.stop_touch(&out);
        let events = out.take();
        assert_eq!(events.last().unwrap().1, ACTION_UP);
        assert!(!viewport.is_touching());
    }
}
