//! Outbound control protocol.
//!
//! Two message families share the control channel. The compact "fast"
//! messages carry one touch point or key with 16-bit normalised coordinates
//! and a 32-bit gesture sequence id; they are what the input converter emits
//! on its hot path. The richer legacy family mirrors the agent's original
//! dialect (pointer ids, button masks, pixel rectangles) and is used for the
//! cursor-visible click path and session-level commands.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::{Result, TransportError};

pub const FAST_TOUCH_DOWN: u8 = 0x01;
pub const FAST_TOUCH_UP: u8 = 0x02;
pub const FAST_TOUCH_MOVE: u8 = 0x03;
pub const FAST_KEY_DOWN: u8 = 0x10;
pub const FAST_KEY_UP: u8 = 0x11;

/// Pointer id the agent treats as a plain finger, distinct from the slots
/// the multi-touch registry hands out.
pub const POINTER_ID_GENERIC_FINGER: u64 = -2i64 as u64;

/// Monotonic fast-touch sequence id source. One complete DOWN..UP gesture
/// keeps a single id; ids are never reused while a gesture is live because
/// the counter only moves forward.
#[derive(Debug, Default)]
pub struct TouchSequence(AtomicU32);

impl TouchSequence {
    pub fn new() -> Self {
        // Start above zero so 0 can mean "no active gesture" in callers.
        Self(AtomicU32::new(1))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FastMsg {
    TouchDown { seq: u32, x: u16, y: u16 },
    TouchUp { seq: u32, x: u16, y: u16 },
    TouchMove { seq: u32, x: u16, y: u16 },
    KeyDown { keycode: u16 },
    KeyUp { keycode: u16 },
}

impl FastMsg {
    /// Clamp a normalised [0,1] coordinate onto the 16-bit wire range.
    pub fn quantize(v: f64) -> u16 {
        (v.clamp(0.0, 1.0) * 65535.0) as u16
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10);
        match *self {
            FastMsg::TouchDown { seq, x, y } => fast_touch(&mut out, FAST_TOUCH_DOWN, seq, 0, x, y),
            FastMsg::TouchUp { seq, x, y } => fast_touch(&mut out, FAST_TOUCH_UP, seq, 1, x, y),
            FastMsg::TouchMove { seq, x, y } => fast_touch(&mut out, FAST_TOUCH_MOVE, seq, 2, x, y),
            FastMsg::KeyDown { keycode } => fast_key(&mut out, FAST_KEY_DOWN, 0, keycode),
            FastMsg::KeyUp { keycode } => fast_key(&mut out, FAST_KEY_UP, 1, keycode),
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let err = || TransportError::Malformed("fast message");
        let ty = *bytes.first().ok_or_else(err)?;
        match ty {
            FAST_TOUCH_DOWN | FAST_TOUCH_UP | FAST_TOUCH_MOVE => {
                if bytes.len() < 10 {
                    return Err(err());
                }
                let seq = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
                let x = u16::from_be_bytes(bytes[6..8].try_into().unwrap());
                let y = u16::from_be_bytes(bytes[8..10].try_into().unwrap());
                Ok(match ty {
                    FAST_TOUCH_DOWN => FastMsg::TouchDown { seq, x, y },
                    FAST_TOUCH_UP => FastMsg::TouchUp { seq, x, y },
                    _ => FastMsg::TouchMove { seq, x, y },
                })
            }
            FAST_KEY_DOWN | FAST_KEY_UP => {
                if bytes.len() < 4 {
                    return Err(err());
                }
                let keycode = u16::from_be_bytes(bytes[2..4].try_into().unwrap());
                Ok(if ty == FAST_KEY_DOWN {
                    FastMsg::KeyDown { keycode }
                } else {
                    FastMsg::KeyUp { keycode }
                })
            }
            _ => Err(err()),
        }
    }
}

fn fast_touch(out: &mut Vec<u8>, ty: u8, seq: u32, action: u8, x: u16, y: u16) {
    out.push(ty);
    out.extend_from_slice(&seq.to_be_bytes());
    out.push(action);
    out.extend_from_slice(&x.to_be_bytes());
    out.extend_from_slice(&y.to_be_bytes());
}

fn fast_key(out: &mut Vec<u8>, ty: u8, action: u8, keycode: u16) {
    out.push(ty);
    out.push(action);
    out.extend_from_slice(&keycode.to_be_bytes());
}

/// Touch/key action values shared with the agent.
pub const ACTION_DOWN: u8 = 0;
pub const ACTION_UP: u8 = 1;
pub const ACTION_MOVE: u8 = 2;

const MSG_INJECT_KEYCODE: u8 = 0;
const MSG_INJECT_TOUCH: u8 = 2;
const MSG_BACK_OR_SCREEN_ON: u8 = 4;
const MSG_DISCONNECT: u8 = 200;

/// Touch position: a point plus the screen size it was measured against, so
/// the agent can rescale if the device rotated in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PositionRect {
    pub x: i32,
    pub y: i32,
    pub width: u16,
    pub height: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ControlMsg {
    InjectKeycode {
        action: u8,
        keycode: u32,
        repeat: u32,
        metastate: u32,
    },
    InjectTouch {
        pointer_id: u64,
        action: u8,
        action_buttons: u32,
        buttons: u32,
        position: PositionRect,
        pressure: f32,
    },
    BackOrScreenOn {
        down: bool,
    },
    Disconnect,
}

impl ControlMsg {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        match self {
            ControlMsg::InjectKeycode {
                action,
                keycode,
                repeat,
                metastate,
            } => {
                out.push(MSG_INJECT_KEYCODE);
                out.push(*action);
                out.extend_from_slice(&keycode.to_be_bytes());
                out.extend_from_slice(&repeat.to_be_bytes());
                out.extend_from_slice(&metastate.to_be_bytes());
            }
            ControlMsg::InjectTouch {
                pointer_id,
                action,
                action_buttons,
                buttons,
                position,
                pressure,
            } => {
                out.push(MSG_INJECT_TOUCH);
                out.push(*action);
                out.extend_from_slice(&pointer_id.to_be_bytes());
                out.extend_from_slice(&position.x.to_be_bytes());
                out.extend_from_slice(&position.y.to_be_bytes());
                out.extend_from_slice(&position.width.to_be_bytes());
                out.extend_from_slice(&position.height.to_be_bytes());
                out.extend_from_slice(&pressure_to_u16fp(*pressure).to_be_bytes());
                out.extend_from_slice(&action_buttons.to_be_bytes());
                out.extend_from_slice(&buttons.to_be_bytes());
            }
            ControlMsg::BackOrScreenOn { down } => {
                out.push(MSG_BACK_OR_SCREEN_ON);
                out.push(if *down { ACTION_DOWN } else { ACTION_UP });
            }
            ControlMsg::Disconnect => out.push(MSG_DISCONNECT),
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let err = || TransportError::Malformed("control message");
        match *bytes.first().ok_or_else(err)? {
            MSG_INJECT_KEYCODE if bytes.len() >= 14 => Ok(ControlMsg::InjectKeycode {
                action: bytes[1],
                keycode: u32::from_be_bytes(bytes[2..6].try_into().unwrap()),
                repeat: u32::from_be_bytes(bytes[6..10].try_into().unwrap()),
                metastate: u32::from_be_bytes(bytes[10..14].try_into().unwrap()),
            }),
            MSG_INJECT_TOUCH if bytes.len() >= 32 => Ok(ControlMsg::InjectTouch {
                action: bytes[1],
                pointer_id: u64::from_be_bytes(bytes[2..10].try_into().unwrap()),
                position: PositionRect {
                    x: i32::from_be_bytes(bytes[10..14].try_into().unwrap()),
                    y: i32::from_be_bytes(bytes[14..18].try_into().unwrap()),
                    width: u16::from_be_bytes(bytes[18..20].try_into().unwrap()),
                    height: u16::from_be_bytes(bytes[20..22].try_into().unwrap()),
                },
                pressure: u16fp_to_pressure(u16::from_be_bytes(bytes[22..24].try_into().unwrap())),
                action_buttons: u32::from_be_bytes(bytes[24..28].try_into().unwrap()),
                buttons: u32::from_be_bytes(bytes[28..32].try_into().unwrap()),
            }),
            MSG_BACK_OR_SCREEN_ON if bytes.len() >= 2 => Ok(ControlMsg::BackOrScreenOn {
                down: bytes[1] == ACTION_DOWN,
            }),
            MSG_DISCONNECT => Ok(ControlMsg::Disconnect),
            _ => Err(err()),
        }
    }
}

/// Pressure in [0,1] as 16-bit fixed point, saturating at 0xffff.
fn pressure_to_u16fp(f: f32) -> u16 {
    let u = (f.clamp(0.0, 1.0) * 65536.0) as u32;
    u.min(0xffff) as u16
}

fn u16fp_to_pressure(v: u16) -> f32 {
    v as f32 / 65536.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_touch_round_trip() {
        let msg = FastMsg::TouchMove {
            seq: 77,
            x: 0x1234,
            y: 0xfffe,
        };
        let bytes = msg.serialize();
        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes[0], FAST_TOUCH_MOVE);
        assert_eq!(bytes[5], ACTION_MOVE);
        assert_eq!(FastMsg::parse(&bytes).unwrap(), msg);
    }

    #[test]
    fn fast_key_round_trip() {
        let msg = FastMsg::KeyDown { keycode: 29 };
        let bytes = msg.serialize();
        assert_eq!(bytes, vec![FAST_KEY_DOWN, 0, 0, 29]);
        assert_eq!(FastMsg::parse(&bytes).unwrap(), msg);
    }

    #[test]
    fn inject_touch_layout() {
        let msg = ControlMsg::InjectTouch {
            pointer_id: POINTER_ID_GENERIC_FINGER,
            action: ACTION_DOWN,
            action_buttons: 1,
            buttons: 1,
            position: PositionRect {
                x: 288,
                y: 144,
                width: 1920,
                height: 1080,
            },
            pressure: 1.0,
        };
        let bytes = msg.serialize();
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[0], MSG_INJECT_TOUCH);
        // Full pressure saturates the fixed-point field.
        assert_eq!(&bytes[22..24], &[0xff, 0xff]);

        let parsed = ControlMsg::parse(&bytes).unwrap();
        match parsed {
            ControlMsg::InjectTouch {
                pointer_id,
                position,
                pressure,
                ..
            } => {
                assert_eq!(pointer_id, POINTER_ID_GENERIC_FINGER);
                assert_eq!(position.x, 288);
                assert_eq!(position.height, 1080);
                assert!(pressure > 0.99);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn keycode_round_trip() {
        let msg = ControlMsg::InjectKeycode {
            action: ACTION_UP,
            keycode: 4,
            repeat: 0,
            metastate: 0,
        };
        assert_eq!(ControlMsg::parse(&msg.serialize()).unwrap(), msg);
    }

    #[test]
    fn quantize_clamps() {
        assert_eq!(FastMsg::quantize(-0.5), 0);
        assert_eq!(FastMsg::quantize(2.0), 65535);
        assert_eq!(FastMsg::quantize(0.5), 32767);
    }

    #[test]
    fn sequence_ids_are_monotonic() {
        let seq = TouchSequence::new();
        let a = seq.next();
        let b = seq.next();
        assert!(b > a);
    }
}
