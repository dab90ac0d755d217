//! Key-map configuration: JSON bindings from physical keys to Android
//! keys, the steer-wheel virtual joystick, viewport control and scripts.
//! Also loads the per-user `keymap/` directory of virtual buttons and
//! swipe paths.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use winit::keyboard::KeyCode;

use crate::error::SessionError;
use crate::input::keycode::parse_key_name;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MouseButtonId {
    Left,
    Middle,
    Right,
    Back,
    Forward,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BindingTarget {
    Key(KeyCode),
    Mouse(MouseButtonId),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MouseMoveMap {
    /// Anchor of the synthetic look-around touch, normalised [0,1].
    pub start_pos: (f64, f64),
    pub speed_ratio: (f64, f64),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SteerWheelDesc {
    pub center: (f64, f64),
    /// Up, right, down, left.
    pub keys: [KeyCode; 4],
    pub extends: [f64; 4],
}

#[derive(Clone, Debug, PartialEq)]
pub enum KeyMapNode {
    AndroidKey { keycode: u16 },
    SteerWheel,
    Script { anchor: (f64, f64), source: String },
}

#[derive(Clone, Debug)]
pub struct KeyMap {
    pub switch_key: BindingTarget,
    pub mouse_move: Option<MouseMoveMap>,
    steer: Option<SteerWheelDesc>,
    key_nodes: HashMap<KeyCode, KeyMapNode>,
    mouse_nodes: HashMap<MouseButtonId, KeyMapNode>,
}

impl Default for KeyMap {
    fn default() -> Self {
        Self {
            switch_key: BindingTarget::Key(KeyCode::Backquote),
            mouse_move: None,
            steer: None,
            key_nodes: HashMap::new(),
            mouse_nodes: HashMap::new(),
        }
    }
}

impl KeyMap {
    pub fn parse(json: &str) -> Result<Self, SessionError> {
        let raw: RawKeyMap = serde_json::from_str(json)
            .map_err(|err| SessionError::InvalidParameter(format!("key-map JSON: {err}")))?;

        let switch_key = parse_binding(&raw.switch_key)?;
        let mouse_move = raw.mouse_move.map(|m| MouseMoveMap {
            start_pos: (m.start_pos[0], m.start_pos[1]),
            speed_ratio: (m.speed_ratio[0], m.speed_ratio[1]),
        });

        let mut map = Self {
            switch_key,
            mouse_move,
            ..Self::default()
        };

        for node in raw.nodes {
            match node {
                RawNode::AndroidKey { key, android_key } => {
                    map.bind(&key, KeyMapNode::AndroidKey {
                        keycode: android_key,
                    })?;
                }
                RawNode::SteerWheel {
                    center,
                    up,
                    right,
                    down,
                    left,
                } => {
                    if map.steer.is_some() {
                        return Err(SessionError::InvalidParameter(
                            "more than one steer wheel".into(),
                        ));
                    }
                    let desc = SteerWheelDesc {
                        center: (center[0], center[1]),
                        keys: [
                            require_key(&up.key)?,
                            require_key(&right.key)?,
                            require_key(&down.key)?,
                            require_key(&left.key)?,
                        ],
                        extends: [up.offset, right.offset, down.offset, left.offset],
                    };
                    for key in desc.keys {
                        map.bind_key(key, KeyMapNode::SteerWheel)?;
                    }
                    map.steer = Some(desc);
                }
                RawNode::Script { key, anchor, script } => {
                    map.bind(&key, KeyMapNode::Script {
                        anchor: (anchor[0], anchor[1]),
                        source: script,
                    })?;
                }
            }
        }

        for (center, extends) in map.steer.iter().map(|s| (s.center, s.extends)) {
            let in_unit = |v: f64| (0.0..=1.0).contains(&v);
            if !in_unit(center.0) || !in_unit(center.1) || extends.iter().any(|e| !in_unit(*e)) {
                return Err(SessionError::InvalidParameter(
                    "steer wheel coordinates must be normalised to [0,1]".into(),
                ));
            }
        }

        Ok(map)
    }

    fn bind(&mut self, name: &str, node: KeyMapNode) -> Result<(), SessionError> {
        match parse_binding(name)? {
            BindingTarget::Key(key) => self.bind_key(key, node),
            BindingTarget::Mouse(button) => {
                if self.mouse_nodes.insert(button, node).is_some() {
                    return Err(SessionError::InvalidParameter(format!(
                        "duplicate binding for {name}"
                    )));
                }
                Ok(())
            }
        }
    }

    fn bind_key(&mut self, key: KeyCode, node: KeyMapNode) -> Result<(), SessionError> {
        if self.key_nodes.insert(key, node).is_some() {
            return Err(SessionError::InvalidParameter(format!(
                "duplicate binding for {key:?}"
            )));
        }
        Ok(())
    }

    pub fn node_for_key(&self, key: KeyCode) -> Option<&KeyMapNode> {
        self.key_nodes.get(&key)
    }

    pub fn node_for_mouse(&self, button: MouseButtonId) -> Option<&KeyMapNode> {
        self.mouse_nodes.get(&button)
    }

    pub fn steer_wheel(&self) -> Option<&SteerWheelDesc> {
        self.steer.as_ref()
    }

    /// Retune the steer extends at runtime (script `set_radial_param`).
    pub fn set_steer_extends(&mut self, up: f64, down: f64, left: f64, right: f64) {
        if let Some(steer) = &mut self.steer {
            steer.extends = [up, right, down, left];
        }
    }

    pub fn has_mouse_move(&self) -> bool {
        self.mouse_move.is_some()
    }

    /// Anchor position of a bound key, for script `getkeypos`.
    pub fn key_position(&self, key: KeyCode) -> Option<(f64, f64)> {
        match self.key_nodes.get(&key)? {
            KeyMapNode::Script { anchor, .. } => Some(*anchor),
            KeyMapNode::SteerWheel => self.steer.as_ref().map(|s| s.center),
            KeyMapNode::AndroidKey { .. } => None,
        }
    }

    /// Every bound key that has a screen position (steer directions and
    /// script anchors).
    pub fn key_positions(&self) -> Vec<(KeyCode, (f64, f64))> {
        self.key_nodes
            .keys()
            .filter_map(|key| self.key_position(*key).map(|pos| (*key, pos)))
            .collect()
    }
}

fn parse_binding(name: &str) -> Result<BindingTarget, SessionError> {
    let target = match name {
        "MouseLeft" => BindingTarget::Mouse(MouseButtonId::Left),
        "MouseMiddle" => BindingTarget::Mouse(MouseButtonId::Middle),
        "MouseRight" => BindingTarget::Mouse(MouseButtonId::Right),
        "MouseBack" => BindingTarget::Mouse(MouseButtonId::Back),
        "MouseForward" => BindingTarget::Mouse(MouseButtonId::Forward),
        other => BindingTarget::Key(require_key(other)?),
    };
    Ok(target)
}

fn require_key(name: &str) -> Result<KeyCode, SessionError> {
    parse_key_name(name)
        .ok_or_else(|| SessionError::InvalidParameter(format!("unknown key name '{name}'")))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawKeyMap {
    switch_key: String,
    #[serde(default)]
    mouse_move: Option<RawMouseMove>,
    #[serde(default)]
    nodes: Vec<RawNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMouseMove {
    start_pos: [f64; 2],
    speed_ratio: [f64; 2],
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum RawNode {
    #[serde(rename_all = "camelCase")]
    AndroidKey { key: String, android_key: u16 },
    #[serde(rename_all = "camelCase")]
    SteerWheel {
        center: [f64; 2],
        up: RawDirection,
        right: RawDirection,
        down: RawDirection,
        left: RawDirection,
    },
    #[serde(rename_all = "camelCase")]
    Script {
        key: String,
        anchor: [f64; 2],
        script: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDirection {
    key: String,
    offset: f64,
}

/// A user-defined on-screen button stored in `keymap/buttons.json`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualButton {
    pub name: String,
    pub pos: [f64; 2],
}

/// A user-defined swipe path stored in `keymap/swipes.json`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwipePath {
    pub name: String,
    pub points: Vec<[f64; 2]>,
    pub duration_ms: u32,
}

#[derive(Clone, Debug, Default)]
pub struct UserGestures {
    pub buttons: Vec<VirtualButton>,
    pub swipes: Vec<SwipePath>,
}

impl UserGestures {
    /// Load both gesture files from a `keymap/` directory. Missing files
    /// are fine; malformed files are an error so typos do not vanish
    /// silently.
    pub fn load(dir: &Path) -> Result<Self, SessionError> {
        let mut gestures = Self::default();
        let buttons_path = dir.join("buttons.json");
        if buttons_path.exists() {
            let text = std::fs::read_to_string(&buttons_path)
                .map_err(|err| SessionError::InvalidParameter(format!("buttons.json: {err}")))?;
            gestures.buttons = serde_json::from_str(&text)
                .map_err(|err| SessionError::InvalidParameter(format!("buttons.json: {err}")))?;
        }
        let swipes_path = dir.join("swipes.json");
        if swipes_path.exists() {
            let text = std::fs::read_to_string(&swipes_path)
                .map_err(|err| SessionError::InvalidParameter(format!("swipes.json: {err}")))?;
            gestures.swipes = serde_json::from_str(&text)
                .map_err(|err| SessionError::InvalidParameter(format!("swipes.json: {err}")))?;
        }
        Ok(gestures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "switchKey": "Backquote",
        "mouseMove": { "startPos": [0.5, 0.5], "speedRatio": [2.0, 2.0] },
        "nodes": [
            { "type": "androidKey", "key": "KeyM", "androidKey": 82 },
            { "type": "steerWheel", "center": [0.15, 0.8],
              "up":    { "key": "KeyW", "offset": 0.27 },
              "right": { "key": "KeyD", "offset": 0.1 },
              "down":  { "key": "KeyS", "offset": 0.2 },
              "left":  { "key": "KeyA", "offset": 0.1 } },
            { "type": "script", "key": "KeyR", "anchor": [0.8, 0.7],
              "script": "click()" }
        ]
    }"#;

    #[test]
    fn sample_map_parses() {
        let map = KeyMap::parse(SAMPLE).unwrap();
        assert_eq!(map.switch_key, BindingTarget::Key(KeyCode::Backquote));
        assert!(map.has_mouse_move());
        assert_eq!(
            map.node_for_key(KeyCode::KeyM),
            Some(&KeyMapNode::AndroidKey { keycode: 82 })
        );
        assert_eq!(map.node_for_key(KeyCode::KeyA), Some(&KeyMapNode::SteerWheel));
        let steer = map.steer_wheel().unwrap();
        assert_eq!(steer.center, (0.15, 0.8));
        assert_eq!(steer.extends[3], 0.1);
        assert!(matches!(
            map.node_for_key(KeyCode::KeyR),
            Some(KeyMapNode::Script { .. })
        ));
    }

    #[test]
    fn duplicate_bindings_are_rejected() {
        let json = r#"{
            "switchKey": "Backquote",
            "nodes": [
                { "type": "androidKey", "key": "KeyM", "androidKey": 82 },
                { "type": "androidKey", "key": "KeyM", "androidKey": 4 }
            ]
        }"#;
        assert!(KeyMap::parse(json).is_err());
    }

    #[test]
    fn out_of_range_steer_center_is_rejected() {
        let json = r#"{
            "switchKey": "Backquote",
            "nodes": [
                { "type": "steerWheel", "center": [1.5, 0.8],
                  "up":    { "key": "KeyW", "offset": 0.1 },
                  "right": { "key": "KeyD", "offset": 0.1 },
                  "down":  { "key": "KeyS", "offset": 0.1 },
                  "left":  { "key": "KeyA", "offset": 0.1 } }
            ]
        }"#;
        assert!(KeyMap::parse(json).is_err());
    }

    #[test]
    fn mouse_switch_key_parses() {
        let json = r#"{ "switchKey": "MouseRight", "nodes": [] }"#;
        let map = KeyMap::parse(json).unwrap();
        assert_eq!(map.switch_key, BindingTarget::Mouse(MouseButtonId::Right));
    }

    #[test]
    fn set_steer_extends_updates_in_place() {
        let mut map = KeyMap::parse(SAMPLE).unwrap();
        map.set_steer_extends(0.5, 0.4, 0.3, 0.2);
        let steer = map.steer_wheel().unwrap();
        assert_eq!(steer.extends, [0.5, 0.2, 0.4, 0.3]);
    }

    #[test]
    fn user_gestures_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("buttons.json"),
            r#"[ { "name": "fire", "pos": [0.9, 0.8] } ]"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("swipes.json"),
            r#"[ { "name": "dodge", "points": [[0.5,0.5],[0.7,0.5]], "durationMs": 120 } ]"#,
        )
        .unwrap();
        let gestures = UserGestures::load(dir.path()).unwrap();
        assert_eq!(gestures.buttons.len(), 1);
        assert_eq!(gestures.swipes[0].points.len(), 2);
        assert_eq!(gestures.swipes[0].duration_ms, 120);
    }

    #[test]
    fn missing_gesture_files_are_fine() {
        let dir = tempfile::tempdir().unwrap();
        let gestures = UserGestures::load(dir.path()).unwrap();
        assert!(gestures.buttons.is_empty());
        assert!(gestures.swipes.is_empty());
    }
}
