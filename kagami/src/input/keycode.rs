//! Physical key to Android keycode translation, so unbound keys still type
//! into device menus and text fields.

use winit::keyboard::KeyCode;

// Android KEYCODE_* values the agent understands.
pub const AKEYCODE_HOME: u16 = 3;
pub const AKEYCODE_BACK: u16 = 4;
pub const AKEYCODE_VOLUME_UP: u16 = 24;
pub const AKEYCODE_VOLUME_DOWN: u16 = 25;
pub const AKEYCODE_POWER: u16 = 26;
pub const AKEYCODE_MENU: u16 = 82;
pub const AKEYCODE_APP_SWITCH: u16 = 187;

/// Map a physical key to the Android keycode with the same meaning.
/// Returns `None` for keys Android has no use for.
pub fn android_keycode(key: KeyCode) -> Option<u16> {
    use KeyCode::*;
    let code = match key {
        KeyA => 29,
        KeyB => 30,
        KeyC => 31,
        KeyD => 32,
        KeyE => 33,
        KeyF => 34,
        KeyG => 35,
        KeyH => 36,
        KeyI => 37,
        KeyJ => 38,
        KeyK => 39,
        KeyL => 40,
        KeyM => 41,
        KeyN => 42,
        KeyO => 43,
        KeyP => 44,
        KeyQ => 45,
        KeyR => 46,
        KeyS => 47,
        KeyT => 48,
        KeyU => 49,
        KeyV => 50,
        KeyW => 51,
        KeyX => 52,
        KeyY => 53,
        KeyZ => 54,
        Digit0 => 7,
        Digit1 => 8,
        Digit2 => 9,
        Digit3 => 10,
        Digit4 => 11,
        Digit5 => 12,
        Digit6 => 13,
        Digit7 => 14,
        Digit8 => 15,
        Digit9 => 16,
        ArrowUp => 19,
        ArrowDown => 20,
        ArrowLeft => 21,
        ArrowRight => 22,
        Comma => 55,
        Period => 56,
        AltLeft => 57,
        AltRight => 58,
        ShiftLeft => 59,
        ShiftRight => 60,
        Tab => 61,
        Space => 62,
        Enter | NumpadEnter => 66,
        Backspace => 67,
        Backquote => 68,
        Minus => 69,
        Equal => 70,
        BracketLeft => 71,
        BracketRight => 72,
        Backslash => 73,
        Semicolon => 74,
        Quote => 75,
        Slash => 76,
        PageUp => 92,
        PageDown => 93,
        Escape => 111,
        Delete => 112,
        ControlLeft => 113,
        ControlRight => 114,
        CapsLock => 115,
        Home => 122,
        End => 123,
        Insert => 124,
        F1 => 131,
        F2 => 132,
        F3 => 133,
        F4 => 134,
        F5 => 135,
        F6 => 136,
        F7 => 137,
        F8 => 138,
        F9 => 139,
        F10 => 140,
        F11 => 141,
        F12 => 142,
        _ => return None,
    };
    Some(code)
}

/// Android keycode by the symbolic name scripts use (`key("HOME")`).
pub fn android_keycode_by_name(name: &str) -> Option<u16> {
    let code = match name.to_ascii_uppercase().as_str() {
        "HOME" => AKEYCODE_HOME,
        "BACK" => AKEYCODE_BACK,
        "MENU" => AKEYCODE_MENU,
        "POWER" => AKEYCODE_POWER,
        "APP_SWITCH" => AKEYCODE_APP_SWITCH,
        "VOLUME_UP" => AKEYCODE_VOLUME_UP,
        "VOLUME_DOWN" => AKEYCODE_VOLUME_DOWN,
        "ENTER" => 66,
        "SPACE" => 62,
        "TAB" => 61,
        "ESCAPE" => 111,
        "DEL" | "DELETE" => 67,
        "UP" => 19,
        "DOWN" => 20,
        "LEFT" => 21,
        "RIGHT" => 22,
        other => {
            // Single letters and digits map through the physical table.
            let key = parse_key_name(other)
                .or_else(|| parse_key_name(&format!("Key{other}")))
                .or_else(|| parse_key_name(&format!("Digit{other}")))?;
            return android_keycode(key);
        }
    };
    Some(code)
}

/// Parse the key names used in key-map JSON ("KeyA", "Digit1", "Space",
/// "F3", ...), mirroring the physical-key naming of the windowing layer.
pub fn parse_key_name(name: &str) -> Option<KeyCode> {
    use KeyCode::*;
    let key = match name {
        "KeyA" => KeyA,
        "KeyB" => KeyB,
        "KeyC" => KeyC,
        "KeyD" => KeyD,
        "KeyE" => KeyE,
        "KeyF" => KeyF,
        "KeyG" => KeyG,
        "KeyH" => KeyH,
        "KeyI" => KeyI,
        "KeyJ" => KeyJ,
        "KeyK" => KeyK,
        "KeyL" => KeyL,
        "KeyM" => KeyM,
        "KeyN" => KeyN,
        "KeyO" => KeyO,
        "KeyP" => KeyP,
        "KeyQ" => KeyQ,
        "KeyR" => KeyR,
        "KeyS" => KeyS,
        "KeyT" => KeyT,
        "KeyU" => KeyU,
        "KeyV" => KeyV,
        "KeyW" => KeyW,
        "KeyX" => KeyX,
        "KeyY" => KeyY,
        "KeyZ" => KeyZ,
        "Digit0" => Digit0,
        "Digit1" => Digit1,
        "Digit2" => Digit2,
        "Digit3" => Digit3,
        "Digit4" => Digit4,
        "Digit5" => Digit5,
        "Digit6" => Digit6,
        "Digit7" => Digit7,
        "Digit8" => Digit8,
        "Digit9" => Digit9,
        "Space" => Space,
        "Tab" => Tab,
        "Enter" => Enter,
        "Escape" => Escape,
        "Backspace" => Backspace,
        "Backquote" => Backquote,
        "Minus" => Minus,
        "Equal" => Equal,
        "Comma" => Comma,
        "Period" => Period,
        "Slash" => Slash,
        "Semicolon" => Semicolon,
        "Quote" => Quote,
        "BracketLeft" => BracketLeft,
        "BracketRight" => BracketRight,
        "Backslash" => Backslash,
        "ShiftLeft" => ShiftLeft,
        "ShiftRight" => ShiftRight,
        "ControlLeft" => ControlLeft,
        "ControlRight" => ControlRight,
        "AltLeft" => AltLeft,
        "AltRight" => AltRight,
        "ArrowUp" => ArrowUp,
        "ArrowDown" => ArrowDown,
        "ArrowLeft" => ArrowLeft,
        "ArrowRight" => ArrowRight,
        "Home" => Home,
        "End" => End,
        "PageUp" => PageUp,
        "PageDown" => PageDown,
        "Insert" => Insert,
        "Delete" => Delete,
        "CapsLock" => CapsLock,
        "F1" => F1,
        "F2" => F2,
        "F3" => F3,
        "F4" => F4,
        "F5" => F5,
        "F6" => F6,
        "F7" => F7,
        "F8" => F8,
        "F9" => F9,
        "F10" => F10,
        "F11" => F11,
        "F12" => F12,
        _ => return None,
    };
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_map_contiguously() {
        assert_eq!(android_keycode(KeyCode::KeyA), Some(29));
        assert_eq!(android_keycode(KeyCode::KeyZ), Some(54));
    }

    #[test]
    fn unmapped_keys_return_none() {
        assert_eq!(android_keycode(KeyCode::PrintScreen), None);
    }

    #[test]
    fn script_names_resolve() {
        assert_eq!(android_keycode_by_name("BACK"), Some(AKEYCODE_BACK));
        assert_eq!(android_keycode_by_name("home"), Some(AKEYCODE_HOME));
        assert_eq!(android_keycode_by_name("W"), Some(51));
        assert_eq!(android_keycode_by_name("5"), Some(12));
        assert_eq!(android_keycode_by_name("NOPE"), None);
    }

    #[test]
    fn key_names_round_trip_through_parser() {
        assert_eq!(parse_key_name("KeyW"), Some(KeyCode::KeyW));
        assert_eq!(parse_key_name("Backquote"), Some(KeyCode::Backquote));
        assert_eq!(parse_key_name("Key?"), None);
    }
}
