//! Connection lifecycle states and the legal-transition table.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Streaming,
    Paused,
    Disconnecting,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting",
            SessionState::Handshaking => "Handshaking",
            SessionState::Streaming => "Streaming",
            SessionState::Paused => "Paused",
            SessionState::Disconnecting => "Disconnecting",
            SessionState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Whether moving `from -> to` is part of the lifecycle. Anything outside
/// this table is a programming error, not a runtime condition.
pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    match from {
        Disconnected => matches!(to, Connecting),
        Connecting => matches!(to, Handshaking | Error | Disconnecting),
        Handshaking => matches!(to, Streaming | Error | Disconnecting),
        Streaming => matches!(to, Paused | Error | Disconnecting),
        Paused => matches!(to, Streaming | Error | Disconnecting),
        Disconnecting => matches!(to, Disconnected),
        // A failed session may be torn down or restarted in place.
        Error => matches!(to, Disconnected | Connecting),
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;
    use super::*;

    const ALL: [SessionState; 7] = [
        Disconnected,
        Connecting,
        Handshaking,
        Streaming,
        Paused,
        Disconnecting,
        Error,
    ];

    #[test]
    fn happy_path_is_accepted() {
        for (from, to) in [
            (Disconnected, Connecting),
            (Connecting, Handshaking),
            (Handshaking, Streaming),
            (Streaming, Paused),
            (Paused, Streaming),
            (Streaming, Disconnecting),
            (Disconnecting, Disconnected),
        ] {
            assert!(is_valid_transition(from, to), "{from} -> {to}");
        }
    }

    #[test]
    fn failure_paths_are_accepted() {
        for from in [Connecting, Handshaking, Streaming, Paused] {
            assert!(is_valid_transition(from, Error), "{from} -> Error");
            assert!(
                is_valid_transition(from, Disconnecting),
                "{from} -> Disconnecting"
            );
        }
        assert!(is_valid_transition(Error, Disconnected));
        assert!(is_valid_transition(Error, Connecting));
    }

    #[test]
    fn everything_else_is_rejected() {
        let allowed: &[(SessionState, SessionState)] = &[
            (Disconnected, Connecting),
            (Connecting, Handshaking),
            (Connecting, Error),
            (Connecting, Disconnecting),
            (Handshaking, Streaming),
            (Handshaking, Error),
            (Handshaking, Disconnecting),
            (Streaming, Paused),
            (Streaming, Error),
            (Streaming, Disconnecting),
            (Paused, Streaming),
            (Paused, Error),
            (Paused, Disconnecting),
            (Disconnecting, Disconnected),
            (Error, Disconnected),
            (Error, Connecting),
        ];
        for from in ALL {
            for to in ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    is_valid_transition(from, to),
                    expected,
                    "{from} -> {to} expected {expected}"
                );
            }
        }
    }
}
