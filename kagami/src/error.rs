//! Session-level error kinds with user-facing messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("component used before initialisation")]
    NotInitialized,

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("could not start the on-device agent: {0}")]
    AgentStartFailed(String),

    #[error("the device rejected the connection")]
    AgentUnauthorized,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection to the device was lost")]
    ConnectionLost,

    #[error("protocol handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("video decoder could not be opened: {0}")]
    DecoderOpenFailed(String),

    #[error("hardware decoding unavailable, switched to software")]
    HardwareDecoderFallback,

    #[error("frame decode failed: {0}")]
    FrameDecodeFailed(String),

    #[error("control message queue is full")]
    ControlMsgQueueFull,

    #[error("key-binding script failed: {0}")]
    ScriptEvalFailed(String),
}

impl SessionError {
    /// A one-line actionable hint, where one exists.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SessionError::AgentUnauthorized => {
                Some("approve USB debugging on the phone and reconnect")
            }
            SessionError::HardwareDecoderFallback => {
                Some("switched to software decoder, CPU usage may rise")
            }
            SessionError::AgentStartFailed(_) => {
                Some("check that adb can see the device (adb devices)")
            }
            SessionError::ConnectionFailed(_) | SessionError::ConnectionLost => {
                Some("check the network link to the device and restart the session")
            }
            SessionError::Timeout => Some("the device did not answer in time; try again"),
            _ => None,
        }
    }

    /// Soft errors leave the session streaming.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SessionError::HardwareDecoderFallback
                | SessionError::ControlMsgQueueFull
                | SessionError::ScriptEvalFailed(_)
                | SessionError::FrameDecodeFailed(_)
        )
    }
}

impl From<kagami_media::MediaError> for SessionError {
    fn from(err: kagami_media::MediaError) -> Self {
        use kagami_media::MediaError;
        match err {
            MediaError::CodecNotFound(name) => {
                SessionError::DecoderOpenFailed(format!("no decoder for {name}"))
            }
            MediaError::DecoderOpenFailed(msg) => SessionError::DecoderOpenFailed(msg),
            MediaError::FrameDecodeFailed(msg) => SessionError::FrameDecodeFailed(msg),
            MediaError::StreamStopped => SessionError::ConnectionLost,
        }
    }
}

impl From<kagami_transport::TransportError> for SessionError {
    fn from(err: kagami_transport::TransportError) -> Self {
        use kagami_transport::TransportError;
        match err {
            TransportError::TimedOut => SessionError::Timeout,
            TransportError::Closed => SessionError::ConnectionLost,
            TransportError::Dropped => SessionError::ControlMsgQueueFull,
            other => SessionError::ConnectionFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_exist_for_actionable_errors() {
        assert!(SessionError::AgentUnauthorized.hint().is_some());
        assert!(SessionError::HardwareDecoderFallback.hint().is_some());
        assert!(SessionError::NotInitialized.hint().is_none());
    }

    #[test]
    fn soft_errors_are_not_fatal() {
        assert!(!SessionError::HardwareDecoderFallback.is_fatal());
        assert!(!SessionError::ScriptEvalFailed("x".into()).is_fatal());
        assert!(SessionError::ConnectionLost.is_fatal());
        assert!(SessionError::HandshakeFailed("x".into()).is_fatal());
    }
}
