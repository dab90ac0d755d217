//! Session configuration.

use std::time::Duration;

use crate::error::SessionError;

pub const DEFAULT_RUDP_PORT: u16 = 27185;
pub const DEFAULT_TCP_PORT: u16 = 27183;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    ReliableUdp,
    Tcp,
}

/// How the agent locks the capture orientation.
/// `None` follows the device; `Fixed` pins the given angle; `Original`
/// keeps the orientation the stream started with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrientationLock {
    None,
    Fixed,
    Original,
}

#[derive(Clone, Debug)]
pub struct SessionParams {
    /// adb serial; `host:port` serials are network devices.
    pub serial: String,
    /// Local path of the agent binary pushed to the device.
    pub agent_local_path: String,
    pub agent_remote_path: String,
    pub agent_version: String,

    pub max_size: u16,
    pub bit_rate: u32,
    pub max_fps: u32,
    pub codec_name: String,
    pub codec_options: String,

    pub video_port: u16,
    pub log_level: String,
    /// Random connection id passed to the agent, hex-encoded on the wire.
    pub connection_id: u32,

    pub stay_awake: bool,
    pub close_screen: bool,
    pub crop: String,

    pub orientation_lock: OrientationLock,
    pub capture_orientation: u16,

    pub connect_timeout: Duration,
    pub keymap_json: Option<String>,
    pub keymap_dir: Option<String>,
    pub fec_group: Option<u8>,
    pub prefer_hardware_decode: bool,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            serial: String::new(),
            agent_local_path: String::new(),
            agent_remote_path: "/data/local/tmp/kagami-agent.jar".into(),
            agent_version: "3.3.4".into(),
            max_size: 720,
            bit_rate: 8_000_000,
            max_fps: 60,
            codec_name: String::new(),
            codec_options: String::new(),
            video_port: 0,
            log_level: "info".into(),
            connection_id: 0,
            stay_awake: false,
            close_screen: false,
            crop: String::new(),
            orientation_lock: OrientationLock::None,
            capture_orientation: 0,
            connect_timeout: Duration::from_secs(30),
            keymap_json: None,
            keymap_dir: None,
            fec_group: Some(10),
            prefer_hardware_decode: true,
        }
    }
}

impl SessionParams {
    /// Network devices carry a `host:port` serial and stream over
    /// reliable UDP; everything else is a local device over TCP.
    pub fn transport(&self) -> Transport {
        if self.serial.contains(':') {
            Transport::ReliableUdp
        } else {
            Transport::Tcp
        }
    }

    pub fn device_host(&self) -> Option<&str> {
        self.serial.split(':').next().filter(|s| !s.is_empty())
    }

    pub fn video_port(&self) -> u16 {
        if self.video_port != 0 {
            self.video_port
        } else if self.transport() == Transport::ReliableUdp {
            DEFAULT_RUDP_PORT
        } else {
            DEFAULT_TCP_PORT
        }
    }

    /// The control channel rides one port above the video stream.
    pub fn control_port(&self) -> u16 {
        self.video_port() + 1
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.serial.is_empty() {
            return Err(SessionError::InvalidParameter("device serial is empty".into()));
        }
        if self.agent_local_path.is_empty() {
            return Err(SessionError::InvalidParameter(
                "agent binary path is empty".into(),
            ));
        }
        if self.bit_rate == 0 {
            return Err(SessionError::InvalidParameter("bit rate must be > 0".into()));
        }
        // The agent's behaviour for "keep original orientation" combined
        // with an explicit angle is undefined; refuse rather than guess.
        if self.orientation_lock == OrientationLock::Original && self.capture_orientation != 0 {
            return Err(SessionError::InvalidParameter(
                "orientation lock 'original' cannot carry an explicit angle".into(),
            ));
        }
        if self.capture_orientation % 90 != 0 || self.capture_orientation >= 360 {
            return Err(SessionError::InvalidParameter(
                "capture orientation must be 0, 90, 180 or 270".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> SessionParams {
        SessionParams {
            serial: "192.168.1.20:5555".into(),
            agent_local_path: "/opt/kagami/agent.jar".into(),
            ..Default::default()
        }
    }

    #[test]
    fn network_serial_selects_reliable_udp() {
        let params = valid();
        assert_eq!(params.transport(), Transport::ReliableUdp);
        assert_eq!(params.video_port(), DEFAULT_RUDP_PORT);
        assert_eq!(params.control_port(), DEFAULT_RUDP_PORT + 1);
        assert_eq!(params.device_host(), Some("192.168.1.20"));
    }

    #[test]
    fn usb_serial_selects_tcp() {
        let params = SessionParams {
            serial: "R5CT30ABCDE".into(),
            ..valid()
        };
        assert_eq!(params.transport(), Transport::Tcp);
        assert_eq!(params.video_port(), DEFAULT_TCP_PORT);
    }

    #[test]
    fn original_lock_with_angle_is_rejected() {
        let params = SessionParams {
            orientation_lock: OrientationLock::Original,
            capture_orientation: 90,
            ..valid()
        };
        assert!(matches!(
            params.validate(),
            Err(SessionError::InvalidParameter(_))
        ));
    }

    #[test]
    fn fixed_lock_with_angle_is_accepted() {
        let params = SessionParams {
            orientation_lock: OrientationLock::Fixed,
            capture_orientation: 270,
            ..valid()
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn odd_angles_are_rejected() {
        let params = SessionParams {
            capture_orientation: 45,
            ..valid()
        };
        assert!(params.validate().is_err());
    }
}
