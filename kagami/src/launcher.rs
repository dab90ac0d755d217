//! Agent launcher: pushes the on-device agent over adb and starts it.
//!
//! The adb invocations hide behind [`CommandRunner`] so session tests can
//! substitute a scripted runner; the real one shells out to the `adb`
//! binary on PATH (or wherever the caller points it).

use std::io;
use std::net::UdpSocket;
use std::process::{Child, Command, Stdio};

use crate::error::SessionError;
use crate::session::params::{SessionParams, Transport};

#[derive(Clone, Debug, Default)]
pub struct CommandOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

pub trait AgentProcess: Send {
    fn kill(&mut self);
}

pub trait CommandRunner: Send {
    /// Run a short adb command to completion.
    fn run(&self, args: &[String]) -> io::Result<CommandOutcome>;
    /// Start the long-running agent process.
    fn spawn(&self, args: &[String]) -> io::Result<Box<dyn AgentProcess>>;
}

pub struct AdbRunner {
    adb_path: String,
}

impl AdbRunner {
    pub fn new(adb_path: impl Into<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
        }
    }
}

impl Default for AdbRunner {
    fn default() -> Self {
        Self::new("adb")
    }
}

struct ChildProcess(Child);

impl AgentProcess for ChildProcess {
    fn kill(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

impl CommandRunner for AdbRunner {
    fn run(&self, args: &[String]) -> io::Result<CommandOutcome> {
        let output = Command::new(&self.adb_path).args(args).output()?;
        Ok(CommandOutcome {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(&self, args: &[String]) -> io::Result<Box<dyn AgentProcess>> {
        let child = Command::new(&self.adb_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(Box::new(ChildProcess(child)))
    }
}

pub struct Launcher {
    runner: Box<dyn CommandRunner>,
    agent: Option<Box<dyn AgentProcess>>,
    reverse_ports: Vec<u16>,
    serial: String,
}

impl Launcher {
    pub fn new(runner: Box<dyn CommandRunner>) -> Self {
        Self {
            runner,
            agent: None,
            reverse_ports: Vec::new(),
            serial: String::new(),
        }
    }

    /// Kill any stale agent, push the binary, set up tunnels and start it.
    /// Blocks until adb reports each step done; the agent itself keeps
    /// running in the background until [`Launcher::stop`].
    pub fn start(&mut self, params: &SessionParams) -> Result<(), SessionError> {
        self.serial = params.serial.clone();

        // A leftover agent would hold the ports.
        let _ = self.exec(&["shell", "pkill", "-f", "kagami-agent"]);

        self.exec(&[
            "push",
            &params.agent_local_path,
            &params.agent_remote_path,
        ])?;

        if params.transport() == Transport::Tcp {
            for port in [params.video_port(), params.control_port()] {
                self.exec(&[
                    "reverse",
                    &format!("tcp:{port}"),
                    &format!("tcp:{port}"),
                ])?;
                self.reverse_ports.push(port);
            }
        }

        let args = build_agent_args(params);
        let mut full = self.serial_args();
        full.extend(args);
        let agent = self
            .runner
            .spawn(&full)
            .map_err(|err| SessionError::AgentStartFailed(err.to_string()))?;
        self.agent = Some(agent);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut agent) = self.agent.take() {
            agent.kill();
        }
        for port in std::mem::take(&mut self.reverse_ports) {
            let _ = self.exec(&["reverse", "--remove", &format!("tcp:{port}")]);
        }
    }

    fn serial_args(&self) -> Vec<String> {
        vec!["-s".into(), self.serial.clone()]
    }

    fn exec(&self, args: &[&str]) -> Result<CommandOutcome, SessionError> {
        let mut full = self.serial_args();
        full.extend(args.iter().map(|s| s.to_string()));
        let outcome = self
            .runner
            .run(&full)
            .map_err(|err| SessionError::AgentStartFailed(err.to_string()))?;
        let combined = format!("{}{}", outcome.stdout, outcome.stderr);
        if combined.contains("unauthorized") {
            return Err(SessionError::AgentUnauthorized);
        }
        if !outcome.success {
            return Err(SessionError::AgentStartFailed(format!(
                "adb {} failed: {}",
                args.join(" "),
                outcome.stderr.trim()
            )));
        }
        Ok(outcome)
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The agent command line, key=value style after the class name.
pub fn build_agent_args(params: &SessionParams) -> Vec<String> {
    let mut args = vec![
        "shell".to_string(),
        format!("CLASSPATH={}", params.agent_remote_path),
        "app_process".to_string(),
        "/".to_string(),
        "com.kagami.Agent".to_string(),
        params.agent_version.clone(),
        format!("video_bit_rate={}", params.bit_rate),
    ];
    if !params.log_level.is_empty() {
        args.push(format!("log_level={}", params.log_level));
    }
    if params.max_size > 0 {
        args.push(format!("max_size={}", params.max_size));
    }
    if params.max_fps > 0 {
        args.push(format!("max_fps={}", params.max_fps));
    }

    use crate::session::params::OrientationLock;
    match params.orientation_lock {
        OrientationLock::None => {
            args.push(format!("capture_orientation={}", params.capture_orientation));
        }
        OrientationLock::Fixed => {
            args.push(format!("capture_orientation=@{}", params.capture_orientation));
        }
        OrientationLock::Original => {
            args.push("capture_orientation=@".to_string());
        }
    }

    if !params.crop.is_empty() {
        args.push(format!("crop={}", params.crop));
    }
    if params.stay_awake {
        args.push("stay_awake=true".to_string());
    }
    if params.close_screen {
        args.push("power_off_on_close=true".to_string());
    }
    if !params.codec_options.is_empty() {
        args.push(format!("codec_options={}", params.codec_options));
    }
    if !params.codec_name.is_empty() {
        args.push(format!("encoder_name={}", params.codec_name));
    }
    args.push("audio=false".to_string());
    if params.connection_id != 0 {
        args.push(format!("scid={:08x}", params.connection_id));
    }

    match params.transport() {
        Transport::ReliableUdp => {
            args.push("use_rudp=true".to_string());
            args.push(format!("rudp_port={}", params.video_port()));
            args.push(format!("rudp_control_port={}", params.control_port()));
            if let Some(host) = params.device_host() {
                if let Some(client_ip) = client_ip_toward(host) {
                    args.push(format!("client_ip={client_ip}"));
                }
            }
        }
        Transport::Tcp => {
            args.push(format!("tcp_port={}", params.video_port()));
        }
    }

    args
}

/// The local address the OS would route toward the device; the agent sends
/// its UDP stream back to this.
fn client_ip_toward(device_host: &str) -> Option<String> {
    let probe = UdpSocket::bind("0.0.0.0:0").ok()?;
    probe.connect((device_host, 9)).ok()?;
    Some(probe.local_addr().ok()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct ScriptedRunner {
        calls: Arc<Mutex<Vec<Vec<String>>>>,
        fail_on: Option<&'static str>,
        unauthorized: bool,
    }

    struct NoopAgent;

    impl AgentProcess for NoopAgent {
        fn kill(&mut self) {}
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, args: &[String]) -> io::Result<CommandOutcome> {
            self.calls.lock().push(args.to_vec());
            if self.unauthorized {
                return Ok(CommandOutcome {
                    success: false,
                    stdout: String::new(),
                    stderr: "device unauthorized".into(),
                });
            }
            let fail = self
                .fail_on
                .map(|needle| args.iter().any(|a| a.contains(needle)))
                .unwrap_or(false);
            Ok(CommandOutcome {
                success: !fail,
                stdout: String::new(),
                stderr: if fail { "step failed".into() } else { String::new() },
            })
        }

        fn spawn(&self, args: &[String]) -> io::Result<Box<dyn AgentProcess>> {
            self.calls.lock().push(args.to_vec());
            Ok(Box::new(NoopAgent))
        }
    }

    fn params_tcp() -> SessionParams {
        SessionParams {
            serial: "R5CT30ABCDE".into(),
            agent_local_path: "/opt/kagami/agent.jar".into(),
            connection_id: 0xabcd1234,
            ..Default::default()
        }
    }

    #[test]
    fn tcp_start_pushes_reverses_and_spawns() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let runner = ScriptedRunner {
            calls: calls.clone(),
            ..Default::default()
        };
        let mut launcher = Launcher::new(Box::new(runner));
        launcher.start(&params_tcp()).unwrap();

        let calls = calls.lock();
        assert!(calls.iter().any(|c| c.contains(&"push".to_string())));
        assert!(calls.iter().any(|c| c.contains(&"reverse".to_string())));
        let spawn = calls.last().unwrap();
        assert!(spawn.iter().any(|a| a.starts_with("CLASSPATH=")));
        assert!(spawn.iter().any(|a| a == "audio=false"));
        assert!(spawn.iter().any(|a| a == "scid=abcd1234"));
        assert!(spawn.iter().any(|a| a == "tcp_port=27183"));
    }

    #[test]
    fn unauthorized_device_is_reported_as_such() {
        let runner = ScriptedRunner {
            unauthorized: true,
            ..Default::default()
        };
        let mut launcher = Launcher::new(Box::new(runner));
        assert!(matches!(
            launcher.start(&params_tcp()),
            Err(SessionError::AgentUnauthorized)
        ));
    }

    #[test]
    fn push_failure_aborts_start() {
        let runner = ScriptedRunner {
            fail_on: Some("push"),
            ..Default::default()
        };
        let mut launcher = Launcher::new(Box::new(runner));
        assert!(matches!(
            launcher.start(&params_tcp()),
            Err(SessionError::AgentStartFailed(_))
        ));
    }

    #[test]
    fn rudp_args_carry_ports_and_no_tunnel() {
        let params = SessionParams {
            serial: "192.168.1.20:5555".into(),
            agent_local_path: "/opt/kagami/agent.jar".into(),
            ..Default::default()
        };
        let args = build_agent_args(&params);
        assert!(args.contains(&"use_rudp=true".to_string()));
        assert!(args.contains(&"rudp_port=27185".to_string()));
        assert!(args.contains(&"rudp_control_port=27186".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("tcp_port=")));
    }

    #[test]
    fn orientation_lock_encodings() {
        use crate::session::params::OrientationLock;
        let mut params = params_tcp();
        params.capture_orientation = 90;
        assert!(build_agent_args(&params).contains(&"capture_orientation=90".to_string()));

        params.orientation_lock = OrientationLock::Fixed;
        assert!(build_agent_args(&params).contains(&"capture_orientation=@90".to_string()));

        params.orientation_lock = OrientationLock::Original;
        params.capture_orientation = 0;
        assert!(build_agent_args(&params).contains(&"capture_orientation=@".to_string()));
    }
}
