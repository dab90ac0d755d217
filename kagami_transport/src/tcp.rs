//! TCP channel: a thin wrapper tuned for latency rather than throughput.
//! `TCP_NODELAY` plus a 16 KB send buffer keep the kernel queue shallow so
//! control messages are not stuck behind a burst.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use socket2::SockRef;

use crate::channel::Channel;
use crate::{Result, TransportError};

const SEND_BUFFER_BYTES: usize = 16 * 1024;
const RECV_DEADLINE: Duration = Duration::from_millis(100);

pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    /// Connect out to a forwarded agent port.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Self::from_stream(stream)
    }

    /// Accept a single connection from the agent (reverse-tunnel mode: the
    /// device dials back to us).
    pub fn accept(listener: &TcpListener, timeout: Duration) -> Result<Self> {
        listener.set_nonblocking(true)?;
        let start = std::time::Instant::now();
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false)?;
                    return Self::from_stream(stream);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(TransportError::TimedOut);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        SockRef::from(&stream).set_send_buffer_size(SEND_BUFFER_BYTES)?;
        stream.set_read_timeout(Some(RECV_DEADLINE))?;
        Ok(Self { stream })
    }
}

impl Channel for TcpChannel {
    fn send(&self, data: &[u8]) -> Result<usize> {
        // Write via &TcpStream so the channel is shareable; control messages
        // are far smaller than the send buffer, so this does not stall.
        match (&self.stream).write_all(data) {
            Ok(()) => Ok(data.len()),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(TransportError::Dropped),
            Err(_) => Err(TransportError::Closed),
        }
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        match (&self.stream).read(buf) {
            Ok(n) => Ok(n),
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                Err(TransportError::TimedOut)
            }
            Err(_) => Ok(0),
        }
    }

    fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
