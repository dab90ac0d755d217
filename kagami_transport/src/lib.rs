//! Transport layer for the mirroring client: a reliable-UDP channel with
//! optional XOR forward error correction, a thin TCP channel, and the wire
//! formats shared with the on-device agent.

use std::io;

use thiserror::Error;

pub mod channel;
pub mod control;
pub mod fec;
pub mod rudp;
pub mod tcp;
pub mod wire;

pub use channel::Channel;
pub use control::{ControlMsg, FastMsg, TouchSequence};
pub use fec::{FecDecoder, FecEncoder};
pub use rudp::RudpChannel;
pub use tcp::TcpChannel;
pub use wire::PacketHeader;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel is closed")]
    Closed,

    #[error("receive deadline elapsed")]
    TimedOut,

    /// Non-blocking send could not take the payload. The caller counts the
    /// drop and moves on; retrying is the reliable layer's job.
    #[error("send buffer full, payload dropped")]
    Dropped,

    #[error("malformed {0} packet")]
    Malformed(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
