//! Reliable UDP: the [`arq`] retransmission core plus the socket driver
//! that gives it a clock and a wire.

pub mod arq;
mod socket;

pub use arq::{Arq, ArqConfig, ArqStats};
pub use socket::{RudpChannel, RudpStats, VIDEO_CONV};
