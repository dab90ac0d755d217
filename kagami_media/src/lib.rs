//! Media pipeline: preallocated frame ownership, the demuxer that walks the
//! wire stream, the FFmpeg decoder that fills pool frames, and the
//! performance counters every stage reports into.

use thiserror::Error;

pub mod decode;
pub mod demux;
pub mod frame;
pub mod mailbox;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod spsc;

pub use demux::{DemuxEvent, Demuxer, EncodedPacket};
pub use frame::FrameMeta;
pub use mailbox::Mailbox;
pub use metrics::{Metrics, MetricsSnapshot};
pub use pool::{FrameHandle, FramePool};
pub use queue::FrameQueue;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("no decoder available for codec {0}")]
    CodecNotFound(&'static str),

    #[error("could not open decoder: {0}")]
    DecoderOpenFailed(String),

    #[error("frame decode failed: {0}")]
    FrameDecodeFailed(String),

    #[error("video stream ended")]
    StreamStopped,
}
