//! Vulkan presentation layer: a thin device wrapper and the YUV video
//! renderer that consumes decoded frames from the media mailbox.

pub mod video;
pub mod vulkan;

pub use video::{FrameGrab, VideoRenderer};

/// External dependencies exposed outside of current crate.
pub use ash::{self, vk};
pub use raw_window_handle;
