//! kagami: low-latency Android screen mirroring and remote control.
//!
//! The binary wires a winit window to the session controller; the library
//! surface exists so the pieces stay testable on their own.

pub mod control;
pub mod error;
pub mod input;
pub mod keymap;
pub mod launcher;
pub mod script;
pub mod session;

pub use error::SessionError;
pub use session::{Session, SessionObserver, SessionParams, SessionState};
