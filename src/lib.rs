//! veil: a damage-driven X11 compositing manager
//!
//! The core of the crate is a window lifecycle state machine and a
//! per-frame repaint scheduler (`comp`), driven entirely by pre-decoded
//! notifications and wall-clock instants, with image binding delegated to
//! a backend trait. The `x11` module wraps the core in an actual session:
//! Composite redirection, event decoding and an XRender painter.

pub mod animation;
pub mod backend;
pub mod comp;
pub mod config;
pub mod events;
pub mod geometry;
pub mod x11;

use comp::window::WinState;

/// X resource id.
pub type Xid = u32;

/// Errors shared by the state machine, the scheduler and the backend
/// seam. Everything here is contained per window; none of it tears the
/// session down.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The in-memory model disagrees with the server about a window's
    /// state. The request is logged and dropped.
    #[error("no `{request}` transition from {from:?}")]
    BadTransition { from: WinState, request: &'static str },

    #[error("image bind failed for window {window:#x}: {reason}")]
    ImageBind { window: Xid, reason: String },

    /// A server round trip on the backend path failed.
    #[error("display error: {0}")]
    Display(String),
}

pub use comp::Compositor;
pub use config::Config;
pub use events::{Listener, Notification};
