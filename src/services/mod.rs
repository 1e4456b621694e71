//! Services — session state, pacing, negotiation, and lifecycle.
//!
//! Route handlers call into these modules; nothing here knows about HTTP or
//! websockets beyond the frames it broadcasts to bound clients.

pub mod events;
pub mod extension;
pub mod formatter;
pub mod lifecycle;
pub mod prompt;
pub mod reply;
pub mod segmenter;
pub mod store;
