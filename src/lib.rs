//! ptt-core - push-to-talk conferencing core
//!
//! A half-duplex voice conferencing server: WebSocket signaling, per-client
//! WebRTC audio sessions, a single global transmit floor, and an optional
//! serial-attached radio relay.

pub mod args;
pub mod config;
pub mod logging;
pub mod floor;
pub mod relay;
pub mod names;
pub mod push;
pub mod session;
pub mod transport;
pub mod audio;
pub mod web;
pub mod webrtc;

// Re-exports
pub use config::Config;
pub use floor::{FloorArbiter, EXTERNAL_CLIENT_ID, SERVER_CLIENT_ID};
pub use session::registry::Registry;
pub use transport::envelope::{ClientEnvelope, ServerEnvelope};
pub use web::SharedState;
