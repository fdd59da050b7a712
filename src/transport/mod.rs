//! Signaling transport
//!
//! JSON envelopes over a per-client WebSocket: schema in `envelope`,
//! connection loop and heartbeat in `websocket`.

pub mod envelope;
pub mod websocket;

pub use envelope::{ClientEnvelope, ServerEnvelope};
pub use websocket::handle_signaling_connection;
