//! HTTP surface and shared server state
//!
//! `shared` wires every subsystem together and owns the floor
//! orchestration; `http_server` exposes the VOX and dashboard endpoints
//! plus the signaling WebSocket; `auth` holds dashboard session tokens.

pub mod auth;
pub mod http_server;
pub mod shared;

pub use shared::SharedState;
