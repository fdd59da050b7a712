//! WebRTC session plumbing
//!
//! Two peer connections per client: the inbound "main" leg carrying the
//! client's microphone, and the outbound "p2p" leg fanning the speaker's
//! audio back out. SDP/ICE handling is shared through `peer`.

pub mod main_pc;
pub mod p2p;
pub mod peer;
pub mod sdp;

use std::error::Error;
use std::fmt;

/// WebRTC-related errors
#[derive(Debug)]
pub enum RtcError {
    /// Peer connection creation failed
    ConnectionFailed(String),
    /// SDP processing failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Media track error
    MediaError(String),
    /// Invalid state transition
    InvalidState(String),
}

impl fmt::Display for RtcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtcError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            RtcError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            RtcError::IceError(msg) => write!(f, "ICE error: {}", msg),
            RtcError::MediaError(msg) => write!(f, "Media error: {}", msg),
            RtcError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl Error for RtcError {}
