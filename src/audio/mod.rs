//! Audio pipeline
//!
//! Opus frames flow three ways: from the mic transcoder to every P2P track
//! (`ingress`), from the floor holder's main-PC uplink to every *other* P2P
//! track (fan-out below), and from the holder's P2P uplink to the speaker
//! and recorder subprocesses (`egress`).

pub mod egress;
pub mod ingress;
pub mod ogg;
pub mod rtp;

use bytes::Bytes;
use log::debug;
use webrtc::track::track_local::TrackLocalWriter;

use crate::session::registry::Registry;

/// Write one Opus frame to every connected P2P track, skipping the source
/// client so a speaker never hears itself. Each downstream track stamps its
/// own RTP header, keeping per-track sequence numbers monotone.
pub async fn fanout_opus_frame(registry: &Registry, source: Option<&str>, frame: &[u8]) {
    for session in registry.all().await {
        if Some(session.client_id.as_str()) == source {
            continue;
        }

        let p2p = session.p2p.lock().await.clone();
        let Some(p2p) = p2p else { continue };
        if !p2p.is_connected() {
            continue;
        }

        let packet = p2p.packetizer.lock().packet(Bytes::copy_from_slice(frame));
        if let Err(e) = p2p.track.write_rtp(&packet).await {
            debug!("Fan-out write to {} failed: {}", session.client_id, e);
        }
    }
}
