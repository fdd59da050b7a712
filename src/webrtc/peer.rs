//! PeerConnection construction and shared SDP/ICE helpers
//!
//! Both the main and P2P legs are built here: an Opus-only media engine,
//! the advertised STUN server, the pending-candidate queue, and the
//! munged-answer path used for every local description the server emits.

use super::sdp::munge_opus_mono;
use super::RtcError;
use crate::transport::envelope::IceCandidatePayload;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};

/// RTP payload type used for Opus on every connection.
pub const OPUS_PAYLOAD_TYPE: u8 = 111;

/// Pending ICE candidates are dropped beyond this depth.
pub const CANDIDATE_QUEUE_LIMIT: usize = 64;

/// Codec capability shared by outbound tracks and the media engine.
pub fn opus_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_string(),
        clock_rate: 48_000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Create a peer connection advertising the configured STUN server.
pub async fn create_peer_connection(
    stun_server: &str,
) -> Result<Arc<RTCPeerConnection>, RtcError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: opus_codec_capability(),
                payload_type: OPUS_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(|e| RtcError::ConnectionFailed(format!("Failed to register Opus: {}", e)))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| RtcError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![stun_server.to_string()],
            ..Default::default()
        }],
        ..Default::default()
    };

    let peer_connection = api
        .new_peer_connection(rtc_config)
        .await
        .map_err(|e| RtcError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;

    Ok(Arc::new(peer_connection))
}

/// Apply a remote offer and produce a munged (Opus-mono) local answer.
/// Returns the answer SDP that was installed.
pub async fn answer_remote_offer(
    peer_connection: &Arc<RTCPeerConnection>,
    offer_sdp: &str,
) -> Result<String, RtcError> {
    let offer = RTCSessionDescription::offer(offer_sdp.to_string())
        .map_err(|e| RtcError::SdpError(format!("Invalid SDP offer: {}", e)))?;

    peer_connection
        .set_remote_description(offer)
        .await
        .map_err(|e| RtcError::SdpError(format!("Failed to set remote description: {}", e)))?;

    let answer = peer_connection
        .create_answer(None)
        .await
        .map_err(|e| RtcError::SdpError(format!("Failed to create answer: {}", e)))?;

    let munged = munge_opus_mono(&answer.sdp);
    let local = RTCSessionDescription::answer(munged.clone())
        .map_err(|e| RtcError::SdpError(format!("Munged answer rejected: {}", e)))?;

    peer_connection
        .set_local_description(local)
        .await
        .map_err(|e| RtcError::SdpError(format!("Failed to set local description: {}", e)))?;

    Ok(munged)
}

/// Apply a remote answer on a connection where we were the offerer.
pub async fn apply_remote_answer(
    peer_connection: &Arc<RTCPeerConnection>,
    answer_sdp: &str,
) -> Result<(), RtcError> {
    let answer = RTCSessionDescription::answer(answer_sdp.to_string())
        .map_err(|e| RtcError::SdpError(format!("Invalid SDP answer: {}", e)))?;

    peer_connection
        .set_remote_description(answer)
        .await
        .map_err(|e| RtcError::SdpError(format!("Failed to set remote description: {}", e)))?;

    Ok(())
}

/// Create a local offer (munged), wait for ICE gathering up to the deadline,
/// and return the SDP to send. Gathering overrun is not an error; trickle
/// candidates follow separately.
pub async fn create_local_offer(
    peer_connection: &Arc<RTCPeerConnection>,
    gather_timeout: Duration,
) -> Result<String, RtcError> {
    let offer = peer_connection
        .create_offer(None)
        .await
        .map_err(|e| RtcError::SdpError(format!("Failed to create offer: {}", e)))?;

    let munged = munge_opus_mono(&offer.sdp);
    let local = RTCSessionDescription::offer(munged)
        .map_err(|e| RtcError::SdpError(format!("Munged offer rejected: {}", e)))?;

    let mut gather_complete = peer_connection.gathering_complete_promise().await;

    peer_connection
        .set_local_description(local)
        .await
        .map_err(|e| RtcError::SdpError(format!("Failed to set local description: {}", e)))?;

    if tokio::time::timeout(gather_timeout, gather_complete.recv())
        .await
        .is_err()
    {
        debug!("ICE gathering deadline reached; sending offer with partial candidates");
    }

    match peer_connection.local_description().await {
        Some(desc) => Ok(desc.sdp),
        None => Err(RtcError::InvalidState(
            "Local description missing after offer".to_string(),
        )),
    }
}

/// Buffer for ICE candidates that arrive before the corresponding remote
/// description. Drained FIFO once the description is applied; overflow
/// beyond [`CANDIDATE_QUEUE_LIMIT`] is dropped with a warning.
pub struct CandidateQueue {
    pending: Mutex<Vec<RTCIceCandidateInit>>,
    remote_applied: AtomicBool,
}

impl Default for CandidateQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            remote_applied: AtomicBool::new(false),
        }
    }

    /// Apply a candidate now, or queue it until the remote description
    /// lands. Library rejections are logged and not fatal.
    pub async fn add(
        &self,
        peer_connection: &Arc<RTCPeerConnection>,
        init: RTCIceCandidateInit,
    ) {
        if self.remote_applied.load(Ordering::Acquire) {
            if let Err(e) = peer_connection.add_ice_candidate(init).await {
                debug!("ICE candidate rejected: {}", e);
            }
            return;
        }

        let mut pending = self.pending.lock();
        if pending.len() >= CANDIDATE_QUEUE_LIMIT {
            warn!(
                "Pending ICE candidate queue full ({}); dropping candidate",
                CANDIDATE_QUEUE_LIMIT
            );
            return;
        }
        pending.push(init);
    }

    /// Mark the remote description applied and drain the queue in order.
    pub async fn drain(&self, peer_connection: &Arc<RTCPeerConnection>) {
        self.remote_applied.store(true, Ordering::Release);
        let queued: Vec<RTCIceCandidateInit> = std::mem::take(&mut *self.pending.lock());
        for init in queued {
            if let Err(e) = peer_connection.add_ice_candidate(init).await {
                debug!("Queued ICE candidate rejected: {}", e);
            }
        }
    }

    /// Reset for a fresh negotiation (ICE restart reuses the queue).
    pub fn reset(&self) {
        self.remote_applied.store(false, Ordering::Release);
        self.pending.lock().clear();
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Envelope payload → library candidate.
pub fn candidate_init(payload: &IceCandidatePayload) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: payload.candidate.clone(),
        sdp_mid: payload.sdp_mid.clone(),
        sdp_mline_index: payload.sdp_mline_index,
        username_fragment: None,
    }
}

/// Library candidate → envelope payload, for trickle sends.
pub fn candidate_payload(candidate: &RTCIceCandidate) -> Option<IceCandidatePayload> {
    match candidate.to_json() {
        Ok(init) => Some(IceCandidatePayload {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }),
        Err(e) => {
            debug!("Failed to serialize local ICE candidate: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_peer_connection_with_opus_engine() {
        let pc = create_peer_connection("stun:stun.example.com:3478").await;
        assert!(pc.is_ok());
    }

    #[tokio::test]
    async fn candidate_queue_caps_pending_depth() {
        let pc = create_peer_connection("stun:stun.example.com:3478")
            .await
            .unwrap();
        let queue = CandidateQueue::new();

        for i in 0..CANDIDATE_QUEUE_LIMIT + 8 {
            let init = RTCIceCandidateInit {
                candidate: format!("candidate:{} 1 udp 1 192.0.2.1 {} typ host", i, 5000 + i),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            };
            queue.add(&pc, init).await;
        }

        assert_eq!(queue.pending_len(), CANDIDATE_QUEUE_LIMIT);
        queue.reset();
        assert_eq!(queue.pending_len(), 0);
    }
}
