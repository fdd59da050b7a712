//! P2P fan-out peer connection (server → client audio)
//!
//! Per session, the outbound WebRTC leg. The server offers once the main
//! connection is up, attaches the shared fan-out audio track, and keeps the
//! connection alive across short drops with a cleanup grace window. The
//! client's uplink on this leg feeds local playback and the recorder while
//! that client holds the floor.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use super::peer::{self, CandidateQueue};
use super::RtcError;
use crate::audio::rtp::RtpPacketizer;
use crate::floor::SERVER_CLIENT_ID;
use crate::session::{ClientSession, TimerKind};
use crate::transport::envelope::{IceCandidatePayload, ServerEnvelope};
use crate::web::SharedState;

/// The outbound leg: connection, fan-out track, and its RTP clock.
pub struct P2pPeer {
    pub pc: Arc<RTCPeerConnection>,
    pub candidates: CandidateQueue,
    pub track: Arc<TrackLocalStaticRTP>,
    pub packetizer: Mutex<RtpPacketizer>,
    connected: AtomicBool,
}

impl P2pPeer {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Build the fan-out connection and send `p2p_offer`. A no-op when the
/// session already has one.
pub async fn create_for_session(
    state: &Arc<SharedState>,
    session: &Arc<ClientSession>,
) -> Result<(), RtcError> {
    let mut slot = session.p2p.lock().await;
    if slot.is_some() {
        return Ok(());
    }

    let pc = peer::create_peer_connection(&state.config.ice.stun_server).await?;

    let track = Arc::new(TrackLocalStaticRTP::new(
        peer::opus_codec_capability(),
        format!("audio-{}", session.client_id),
        "ptt-fanout".to_string(),
    ));

    let rtp_sender = pc
        .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(|e| RtcError::MediaError(format!("Failed to add fan-out track: {}", e)))?;

    // Drain RTCP so interceptors keep running
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
    });

    wire_callbacks(state, session, &pc);

    let peer = Arc::new(P2pPeer {
        pc: pc.clone(),
        candidates: CandidateQueue::new(),
        track,
        packetizer: Mutex::new(RtpPacketizer::new()),
        connected: AtomicBool::new(false),
    });
    *slot = Some(peer);
    drop(slot);

    let offer = peer::create_local_offer(&pc, state.config.timing.ice_gather_timeout()).await?;
    session.send(&ServerEnvelope::P2pOffer {
        from: SERVER_CLIENT_ID.to_string(),
        sdp: offer,
    });
    info!("Fan-out offer sent to {}", session.client_id);
    Ok(())
}

/// Apply the client's `p2p_answer`.
pub async fn handle_answer(session: &Arc<ClientSession>, sdp: &str) -> Result<(), RtcError> {
    let Some(peer) = session.p2p.lock().await.clone() else {
        debug!(
            "Dropping p2p_answer from {}: no fan-out connection",
            session.client_id
        );
        return Ok(());
    };

    peer::apply_remote_answer(&peer.pc, sdp).await?;
    peer.candidates.drain(&peer.pc).await;
    Ok(())
}

/// Queue or apply a trickle candidate for the fan-out connection.
pub async fn handle_candidate(session: &Arc<ClientSession>, payload: &IceCandidatePayload) {
    let peer = session.p2p.lock().await.clone();
    match peer {
        Some(peer) => peer.candidates.add(&peer.pc, peer::candidate_init(payload)).await,
        None => debug!(
            "Dropping p2p ICE candidate for {}: no connection yet",
            session.client_id
        ),
    }
}

/// Client asked for a fresh fan-out connection: clear lingering restart
/// timers, drop the old connection, build a new one.
pub async fn handle_reconnect_request(
    state: &Arc<SharedState>,
    session: &Arc<ClientSession>,
) -> Result<(), RtcError> {
    info!("Fan-out reconnect requested by {}", session.client_id);
    session.cancel_timer(TimerKind::IceRestart);
    session.cancel_timer(TimerKind::P2pCleanup);
    close_for_session(session).await;
    create_for_session(state, session).await
}

/// Tear down the fan-out connection, if any. The session may request a new
/// one later.
pub async fn close_for_session(session: &Arc<ClientSession>) {
    let peer = session.p2p.lock().await.take();
    if let Some(peer) = peer {
        peer.connected.store(false, Ordering::Release);
        if let Err(e) = peer.pc.close().await {
            debug!(
                "Fan-out close for {} reported: {}",
                session.client_id, e
            );
        }
    }
}

fn wire_callbacks(
    state: &Arc<SharedState>,
    session: &Arc<ClientSession>,
    pc: &Arc<RTCPeerConnection>,
) {
    let generation = session.generation();

    let cand_session = session.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let session = cand_session.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            if !session.is_current(generation) {
                return;
            }
            if let Some(payload) = peer::candidate_payload(&candidate) {
                session.send(&ServerEnvelope::P2pIceCandidate {
                    from: SERVER_CLIENT_ID.to_string(),
                    candidate: payload,
                });
            }
        })
    }));

    // Redundant uplink: playback + recording while this client speaks
    let track_state = state.clone();
    let track_session = session.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let state = track_state.clone();
        let session = track_session.clone();
        tokio::spawn(async move {
            debug!("Fan-out uplink track open for {}", session.client_id);
            while let Ok((packet, _)) = track.read_rtp().await {
                if !session.is_current(generation) {
                    break;
                }
                if packet.payload.is_empty() {
                    continue;
                }
                if state.floor.is_holder(&session.client_id) {
                    state.egress.handle_opus_payload(&packet.payload).await;
                }
            }
            debug!("Fan-out uplink track closed for {}", session.client_id);
        });
        Box::pin(async {})
    }));

    let state_cb = state.clone();
    let session_cb = session.clone();
    pc.on_peer_connection_state_change(Box::new(move |pc_state| {
        let state = state_cb.clone();
        let session = session_cb.clone();
        Box::pin(async move {
            on_state_change(&state, &session, generation, pc_state).await;
        })
    }));
}

async fn on_state_change(
    state: &Arc<SharedState>,
    session: &Arc<ClientSession>,
    generation: u64,
    pc_state: RTCPeerConnectionState,
) {
    if !session.is_current(generation) {
        return;
    }
    info!(
        "Fan-out connection for {} is {:?}",
        session.client_id, pc_state
    );

    let peer = session.p2p.lock().await.clone();
    let Some(peer) = peer else { return };

    match pc_state {
        RTCPeerConnectionState::Connected => {
            peer.connected.store(true, Ordering::Release);
            session.cancel_timer(TimerKind::P2pCleanup);
        }

        RTCPeerConnectionState::Disconnected => {
            peer.connected.store(false, Ordering::Release);
            let grace = state.config.timing.p2p_cleanup_grace();
            let timer_session = session.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if timer_session.close_requested() {
                    return;
                }
                warn!(
                    "Fan-out connection for {} did not recover within {:?}; tearing down",
                    timer_session.client_id, grace
                );
                close_for_session(&timer_session).await;
            });
            session.arm_timer(TimerKind::P2pCleanup, handle);
        }

        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
            peer.connected.store(false, Ordering::Release);
            session.cancel_timer(TimerKind::P2pCleanup);
            // Close from a fresh task; the connection must not be closed
            // from inside its own state-change handler
            let cleanup_session = session.clone();
            tokio::spawn(async move {
                close_for_session(&cleanup_session).await;
            });
        }

        _ => {}
    }
}
