//! Main peer connection (client microphone uplink)
//!
//! Per session, the inbound WebRTC leg. The client offers, the server
//! answers with Opus forced to mono; uplink RTP is fanned out to the other
//! participants while this client holds the floor. A `disconnected`
//! connection goes through the ICE-restart protocol: prompt the client,
//! answer its fresh-credential offer, and give up after a bounded number of
//! attempts.

use log::{debug, info, warn};
use std::sync::Arc;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use super::peer::{self, CandidateQueue};
use super::RtcError;
use crate::audio::fanout_opus_frame;
use crate::session::{ClientSession, TimerKind};
use crate::transport::envelope::{IceCandidatePayload, ServerEnvelope};
use crate::web::SharedState;

/// The inbound leg and its pending-candidate queue.
pub struct MainPeer {
    pub pc: Arc<RTCPeerConnection>,
    pub candidates: CandidateQueue,
}

/// Handle the client's first offer: build the main PC, answer, start
/// trickling. A `set_remote_description` failure is fatal for the session
/// (the caller closes it).
pub async fn handle_offer(
    state: &Arc<SharedState>,
    session: &Arc<ClientSession>,
    sdp: &str,
) -> Result<(), RtcError> {
    session.cancel_timer(TimerKind::OfferWait);

    {
        let slot = session.main_pc.lock().await;
        if slot.is_some() {
            warn!(
                "Ignoring duplicate offer from {}; main connection already exists",
                session.client_id
            );
            return Ok(());
        }
    }

    let pc = peer::create_peer_connection(&state.config.ice.stun_server).await?;

    pc.add_transceiver_from_kind(
        RTPCodecType::Audio,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        }),
    )
    .await
    .map_err(|e| RtcError::MediaError(format!("Failed to add audio transceiver: {}", e)))?;

    let main = Arc::new(MainPeer {
        pc: pc.clone(),
        candidates: CandidateQueue::new(),
    });
    *session.main_pc.lock().await = Some(main.clone());

    wire_callbacks(state, session, &pc);

    let answer = peer::answer_remote_offer(&pc, sdp).await?;
    main.candidates.drain(&pc).await;

    session.send(&ServerEnvelope::Answer { sdp: answer });
    info!("Main connection answered for {}", session.client_id);
    Ok(())
}

/// Queue or apply a trickle candidate for the main PC.
pub async fn handle_candidate(session: &Arc<ClientSession>, payload: &IceCandidatePayload) {
    let main = session.main_pc.lock().await.clone();
    match main {
        Some(main) => main.candidates.add(&main.pc, peer::candidate_init(payload)).await,
        None => debug!(
            "Dropping main ICE candidate for {}: no connection yet",
            session.client_id
        ),
    }
}

/// Apply an `ice_restart_offer` with fresh credentials and answer it.
pub async fn handle_ice_restart_offer(
    state: &Arc<SharedState>,
    session: &Arc<ClientSession>,
    sdp: &str,
) -> Result<(), RtcError> {
    let Some(main) = session.main_pc.lock().await.clone() else {
        return Err(RtcError::InvalidState(
            "ICE restart offer without a main connection".to_string(),
        ));
    };

    session.cancel_timer(TimerKind::IceRestart);
    session.ice_restart.lock().in_progress = true;
    main.candidates.reset();

    let answer = peer::answer_remote_offer(&main.pc, sdp).await?;
    main.candidates.drain(&main.pc).await;
    session.send(&ServerEnvelope::IceRestartAnswer { sdp: answer });
    info!("ICE restart answered for {}", session.client_id);

    // The transition may still stall; keep a deadline running
    let stall_state = state.clone();
    let stall_session = session.clone();
    let deadline = state.config.timing.ice_restart_timeout();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        if stall_session.close_requested() {
            return;
        }
        let stalled = stall_session.ice_restart.lock().in_progress;
        if stalled {
            debug!(
                "ICE restart still not connected for {}",
                stall_session.client_id
            );
            prompt_ice_restart(&stall_state, &stall_session);
        }
    });
    session.arm_timer(TimerKind::IceRestart, handle);

    Ok(())
}

/// Send `request_ice_restart` and arm the response deadline. Exhausting the
/// attempt limit closes the session instead.
pub fn prompt_ice_restart(state: &Arc<SharedState>, session: &Arc<ClientSession>) {
    let attempt = {
        let mut restart = session.ice_restart.lock();
        if restart.attempts >= state.config.timing.ice_restart_max_attempts {
            drop(restart);
            warn!(
                "ICE restart attempts exhausted for {}; closing session",
                session.client_id
            );
            session.request_close();
            return;
        }
        restart.attempts += 1;
        restart.in_progress = false;
        restart.attempts
    };

    info!(
        "Requesting ICE restart from {} (attempt {}/{})",
        session.client_id, attempt, state.config.timing.ice_restart_max_attempts
    );
    session.send(&ServerEnvelope::RequestIceRestart);

    let timer_state = state.clone();
    let timer_session = session.clone();
    let deadline = state.config.timing.ice_restart_timeout();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        if timer_session.close_requested() {
            return;
        }
        debug!(
            "No ICE restart offer from {} within {:?}",
            timer_session.client_id, deadline
        );
        prompt_ice_restart(&timer_state, &timer_session);
    });
    session.arm_timer(TimerKind::IceRestart, handle);
}

fn wire_callbacks(
    state: &Arc<SharedState>,
    session: &Arc<ClientSession>,
    pc: &Arc<RTCPeerConnection>,
) {
    let generation = session.generation();

    // Trickle local candidates out to the client
    let cand_session = session.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let session = cand_session.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            if !session.is_current(generation) {
                return;
            }
            if let Some(payload) = peer::candidate_payload(&candidate) {
                session.send(&ServerEnvelope::IceCandidate { candidate: payload });
            }
        })
    }));

    // Uplink audio: fan out to the other participants while this client
    // holds the floor
    let track_state = state.clone();
    let track_session = session.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let state = track_state.clone();
        let session = track_session.clone();
        tokio::spawn(async move {
            debug!(
                "Main uplink track open for {} ({})",
                session.client_id,
                track.codec().capability.mime_type
            );
            while let Ok((packet, _)) = track.read_rtp().await {
                if !session.is_current(generation) {
                    break;
                }
                if packet.payload.is_empty() {
                    continue;
                }
                if state.floor.is_holder(&session.client_id) {
                    fanout_opus_frame(&state.registry, Some(&session.client_id), &packet.payload)
                        .await;
                }
            }
            debug!("Main uplink track closed for {}", session.client_id);
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
        "Main connection for {} is {:?}",
        session.client_id, pc_state
    );

    match pc_state {
        RTCPeerConnectionState::Connected => {
            session.cancel_timer(TimerKind::IceRestart);
            {
                let mut restart = session.ice_restart.lock();
                if restart.in_progress {
                    info!("ICE restart succeeded for {}", session.client_id);
                    restart.success_at = Some(std::time::Instant::now());
                }
                restart.in_progress = false;
                restart.attempts = 0;
            }

            session.send(&ServerEnvelope::ClientList {
                clients: state.registry.client_list().await,
            });

            if let Err(e) = crate::webrtc::p2p::create_for_session(state, session).await {
                warn!(
                    "Failed to create fan-out connection for {}: {}",
                    session.client_id, e
                );
            }
        }

        RTCPeerConnectionState::Disconnected => {
            {
                let restart = session.ice_restart.lock();
                if restart.in_progress {
                    return;
                }
                if let Some(success_at) = restart.success_at {
                    if success_at.elapsed() < state.config.timing.ice_restart_cooldown() {
                        debug!(
                            "Ignoring transient disconnect for {} inside restart cooldown",
                            session.client_id
                        );
                        return;
                    }
                }
            }
            prompt_ice_restart(state, session);
        }

        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
            session.request_close();
        }

        _ => {}
    }
}
