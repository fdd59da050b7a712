//! Signaling connection loop
//!
//! One task per WebSocket: a writer draining the session's outbound
//! channel, and the receive loop that parses envelopes and drives the
//! session state machine. Malformed frames are dropped without closing;
//! any close, local or remote, funnels into the full session teardown.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::floor::SERVER_CLIENT_ID;
use crate::session::registry::P2pSignal;
use crate::session::{ClientSession, TimerKind};
use crate::transport::envelope::{ClientEnvelope, ServerEnvelope};
use crate::web::SharedState;
use crate::webrtc::{main_pc, p2p};

/// Drive one signaling connection from accept to teardown.
pub async fn handle_signaling_connection(socket: WebSocket, state: Arc<SharedState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Writer task: best-effort, exits with the socket
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let session = state.registry.register(tx).await;
    let client_id = session.client_id.clone();
    info!("Signaling connection open for {}", client_id);

    session.send(&state.config_envelope(&client_id));

    state
        .registry
        .broadcast(
            &ServerEnvelope::ClientJoined {
                client_id: client_id.clone(),
                display_name: None,
            },
            Some(&client_id),
        )
        .await;

    arm_offer_wait(&state, &session);
    arm_heartbeat(&state, &session);

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match ClientEnvelope::from_json(text.as_str()) {
                            Ok(envelope) => dispatch(&state, &session, envelope).await,
                            Err(e) => warn!(
                                "Dropping malformed envelope from {}: {}",
                                client_id, e
                            ),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        session.heartbeat_alive.store(true, Ordering::Release);
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // The transport answers pings itself
                        debug!("Ping from {}", client_id);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("Ignoring binary frame from {}", client_id);
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Signaling connection closed by {}", client_id);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", client_id, e);
                        break;
                    }
                    None => break,
                }
            }
            _ = session.closed() => {
                info!("Closing signaling connection for {}", client_id);
                break;
            }
        }
    }

    state.teardown_session(&client_id, "transport closed").await;
    send_task.abort();
}

/// Close the session if no offer arrives in time.
fn arm_offer_wait(state: &Arc<SharedState>, session: &Arc<ClientSession>) {
    let wait = state.config.timing.offer_wait();
    let timer_session = session.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        if timer_session.close_requested() {
            return;
        }
        if timer_session.main_pc.lock().await.is_none() {
            warn!(
                "offer_timeout: no offer from {} within {:?}",
                timer_session.client_id, wait
            );
            timer_session.request_close();
        }
    });
    session.arm_timer(TimerKind::OfferWait, handle);
}

/// Ping every interval; a missing pong by the next tick closes the session.
fn arm_heartbeat(state: &Arc<SharedState>, session: &Arc<ClientSession>) {
    let interval = state.config.timing.heartbeat();
    let timer_session = session.clone();
    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if timer_session.close_requested() {
                return;
            }
            if !timer_session.heartbeat_alive.load(Ordering::Acquire) {
                warn!(
                    "Heartbeat lost for {}; closing session",
                    timer_session.client_id
                );
                timer_session.request_close();
                return;
            }
            timer_session.heartbeat_alive.store(false, Ordering::Release);
            timer_session.send_frame(Message::Ping(Vec::new().into()));
        }
    });
    session.arm_timer(TimerKind::Heartbeat, handle);
}

enum SignalTarget {
    Server,
    Peer(String),
}

fn route(to: Option<String>) -> SignalTarget {
    match to {
        None => SignalTarget::Server,
        Some(id) if id == SERVER_CLIENT_ID => SignalTarget::Server,
        Some(id) => SignalTarget::Peer(id),
    }
}

async fn dispatch(
    state: &Arc<SharedState>,
    session: &Arc<ClientSession>,
    envelope: ClientEnvelope,
) {
    match envelope {
        ClientEnvelope::Offer { sdp } => {
            if let Err(e) = main_pc::handle_offer(state, session, &sdp).await {
                warn!("Offer handling failed for {}: {}", session.client_id, e);
                session.request_close();
            }
        }

        ClientEnvelope::IceCandidate { candidate } => {
            main_pc::handle_candidate(session, &candidate).await;
        }

        ClientEnvelope::IceRestartOffer { sdp } => {
            if let Err(e) = main_pc::handle_ice_restart_offer(state, session, &sdp).await {
                warn!(
                    "ICE restart offer failed for {}: {}",
                    session.client_id, e
                );
                session.request_close();
            }
        }

        ClientEnvelope::P2pOffer { to, sdp } => match route(to) {
            SignalTarget::Server => debug!(
                "Ignoring p2p_offer addressed to the server from {}",
                session.client_id
            ),
            SignalTarget::Peer(target) => {
                state
                    .registry
                    .forward_p2p(&session.client_id, &target, P2pSignal::Offer { sdp })
                    .await;
            }
        },

        ClientEnvelope::P2pAnswer { to, sdp } => match route(to) {
            SignalTarget::Server => {
                if let Err(e) = p2p::handle_answer(session, &sdp).await {
                    warn!(
                        "Fan-out answer from {} rejected: {}",
                        session.client_id, e
                    );
                }
            }
            SignalTarget::Peer(target) => {
                state
                    .registry
                    .forward_p2p(&session.client_id, &target, P2pSignal::Answer { sdp })
                    .await;
            }
        },

        ClientEnvelope::P2pIceCandidate { to, candidate } => match route(to) {
            SignalTarget::Server => p2p::handle_candidate(session, &candidate).await,
            SignalTarget::Peer(target) => {
                state
                    .registry
                    .forward_p2p(
                        &session.client_id,
                        &target,
                        P2pSignal::IceCandidate { candidate },
                    )
                    .await;
            }
        },

        ClientEnvelope::PttRequest => state.handle_ptt_request(session).await,

        ClientEnvelope::PttRelease => state.handle_ptt_release(session).await,

        ClientEnvelope::SetDisplayName { display_name } => {
            debug!("{} is now \"{}\"", session.client_id, display_name);
            session.set_display_name(&display_name);
            state.names.record(&session.client_id, &display_name);
        }

        ClientEnvelope::PushSubscribe { subscription } => {
            state.push.subscribe(&session.client_id, subscription);
        }

        ClientEnvelope::RequestP2pReconnect => {
            if let Err(e) = p2p::handle_reconnect_request(state, session).await {
                warn!(
                    "Fan-out reconnect failed for {}: {}",
                    session.client_id, e
                );
            }
        }
    }
}
