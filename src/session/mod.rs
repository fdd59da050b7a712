//! Per-client session state
//!
//! One [`ClientSession`] per connected transport. The session owns both
//! peer connections, every timer, and the outbound envelope channel; all
//! mutation funnels through the connection's receive loop or through
//! callbacks that re-validate the session generation first.

pub mod registry;

use axum::extract::ws::Message;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::transport::envelope::ServerEnvelope;
use crate::webrtc::main_pc::MainPeer;
use crate::webrtc::p2p::P2pPeer;

/// Timer slots owned by a session. Re-arming a slot aborts the previous
/// timer; teardown aborts them all before the peer connections close.
#[derive(Default)]
pub struct SessionTimers {
    offer_wait: Option<JoinHandle<()>>,
    ice_restart: Option<JoinHandle<()>>,
    p2p_cleanup: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

/// Which timer slot an arm/cancel call addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    OfferWait,
    IceRestart,
    P2pCleanup,
    Heartbeat,
}

impl SessionTimers {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<JoinHandle<()>> {
        match kind {
            TimerKind::OfferWait => &mut self.offer_wait,
            TimerKind::IceRestart => &mut self.ice_restart,
            TimerKind::P2pCleanup => &mut self.p2p_cleanup,
            TimerKind::Heartbeat => &mut self.heartbeat,
        }
    }
}

/// ICE-restart bookkeeping for the main peer connection.
#[derive(Debug, Default)]
pub struct IceRestartState {
    pub in_progress: bool,
    pub attempts: u32,
    pub success_at: Option<Instant>,
}

/// One connected client.
pub struct ClientSession {
    /// Stable opaque id, unique across live sessions.
    pub client_id: String,

    display_name: RwLock<String>,

    /// Outbound transport frames; the writer task drains this. Sends are
    /// best-effort: a full or closed channel drops the frame.
    outbound: mpsc::UnboundedSender<Message>,

    /// Bumped on teardown; peer-connection callbacks compare against their
    /// captured value and bail when stale.
    generation: AtomicU64,

    /// Heartbeat liveness: false after a ping, true after the pong.
    pub heartbeat_alive: AtomicBool,

    /// Inbound leg (client microphone). None until the first offer.
    pub main_pc: tokio::sync::Mutex<Option<Arc<MainPeer>>>,

    /// Outbound fan-out leg. None until the main PC connects.
    pub p2p: tokio::sync::Mutex<Option<Arc<P2pPeer>>>,

    pub ice_restart: Mutex<IceRestartState>,

    timers: Mutex<SessionTimers>,

    /// Signals the receive loop to exit, funneling every close cause
    /// through one teardown site.
    close_signal: Notify,
    close_requested: AtomicBool,
}

impl ClientSession {
    pub fn new(client_id: String, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            client_id,
            display_name: RwLock::new(String::new()),
            outbound,
            generation: AtomicU64::new(0),
            heartbeat_alive: AtomicBool::new(true),
            main_pc: tokio::sync::Mutex::new(None),
            p2p: tokio::sync::Mutex::new(None),
            ice_restart: Mutex::new(IceRestartState::default()),
            timers: Mutex::new(SessionTimers::default()),
            close_signal: Notify::new(),
            close_requested: AtomicBool::new(false),
        }
    }

    pub fn display_name(&self) -> String {
        self.display_name.read().clone()
    }

    pub fn set_display_name(&self, name: &str) {
        *self.display_name.write() = name.to_string();
    }

    /// Serialize and enqueue an envelope; failures drop the frame.
    pub fn send(&self, envelope: &ServerEnvelope) {
        match envelope.to_json() {
            Ok(json) => self.send_frame(Message::Text(json.into())),
            Err(e) => warn!(
                "Failed to serialize envelope for {}: {}",
                self.client_id, e
            ),
        }
    }

    /// Enqueue a pre-serialized text frame (broadcast path).
    pub fn send_raw(&self, json: String) {
        self.send_frame(Message::Text(json.into()));
    }

    /// Enqueue a raw transport frame (heartbeat pings).
    pub fn send_frame(&self, message: Message) {
        if self.outbound.send(message).is_err() {
            debug!("Dropping frame for closed channel {}", self.client_id);
        }
    }

    /// Current generation, captured by callbacks at wiring time.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// True while `generation` still matches: the session has not begun
    /// teardown since the callback was wired.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Invalidate all wired callbacks.
    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Ask the receive loop to exit; teardown follows there. Idempotent.
    pub fn request_close(&self) {
        if !self.close_requested.swap(true, Ordering::AcqRel) {
            self.close_signal.notify_waiters();
            self.close_signal.notify_one();
        }
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    /// Await a close request (used in the receive loop's select).
    pub async fn closed(&self) {
        if self.close_requested() {
            return;
        }
        self.close_signal.notified().await;
    }

    /// Install a timer, aborting any previous one in the slot.
    pub fn arm_timer(&self, kind: TimerKind, handle: JoinHandle<()>) {
        let mut timers = self.timers.lock();
        if let Some(old) = timers.slot(kind).replace(handle) {
            old.abort();
        }
    }

    /// Abort one timer slot.
    pub fn cancel_timer(&self, kind: TimerKind) {
        let mut timers = self.timers.lock();
        if let Some(handle) = timers.slot(kind).take() {
            handle.abort();
        }
    }

    /// Abort every timer the session owns.
    pub fn cancel_all_timers(&self) {
        for kind in [
            TimerKind::OfferWait,
            TimerKind::IceRestart,
            TimerKind::P2pCleanup,
            TimerKind::Heartbeat,
        ] {
            self.cancel_timer(kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> (Arc<ClientSession>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ClientSession::new("aaaaaaaa".to_string(), tx)), rx)
    }

    #[tokio::test]
    async fn send_serializes_envelopes() {
        let (session, mut rx) = test_session();
        session.send(&ServerEnvelope::status_idle());

        let frame = rx.recv().await.unwrap();
        match frame {
            Message::Text(text) => assert!(text.contains(r#""type":"ptt_status""#)),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_survives_closed_channel() {
        let (session, rx) = test_session();
        drop(rx);
        session.send(&ServerEnvelope::status_idle());
    }

    #[test]
    fn generation_invalidates_old_callbacks() {
        let (session, _rx) = test_session();
        let wired_at = session.generation();
        assert!(session.is_current(wired_at));
        session.bump_generation();
        assert!(!session.is_current(wired_at));
    }

    #[tokio::test]
    async fn request_close_is_idempotent_and_wakes_waiters() {
        let (session, _rx) = test_session();
        session.request_close();
        session.request_close();
        assert!(session.close_requested());
        // Must resolve immediately once requested
        session.closed().await;
    }

    #[tokio::test]
    async fn arming_a_timer_slot_aborts_the_previous_timer() {
        let (session, _rx) = test_session();
        let first = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        session.arm_timer(TimerKind::OfferWait, first);
        let second = tokio::spawn(async {});
        session.arm_timer(TimerKind::OfferWait, second);
        session.cancel_all_timers();
    }
}
