//! Shared state for ptt-core
//!
//! One [`SharedState`] per process: configuration, the client registry, the
//! floor arbiter, and every side-effect sink (relay, recorder, push). Floor
//! orchestration lives here so the grant/release side effects and their
//! ordering guarantees sit in one place.

use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::egress::AudioEgress;
use crate::config::Config;
use crate::floor::{
    is_web_client, FloorArbiter, FloorRelease, FloorRequest, EXTERNAL_CLIENT_ID,
    EXTERNAL_DISPLAY_NAME, SERVER_CLIENT_ID,
};
use crate::names::ClientNames;
use crate::push::PushGateway;
use crate::relay::RelayDriver;
use crate::session::registry::Registry;
use crate::session::ClientSession;
use crate::transport::envelope::{IceServerEntry, ServerEnvelope};
use crate::web::auth::DashSessions;

pub struct SharedState {
    /// Configuration
    pub config: Config,

    /// Connected clients
    pub registry: Registry,

    /// Global floor mutex
    pub floor: FloorArbiter,

    /// Serial relay mirroring web-client floor occupancy
    pub relay: RelayDriver,

    /// Persistent clientId → displayName table
    pub names: ClientNames,

    /// Push subscription table + delivery
    pub push: PushGateway,

    /// Playback + recording sinks
    pub egress: AudioEgress,

    /// Dashboard tokens
    pub dash: DashSessions,

    /// Server start time
    pub start_time: Instant,
}

impl SharedState {
    pub fn new(config: Config) -> Self {
        let floor = FloorArbiter::new(config.floor.max_duration());
        let relay = RelayDriver::open(&config.relay);
        let names = ClientNames::load(config.paths.client_names_file());
        let push = PushGateway::new(config.push.clone());
        let egress = AudioEgress::new(config.audio.clone(), config.timing.clone(), &config.paths);
        let dash = DashSessions::new(config.dash.password.clone());

        Self {
            config,
            registry: Registry::new(),
            floor,
            relay,
            names,
            push,
            egress,
            dash,
            start_time: Instant::now(),
        }
    }

    /// The one-shot `config` envelope sent right after accept.
    pub fn config_envelope(&self, client_id: &str) -> ServerEnvelope {
        ServerEnvelope::Config {
            client_id: client_id.to_string(),
            ice_servers: vec![IceServerEntry {
                urls: vec![self.config.ice.stun_server.clone()],
            }],
            vapid_public_key: self.push.vapid_public_key(),
        }
    }

    /// Display name for any holder id, reserved ids included.
    pub async fn holder_display_name(&self, holder: &str) -> Option<String> {
        match holder {
            EXTERNAL_CLIENT_ID => Some(EXTERNAL_DISPLAY_NAME.to_string()),
            SERVER_CLIENT_ID => Some("Server".to_string()),
            client_id => {
                if let Some(session) = self.registry.get(client_id).await {
                    let name = session.display_name();
                    if !name.is_empty() {
                        return Some(name);
                    }
                }
                self.names.get(client_id)
            }
        }
    }

    /// Current floor state as a `ptt_status` envelope.
    pub async fn floor_status(&self) -> ServerEnvelope {
        match self.floor.holder() {
            Some(holder) => {
                let name = self.holder_display_name(&holder).await;
                ServerEnvelope::status_transmitting(holder, name)
            }
            None => ServerEnvelope::status_idle(),
        }
    }

    /// Broadcast the current floor state to everyone.
    pub async fn broadcast_floor_status(&self) {
        let status = self.floor_status().await;
        self.registry.broadcast(&status, None).await;
    }

    /// `ptt_request` from a web client. The grant reply always reaches the
    /// requester before the status broadcast is enqueued.
    pub async fn handle_ptt_request(self: &Arc<Self>, session: &Arc<ClientSession>) {
        let client_id = session.client_id.clone();
        match self.floor.request(&client_id) {
            FloorRequest::Granted => {
                let display_name = session.display_name();
                if !display_name.is_empty() {
                    self.names.record(&client_id, &display_name);
                }

                self.relay.turn_on();
                self.egress.begin_session(&client_id).await;

                let speaker_name = if display_name.is_empty() {
                    self.names.get(&client_id)
                } else {
                    Some(display_name)
                };

                session.send(&ServerEnvelope::PttGranted {
                    speaker: client_id.clone(),
                    speaker_name: speaker_name.clone(),
                });
                self.broadcast_floor_status().await;

                let push_state = self.clone();
                tokio::spawn(async move {
                    push_state
                        .push
                        .notify_transmit_started(&client_id, speaker_name.as_deref())
                        .await;
                });
            }
            FloorRequest::Busy(holder) => {
                let speaker_name = self.holder_display_name(&holder).await;
                session.send(&ServerEnvelope::PttDenied {
                    speaker: holder,
                    speaker_name,
                });
            }
        }
    }

    /// `ptt_release` from a web client.
    pub async fn handle_ptt_release(&self, session: &Arc<ClientSession>) {
        self.release_floor(&session.client_id).await;
    }

    /// Release the floor on behalf of `holder`, running the web-holder side
    /// effects and broadcasting the refreshed state. Returns false when the
    /// caller did not hold the floor.
    pub async fn release_floor(&self, holder: &str) -> bool {
        if self.floor.release(holder) != FloorRelease::Released {
            return false;
        }
        self.after_release(holder).await;
        self.broadcast_floor_status().await;
        true
    }

    /// External VOX claims the floor. The relay stays off: the external
    /// device is already transmitting.
    pub async fn vox_claim(self: &Arc<Self>) -> Result<(), String> {
        match self.floor.request(EXTERNAL_CLIENT_ID) {
            FloorRequest::Granted => {
                if self.config.audio.enable_server_mic {
                    self.egress.begin_external_session().await;
                }
                self.broadcast_floor_status().await;
                let push_state = self.clone();
                tokio::spawn(async move {
                    push_state
                        .push
                        .notify_transmit_started(EXTERNAL_CLIENT_ID, Some(EXTERNAL_DISPLAY_NAME))
                        .await;
                });
                Ok(())
            }
            FloorRequest::Busy(holder) => {
                let name = self.holder_display_name(&holder).await;
                Err(name.unwrap_or(holder))
            }
        }
    }

    /// External VOX releases the floor.
    pub async fn vox_release(&self) -> bool {
        self.release_floor(EXTERNAL_CLIENT_ID).await
    }

    /// Dashboard override: clear the floor whoever holds it.
    pub async fn force_release_floor(&self) {
        if let Some(holder) = self.floor.force_release() {
            self.after_release(&holder).await;
        }
        self.broadcast_floor_status().await;
    }

    /// One timeout sweep tick.
    pub async fn sweep_floor_timeout(&self) {
        if let Some(evicted) = self.floor.sweep_timeout() {
            warn!("Transmit timeout for {}", evicted);
            self.after_release(&evicted).await;
            self.broadcast_floor_status().await;
        }
    }

    async fn after_release(&self, holder: &str) {
        if is_web_client(holder) {
            self.relay.turn_off();
            self.egress.end_session().await;
        } else if holder == EXTERNAL_CLIENT_ID {
            self.egress.end_session().await;
        }
    }

    /// Full session teardown: floor, timers, peer connections, registry,
    /// departure broadcasts. Idempotent per client id.
    pub async fn teardown_session(&self, client_id: &str, reason: &str) {
        let Some(session) = self.registry.remove(client_id).await else {
            return;
        };
        info!("Tearing down session {} ({})", client_id, reason);

        session.request_close();
        session.bump_generation();
        session.cancel_all_timers();

        self.release_floor(client_id).await;

        if let Some(main) = session.main_pc.lock().await.take() {
            if let Err(e) = main.pc.close().await {
                warn!("Main connection close for {} reported: {}", client_id, e);
            }
        }
        crate::webrtc::p2p::close_for_session(&session).await;

        let display_name = session.display_name();
        self.registry
            .broadcast(
                &ServerEnvelope::ClientLeft {
                    client_id: client_id.to_string(),
                    display_name: (!display_name.is_empty()).then_some(display_name),
                },
                None,
            )
            .await;
        self.broadcast_floor_status().await;
    }

    /// Number of sessions with a connected fan-out leg.
    pub async fn p2p_count(&self) -> usize {
        let mut count = 0;
        for session in self.registry.all().await {
            let connected = session
                .p2p
                .lock()
                .await
                .as_ref()
                .map(|p| p.is_connected())
                .unwrap_or(false);
            if connected {
                count += 1;
            }
        }
        count
    }

    /// Server uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Resident set size in bytes, from /proc. Zero when unavailable.
    pub fn memory_rss_bytes(&self) -> u64 {
        read_rss_kb().map(|kb| kb * 1024).unwrap_or(0)
    }
}

fn read_rss_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            return rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .ok();
        }
    }
    None
}

/// Periodic floor-timeout sweep.
pub fn spawn_floor_sweeper(state: Arc<SharedState>) {
    if state.config.floor.max_duration().is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            state.sweep_floor_timeout().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;

    fn test_state() -> (Arc<SharedState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.paths.recordings_dir = dir.path().join("recordings");
        config.paths.recordings_temp_dir = dir.path().join("recordings_temp");
        config.paths.log_dir = dir.path().join("logs");
        std::fs::create_dir_all(&config.paths.recordings_dir).unwrap();
        (Arc::new(SharedState::new(config)), dir)
    }

    async fn connect(
        state: &Arc<SharedState>,
    ) -> (Arc<ClientSession>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (state.registry.register(tx).await, rx)
    }

    fn drain_text(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let Message::Text(text) = message {
                frames.push(text.to_string());
            }
        }
        frames
    }

    #[tokio::test]
    async fn grant_reply_precedes_status_broadcast() {
        let (state, _dir) = test_state();
        let (a, mut rx_a) = connect(&state).await;
        a.set_display_name("A");

        state.handle_ptt_request(&a).await;

        let frames = drain_text(&mut rx_a);
        let granted = frames
            .iter()
            .position(|f| f.contains(r#""type":"ptt_granted""#))
            .expect("granted reply missing");
        let status = frames
            .iter()
            .position(|f| f.contains(r#""type":"ptt_status""#))
            .expect("status broadcast missing");
        assert!(granted < status);
        assert!(frames[status].contains(r#""state":"transmitting""#));
    }

    #[tokio::test]
    async fn contention_denies_with_holder_name() {
        let (state, _dir) = test_state();
        let (a, _rx_a) = connect(&state).await;
        let (b, mut rx_b) = connect(&state).await;
        a.set_display_name("A");

        state.handle_ptt_request(&a).await;
        drain_text(&mut rx_b);
        state.handle_ptt_request(&b).await;

        let frames = drain_text(&mut rx_b);
        let denied = frames
            .iter()
            .find(|f| f.contains(r#""type":"ptt_denied""#))
            .expect("denied reply missing");
        assert!(denied.contains(&format!(r#""speaker":"{}""#, a.client_id)));
        assert!(denied.contains(r#""speakerName":"A""#));
        assert!(state.floor.is_holder(&a.client_id));
    }

    #[tokio::test]
    async fn release_broadcasts_idle_to_everyone() {
        let (state, _dir) = test_state();
        let (a, mut rx_a) = connect(&state).await;
        let (_b, mut rx_b) = connect(&state).await;

        state.handle_ptt_request(&a).await;
        drain_text(&mut rx_a);
        drain_text(&mut rx_b);

        state.handle_ptt_release(&a).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let frames = drain_text(rx);
            let status = frames
                .iter()
                .find(|f| f.contains(r#""type":"ptt_status""#))
                .expect("idle status missing");
            assert!(status.contains(r#""state":"idle""#));
            assert!(status.contains(r#""speaker":null"#));
        }
        assert_eq!(state.floor.holder(), None);
    }

    #[tokio::test]
    async fn vox_claim_does_not_touch_the_relay() {
        let (state, _dir) = test_state();
        let (_a, mut rx_a) = connect(&state).await;

        state.vox_claim().await.unwrap();
        assert!(!state.relay.is_energized());

        let frames = drain_text(&mut rx_a);
        let status = frames
            .iter()
            .find(|f| f.contains("ptt_status"))
            .expect("status broadcast missing");
        assert!(status.contains(r#""speaker":"external""#));
        assert!(status.contains(EXTERNAL_DISPLAY_NAME));

        assert!(state.vox_claim().await.is_err());
        assert!(state.vox_release().await);
        assert_eq!(state.floor.holder(), None);
    }

    #[tokio::test]
    async fn stale_release_does_not_eject_the_holder() {
        let (state, _dir) = test_state();
        let (a, _rx_a) = connect(&state).await;
        let (b, _rx_b) = connect(&state).await;

        state.handle_ptt_request(&a).await;
        state.handle_ptt_release(&b).await;
        assert!(state.floor.is_holder(&a.client_id));
    }

    #[tokio::test]
    async fn teardown_releases_floor_and_broadcasts_departure() {
        let (state, _dir) = test_state();
        let (a, _rx_a) = connect(&state).await;
        let (_b, mut rx_b) = connect(&state).await;
        a.set_display_name("A");

        state.handle_ptt_request(&a).await;
        drain_text(&mut rx_b);

        state.teardown_session(&a.client_id, "transport closed").await;

        assert_eq!(state.floor.holder(), None);
        assert_eq!(state.registry.count().await, 1);

        let frames = drain_text(&mut rx_b);
        assert!(frames
            .iter()
            .any(|f| f.contains(r#""type":"client_left""#)
                && f.contains(&format!(r#""clientId":"{}""#, a.client_id))));
        assert!(frames
            .iter()
            .any(|f| f.contains("ptt_status") && f.contains(r#""state":"idle""#)));

        // Idempotent
        state.teardown_session(&a.client_id, "again").await;
    }

    #[tokio::test]
    async fn force_release_clears_external_holder() {
        let (state, _dir) = test_state();
        state.vox_claim().await.unwrap();
        state.force_release_floor().await;
        assert_eq!(state.floor.holder(), None);
    }
}
