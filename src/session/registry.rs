//! Client registry
//!
//! Owns the clientId → session map, mints ids, and provides the broadcast
//! primitives. Also the home of the stateless P2P signaling relay: envelopes
//! addressed to another client are rewritten with the sender's id and
//! delivered by target lookup.

use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::ClientSession;
use crate::transport::envelope::{ClientInfo, IceCandidatePayload, ServerEnvelope};

/// Target of a relayed P2P signaling envelope.
pub enum P2pSignal {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidatePayload },
}

pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Mint a fresh client id and register the session under it. Ids are 8
    /// lowercase hex chars; collisions against live sessions re-roll.
    pub async fn register(
        &self,
        outbound: tokio::sync::mpsc::UnboundedSender<axum::extract::ws::Message>,
    ) -> Arc<ClientSession> {
        let mut sessions = self.sessions.write().await;
        let client_id = loop {
            let candidate = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let session = Arc::new(ClientSession::new(client_id.clone(), outbound));
        sessions.insert(client_id.clone(), session.clone());
        info!("Registered client {} ({} online)", client_id, sessions.len());
        session
    }

    /// Remove and return a session. Idempotent.
    pub async fn remove(&self, client_id: &str) -> Option<Arc<ClientSession>> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.remove(client_id);
        if session.is_some() {
            info!("Removed client {} ({} online)", client_id, sessions.len());
        }
        session
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().await.get(client_id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Send one envelope to one client. Returns false for unknown targets.
    pub async fn send_to(&self, client_id: &str, envelope: &ServerEnvelope) -> bool {
        match self.get(client_id).await {
            Some(session) => {
                session.send(envelope);
                true
            }
            None => false,
        }
    }

    /// Serialize once and fan out to every session except `except`.
    pub async fn broadcast(&self, envelope: &ServerEnvelope, except: Option<&str>) {
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                debug!("Failed to serialize broadcast envelope: {}", e);
                return;
            }
        };

        for session in self.sessions.read().await.values() {
            if Some(session.client_id.as_str()) == except {
                continue;
            }
            session.send_raw(json.clone());
        }
    }

    /// Roster for the `client_list` envelope.
    pub async fn client_list(&self) -> Vec<ClientInfo> {
        self.sessions
            .read()
            .await
            .values()
            .map(|session| ClientInfo {
                client_id: session.client_id.clone(),
                display_name: session.display_name(),
            })
            .collect()
    }

    /// Relay a P2P signaling envelope between two clients: substitute
    /// `from` with the sender's id, preserve the payload, drop unknown
    /// targets. No queueing, no retry.
    pub async fn forward_p2p(&self, from: &str, to: &str, signal: P2pSignal) {
        let envelope = match signal {
            P2pSignal::Offer { sdp } => ServerEnvelope::P2pOffer {
                from: from.to_string(),
                sdp,
            },
            P2pSignal::Answer { sdp } => ServerEnvelope::P2pAnswer {
                from: from.to_string(),
                sdp,
            },
            P2pSignal::IceCandidate { candidate } => ServerEnvelope::P2pIceCandidate {
                from: from.to_string(),
                candidate,
            },
        };

        if !self.send_to(to, &envelope).await {
            debug!("Dropping P2P signal from {} to unknown client {}", from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;

    async fn register_one(
        registry: &Registry,
    ) -> (Arc<ClientSession>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.register(tx).await, rx)
    }

    fn frame_text(message: Message) -> String {
        match message {
            Message::Text(text) => text.to_string(),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn minted_ids_are_unique_short_hex() {
        let registry = Registry::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..32 {
            let (session, _rx) = register_one(&registry).await;
            assert_eq!(session.client_id.len(), 8);
            assert!(session
                .client_id
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
            assert!(seen.insert(session.client_id.clone()));
        }
        assert_eq!(registry.count().await, 32);
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_session() {
        let registry = Registry::new();
        let (a, mut rx_a) = register_one(&registry).await;
        let (_b, mut rx_b) = register_one(&registry).await;

        registry
            .broadcast(&ServerEnvelope::status_idle(), Some(&a.client_id))
            .await;

        assert!(rx_a.try_recv().is_err());
        let frame = frame_text(rx_b.try_recv().unwrap());
        assert!(frame.contains("ptt_status"));
    }

    #[tokio::test]
    async fn forward_p2p_substitutes_sender_id() {
        let registry = Registry::new();
        let (a, _rx_a) = register_one(&registry).await;
        let (b, mut rx_b) = register_one(&registry).await;

        registry
            .forward_p2p(
                &a.client_id,
                &b.client_id,
                P2pSignal::Offer {
                    sdp: "v=0\r\n".to_string(),
                },
            )
            .await;

        let frame = frame_text(rx_b.try_recv().unwrap());
        assert!(frame.contains(r#""type":"p2p_offer""#));
        assert!(frame.contains(&format!(r#""from":"{}""#, a.client_id)));
    }

    #[tokio::test]
    async fn forward_p2p_drops_unknown_target() {
        let registry = Registry::new();
        let (a, _rx_a) = register_one(&registry).await;
        registry
            .forward_p2p(
                &a.client_id,
                "deadbeef",
                P2pSignal::Answer {
                    sdp: "v=0\r\n".to_string(),
                },
            )
            .await;
    }

    #[tokio::test]
    async fn client_list_reflects_display_names() {
        let registry = Registry::new();
        let (a, _rx_a) = register_one(&registry).await;
        let (b, _rx_b) = register_one(&registry).await;
        a.set_display_name("A");

        let list = registry.client_list().await;
        assert_eq!(list.len(), 2);
        let entry_a = list
            .iter()
            .find(|c| c.client_id == a.client_id)
            .expect("A missing from roster");
        assert_eq!(entry_a.display_name, "A");
        let entry_b = list
            .iter()
            .find(|c| c.client_id == b.client_id)
            .expect("B missing from roster");
        assert_eq!(entry_b.display_name, "");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = Registry::new();
        let (a, _rx_a) = register_one(&registry).await;
        assert!(registry.remove(&a.client_id).await.is_some());
        assert!(registry.remove(&a.client_id).await.is_none());
        assert_eq!(registry.count().await, 0);
    }
}
