//! Signaling envelope schema
//!
//! One JSON object per WebSocket text frame. Field and tag names are
//! wire-exact; the browser client depends on them.

use serde::{Deserialize, Serialize};

/// Trickle ICE candidate payload, as produced by the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// One entry of the advertised ICE server list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerEntry {
    pub urls: Vec<String>,
}

/// Registry roster entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
}

/// Browser push subscription descriptor, stored opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: PushSubscriptionKeys,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Floor state as broadcast in `ptt_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PttState {
    Idle,
    Transmitting,
}

/// Server → client envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// First frame after accept.
    Config {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "iceServers")]
        ice_servers: Vec<IceServerEntry>,
        #[serde(rename = "vapidPublicKey", skip_serializing_if = "Option::is_none")]
        vapid_public_key: Option<String>,
    },

    /// Response to the main `offer`.
    Answer { sdp: String },

    /// Trickle candidate for the main PC.
    #[serde(rename = "ice-candidate")]
    IceCandidate { candidate: IceCandidatePayload },

    /// Server asks the client to restart main ICE.
    RequestIceRestart,

    /// Response to `ice_restart_offer`.
    IceRestartAnswer { sdp: String },

    /// Server-originated or peer-relayed P2P offer.
    P2pOffer { from: String, sdp: String },

    P2pAnswer { from: String, sdp: String },

    P2pIceCandidate {
        from: String,
        candidate: IceCandidatePayload,
    },

    /// Sent once the main PC reaches `connected`.
    ClientList { clients: Vec<ClientInfo> },

    ClientJoined {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },

    ClientLeft {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },

    /// Reply to the requester; sent before the matching status broadcast.
    PttGranted {
        speaker: String,
        #[serde(rename = "speakerName", skip_serializing_if = "Option::is_none")]
        speaker_name: Option<String>,
    },

    PttDenied {
        speaker: String,
        #[serde(rename = "speakerName", skip_serializing_if = "Option::is_none")]
        speaker_name: Option<String>,
    },

    /// Broadcast to all clients after every floor transition.
    PttStatus {
        state: PttState,
        speaker: Option<String>,
        #[serde(rename = "speakerName")]
        speaker_name: Option<String>,
    },
}

/// Client → server envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// First SDP offer for the main PC.
    Offer { sdp: String },

    #[serde(rename = "ice-candidate")]
    IceCandidate { candidate: IceCandidatePayload },

    /// Fresh-credential offer in response to `request_ice_restart`.
    IceRestartOffer { sdp: String },

    /// P2P signaling; `to` routes to a peer, absent/`"server"` targets the
    /// server's fan-out connection.
    P2pOffer {
        #[serde(default)]
        to: Option<String>,
        sdp: String,
    },

    P2pAnswer {
        #[serde(default)]
        to: Option<String>,
        sdp: String,
    },

    P2pIceCandidate {
        #[serde(default)]
        to: Option<String>,
        candidate: IceCandidatePayload,
    },

    PttRequest,

    PttRelease,

    SetDisplayName {
        #[serde(rename = "displayName")]
        display_name: String,
    },

    PushSubscribe { subscription: PushSubscription },

    /// Ask the server to rebuild this client's P2P connection.
    RequestP2pReconnect,
}

impl ServerEnvelope {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// `ptt_status` for an idle floor.
    pub fn status_idle() -> Self {
        ServerEnvelope::PttStatus {
            state: PttState::Idle,
            speaker: None,
            speaker_name: None,
        }
    }

    /// `ptt_status` for an occupied floor.
    pub fn status_transmitting(speaker: String, speaker_name: Option<String>) -> Self {
        ServerEnvelope::PttStatus {
            state: PttState::Transmitting,
            speaker: Some(speaker),
            speaker_name,
        }
    }
}

impl ClientEnvelope {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_envelope_wire_format() {
        let envelope = ServerEnvelope::Config {
            client_id: "aaaaaaaa".to_string(),
            ice_servers: vec![IceServerEntry {
                urls: vec!["stun:stun.example.com:3478".to_string()],
            }],
            vapid_public_key: None,
        };
        let json = envelope.to_json().unwrap();
        assert!(json.contains(r#""type":"config""#));
        assert!(json.contains(r#""clientId":"aaaaaaaa""#));
        assert!(json.contains(r#""iceServers""#));
        assert!(!json.contains("vapidPublicKey"));
    }

    #[test]
    fn ice_candidate_tag_is_hyphenated() {
        let envelope = ServerEnvelope::IceCandidate {
            candidate: IceCandidatePayload {
                candidate: "candidate:0 1 UDP 1 192.0.2.1 5000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
        };
        let json = envelope.to_json().unwrap();
        assert!(json.contains(r#""type":"ice-candidate""#));
        assert!(json.contains(r#""sdpMid":"0""#));
        assert!(json.contains(r#""sdpMLineIndex":0"#));

        let parsed = ClientEnvelope::from_json(&json).unwrap();
        assert!(matches!(parsed, ClientEnvelope::IceCandidate { .. }));
    }

    #[test]
    fn ptt_status_idle_has_null_speaker() {
        let json = ServerEnvelope::status_idle().to_json().unwrap();
        assert!(json.contains(r#""state":"idle""#));
        assert!(json.contains(r#""speaker":null"#));
    }

    #[test]
    fn ptt_status_transmitting_carries_speaker() {
        let json =
            ServerEnvelope::status_transmitting("aaaaaaaa".to_string(), Some("A".to_string()))
                .to_json()
                .unwrap();
        assert!(json.contains(r#""state":"transmitting""#));
        assert!(json.contains(r#""speaker":"aaaaaaaa""#));
        assert!(json.contains(r#""speakerName":"A""#));
    }

    #[test]
    fn parses_client_requests() {
        let req = ClientEnvelope::from_json(r#"{"type":"ptt_request"}"#).unwrap();
        assert!(matches!(req, ClientEnvelope::PttRequest));

        let rename =
            ClientEnvelope::from_json(r#"{"type":"set_display_name","displayName":"A"}"#).unwrap();
        match rename {
            ClientEnvelope::SetDisplayName { display_name } => assert_eq!(display_name, "A"),
            other => panic!("Expected SetDisplayName, got {:?}", other),
        }

        let p2p = ClientEnvelope::from_json(
            r#"{"type":"p2p_answer","to":"server","sdp":"v=0\r\n"}"#,
        )
        .unwrap();
        match p2p {
            ClientEnvelope::P2pAnswer { to, sdp } => {
                assert_eq!(to.as_deref(), Some("server"));
                assert!(sdp.starts_with("v=0"));
            }
            other => panic!("Expected P2pAnswer, got {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(ClientEnvelope::from_json(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn push_subscribe_round_trip() {
        let json = r#"{"type":"push_subscribe","subscription":{"endpoint":"https://push.example/x","keys":{"p256dh":"pk","auth":"ak"}}}"#;
        let parsed = ClientEnvelope::from_json(json).unwrap();
        match parsed {
            ClientEnvelope::PushSubscribe { subscription } => {
                assert_eq!(subscription.endpoint, "https://push.example/x");
                assert_eq!(subscription.keys.auth, "ak");
            }
            other => panic!("Expected PushSubscribe, got {:?}", other),
        }
    }
}
