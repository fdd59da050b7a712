//! Web push notifications
//!
//! Browser push subscriptions keyed by client id. The table outlives the
//! session (a subscribed browser gets speaker notifications while its tab is
//! closed) and is pruned only when the push gateway reports the endpoint
//! gone. Delivery needs a configured VAPID key pair; without one the table
//! still accepts subscriptions.

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use web_push::{
    ContentEncoding, IsahcWebPushClient, SubscriptionInfo, VapidSignatureBuilder, WebPushClient,
    WebPushError, WebPushMessageBuilder, URL_SAFE_NO_PAD,
};

use crate::config::PushConfig;
use crate::transport::envelope::PushSubscription;

pub struct PushGateway {
    config: PushConfig,
    subscriptions: Mutex<HashMap<String, PushSubscription>>,
}

impl PushGateway {
    pub fn new(config: PushConfig) -> Self {
        Self {
            config,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Advertised in the config envelope so the browser can subscribe.
    pub fn vapid_public_key(&self) -> Option<String> {
        self.config.vapid_public_key.clone()
    }

    /// Store (or replace) a client's subscription.
    pub fn subscribe(&self, client_id: &str, subscription: PushSubscription) {
        debug!("Stored push subscription for {}", client_id);
        self.subscriptions
            .lock()
            .insert(client_id.to_string(), subscription);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Notify every subscriber except the speaker that a transmission
    /// started. Endpoints the gateway reports gone are pruned.
    pub async fn notify_transmit_started(
        &self,
        speaker: &str,
        speaker_name: Option<&str>,
    ) {
        if !self.config.delivery_enabled() {
            return;
        }

        let targets: Vec<(String, PushSubscription)> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|(id, _)| id.as_str() != speaker)
            .map(|(id, sub)| (id.clone(), sub.clone()))
            .collect();
        if targets.is_empty() {
            return;
        }

        let payload = json!({
            "type": "ptt",
            "speaker": speaker,
            "speakerName": speaker_name,
        })
        .to_string();

        let client = match IsahcWebPushClient::new() {
            Ok(client) => client,
            Err(e) => {
                warn!("Push client unavailable: {}", e);
                return;
            }
        };

        let mut gone = Vec::new();
        for (client_id, subscription) in targets {
            match self.deliver(&client, &subscription, &payload).await {
                Ok(()) => {}
                Err(WebPushError::EndpointNotValid) | Err(WebPushError::EndpointNotFound) => {
                    info!("Pruning gone push endpoint for {}", client_id);
                    gone.push(client_id);
                }
                Err(e) => debug!("Push delivery to {} failed: {}", client_id, e),
            }
        }

        if !gone.is_empty() {
            let mut subscriptions = self.subscriptions.lock();
            for client_id in gone {
                subscriptions.remove(&client_id);
            }
        }
    }

    async fn deliver(
        &self,
        client: &IsahcWebPushClient,
        subscription: &PushSubscription,
        payload: &str,
    ) -> Result<(), WebPushError> {
        let Some(private_key) = self.config.vapid_private_key.as_deref() else {
            return Ok(());
        };

        let info = SubscriptionInfo::new(
            subscription.endpoint.clone(),
            subscription.keys.p256dh.clone(),
            subscription.keys.auth.clone(),
        );

        let mut signature = VapidSignatureBuilder::from_base64(private_key, URL_SAFE_NO_PAD, &info)?;
        if let Some(subject) = self.config.vapid_subject.as_deref() {
            signature.add_claim("sub", subject);
        }

        let mut builder = WebPushMessageBuilder::new(&info);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload.as_bytes());
        builder.set_vapid_signature(signature.build()?);

        client.send(builder.build()?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::envelope::PushSubscriptionKeys;

    fn subscription(endpoint: &str) -> PushSubscription {
        PushSubscription {
            endpoint: endpoint.to_string(),
            keys: PushSubscriptionKeys {
                p256dh: "pk".to_string(),
                auth: "ak".to_string(),
            },
        }
    }

    #[test]
    fn subscriptions_replace_per_client() {
        let gateway = PushGateway::new(PushConfig::default());
        gateway.subscribe("aaaaaaaa", subscription("https://push.example/1"));
        gateway.subscribe("aaaaaaaa", subscription("https://push.example/2"));
        gateway.subscribe("bbbbbbbb", subscription("https://push.example/3"));
        assert_eq!(gateway.subscription_count(), 2);
    }

    #[tokio::test]
    async fn notify_without_vapid_keys_is_a_no_op() {
        let gateway = PushGateway::new(PushConfig::default());
        gateway.subscribe("aaaaaaaa", subscription("https://push.example/1"));
        gateway.notify_transmit_started("bbbbbbbb", Some("B")).await;
        assert_eq!(gateway.subscription_count(), 1);
    }
}
