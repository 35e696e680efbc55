#![forbid(unsafe_code)]

use nostr::{event::Event, key::PublicKey};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    adapters::nostr::event::NostrEventAdapter,
    features::market::{
        Market,
        models::{Customer, DirectMessage, DmPayload, Merchant},
    },
    infra::{
        nostr::{CodecError, build_direct_message, decrypt_message, nostr_now},
        relay::RelayError,
        store::StoreError,
    },
};

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Event codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Relay unavailable: {0}")]
    Relay(#[from] RelayError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Invalid public key: {0}")]
    InvalidKey(String),

    #[error("Merchant '{0}' not found")]
    MerchantNotFound(String),
}

fn parse_public_key(hex: &str) -> Result<PublicKey, MessageError> {
    PublicKey::from_hex(hex).map_err(|_| MessageError::InvalidKey(hex.to_string()))
}

/// Which merchant an encrypted message belongs to, and in which direction it travels.
struct Routed {
    merchant: Merchant,
    counterparty: String,
    incoming: bool,
}

impl Market {
    async fn route_direct_message(
        &self,
        ev: &NostrEventAdapter<'_>,
    ) -> Result<Option<Routed>, MessageError> {
        if let Some(merchant) = self.store.get_merchant_by_pubkey(ev.raw_author()).await? {
            let Some(counterparty) = ev.tag("p") else {
                return Err(CodecError::MissingPTag(ev.raw_id().to_string()).into());
            };
            return Ok(Some(Routed {
                merchant,
                counterparty,
                incoming: false,
            }));
        }
        for recipient in ev.tags_named("p") {
            if let Some(merchant) = self.store.get_merchant_by_pubkey(&recipient).await? {
                return Ok(Some(Routed {
                    merchant,
                    counterparty: ev.raw_author().to_string(),
                    incoming: true,
                }));
            }
        }
        Ok(None)
    }

    /// Decrypts, classifies and records one kind 4 event; incoming orders are reconciled.
    pub async fn handle_direct_message(&self, event: &Event) -> Result<(), MessageError> {
        let ev = NostrEventAdapter::new(event);
        let Some(routed) = self.route_direct_message(&ev).await? else {
            debug!("Direct message {} is not addressed to a known merchant", ev.raw_id());
            return Ok(());
        };
        let Routed {
            merchant,
            counterparty,
            incoming,
        } = routed;

        let keys = merchant.keys().map_err(CodecError::from)?;
        let counterparty_pk = parse_public_key(&counterparty)?;
        let plaintext = decrypt_message(&keys, &counterparty_pk, ev.raw_content())?;
        let payload = DmPayload::classify(&plaintext);

        let message = DirectMessage {
            id: Uuid::new_v4().to_string(),
            merchant_id: merchant.id.clone(),
            event_id: ev.raw_id().to_string(),
            event_created_at: ev.raw_published_at(),
            message: plaintext,
            public_key: counterparty.clone(),
            incoming,
            type_: payload.message_type(),
            time: nostr_now(),
        };

        if !incoming {
            if self.store.create_direct_message(message).await?.is_none() {
                debug!("Outgoing message {} already recorded", ev.raw_id());
            }
            return Ok(());
        }

        self.ensure_customer(&merchant, &counterparty_pk).await?;
        let Some(message) = self.store.create_direct_message(message).await? else {
            debug!("Direct message {} already recorded", ev.raw_id());
            return Ok(());
        };
        self.store
            .increment_customer_unread(&merchant.id, &counterparty)
            .await?;
        self.notify_message(&merchant, &message);

        if let DmPayload::CustomerOrder(order) = payload {
            if merchant.config.active && !merchant.config.restore_in_progress {
                self.respond_to_customer_order(&merchant, &counterparty, &order, &message)
                    .await;
            } else {
                info!(
                    "Merchant {} is inactive, order {} left for manual processing",
                    merchant.id, order.id
                );
            }
        }
        Ok(())
    }

    /// Encrypts, signs and enqueues a reply, recording it as an outgoing message.
    pub async fn send_dm(
        &self,
        merchant: &Merchant,
        customer_pubkey: &str,
        payload: &DmPayload,
    ) -> Result<DirectMessage, MessageError> {
        let keys = merchant.keys().map_err(CodecError::from)?;
        let recipient = parse_public_key(customer_pubkey)?;
        let body = payload.to_message()?;
        let event = build_direct_message(&keys, &recipient, &body)?;

        let message = DirectMessage {
            id: Uuid::new_v4().to_string(),
            merchant_id: merchant.id.clone(),
            event_id: event.id.to_hex(),
            event_created_at: event.created_at.as_u64(),
            message: body,
            public_key: customer_pubkey.to_string(),
            incoming: false,
            type_: payload.message_type(),
            time: nostr_now(),
        };
        self.store.create_direct_message(message.clone()).await?;
        self.relay.publish(event)?;
        self.notify_message(merchant, &message);
        Ok(message)
    }

    pub async fn send_plain_text(
        &self,
        merchant_id: &str,
        customer_pubkey: &str,
        text: &str,
    ) -> Result<DirectMessage, MessageError> {
        let merchant = self
            .store
            .get_merchant(merchant_id)
            .await?
            .ok_or_else(|| MessageError::MerchantNotFound(merchant_id.to_string()))?;
        self.ensure_customer(&merchant, &parse_public_key(customer_pubkey)?)
            .await?;
        self.send_dm(&merchant, customer_pubkey, &DmPayload::PlainText(text.to_string()))
            .await
    }

    pub async fn mark_read(&self, merchant_id: &str, customer_pubkey: &str) -> Result<(), MessageError> {
        self.store
            .reset_customer_unread(merchant_id, customer_pubkey)
            .await?;
        Ok(())
    }

    /// Creates the customer record on first contact and asks the relay for its profile.
    pub(crate) async fn ensure_customer(
        &self,
        merchant: &Merchant,
        public_key: &PublicKey,
    ) -> Result<(), MessageError> {
        let hex = public_key.to_hex();
        if self.store.get_customer(&merchant.id, &hex).await?.is_some() {
            return Ok(());
        }
        let customer = Customer {
            merchant_id: merchant.id.clone(),
            public_key: hex.clone(),
            event_created_at: None,
            profile: None,
            unread_messages: 0,
        };
        match self.store.create_customer(customer).await {
            Ok(_) => {
                info!("New customer {hex} for merchant {}", merchant.id);
                self.fetch_profile(public_key);
                Ok(())
            }
            Err(StoreError::Conflict { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn notify_message(&self, merchant: &Merchant, message: &DirectMessage) {
        match serde_json::to_value(message) {
            Ok(dm) => self.notifier.notify(
                &merchant.id,
                json!({
                    "type": "dm",
                    "customer_pubkey": message.public_key,
                    "dm": dm,
                }),
            ),
            Err(err) => warn!("Live update for {} dropped: {err}", message.event_id),
        }
    }
}
