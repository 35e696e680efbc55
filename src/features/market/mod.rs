//! Merchant-side marketplace engine.
//!
//! [`Market`] owns every collaborator the handlers need (store, relay
//! handle, payment rail, exchange rates, live notifier) and is shared as an
//! `Arc` between the relay consumer loop and the payment bridge. Inbound
//! events are dispatched by kind from [`Market::handle_event`].

pub mod catalog;
pub mod inventory;
pub mod listings;
pub mod messages;
pub mod models;
pub mod orders;
pub mod payments;
pub mod planner;
pub mod pricing;
pub mod profiles;
pub mod publisher;
pub mod subscriber;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use nostr::event::Event;
use thiserror::Error;
use tracing::debug;

use crate::{
    config::MarketConfig,
    infra::{
        invoice::InvoiceIssuer,
        nostr::{KIND_ENCRYPTED_DM, KIND_METADATA, KIND_PRODUCT, KIND_STALL},
        notify::LiveNotifier,
        rates::ExchangeRates,
        relay::RelayHandle,
        store::{Store, StoreError},
    },
};

use self::{inventory::InventoryLedger, messages::MessageError, planner::SubscriptionPlanner};

/// Coarse classification for mapping domain errors onto an API surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Unavailable,
}

impl ErrorKind {
    pub fn from_store(err: &StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Conflict { .. } => ErrorKind::Conflict,
            _ => ErrorKind::Unavailable,
        }
    }
}

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("Direct message handling failed: {0}")]
    Message(#[from] MessageError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub struct Market {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) relay: RelayHandle,
    pub(crate) invoices: Arc<dyn InvoiceIssuer>,
    pub(crate) rates: Arc<dyn ExchangeRates>,
    pub(crate) notifier: LiveNotifier,
    pub(crate) ledger: InventoryLedger,
    pub(crate) planner: SubscriptionPlanner,
    pub(crate) config: MarketConfig,
}

impl Market {
    pub fn new(
        store: Arc<dyn Store>,
        relay: RelayHandle,
        invoices: Arc<dyn InvoiceIssuer>,
        rates: Arc<dyn ExchangeRates>,
        notifier: LiveNotifier,
        config: MarketConfig,
    ) -> Self {
        Self {
            store,
            relay,
            invoices,
            rates,
            notifier,
            ledger: InventoryLedger::default(),
            planner: SubscriptionPlanner::default(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn notifier(&self) -> &LiveNotifier {
        &self.notifier
    }

    /// Routes one verified relay event to its handler.
    pub async fn handle_event(&self, event: &Event) -> Result<(), MarketError> {
        match event.kind.as_u16() {
            KIND_METADATA => self.handle_profile_event(event).await?,
            KIND_ENCRYPTED_DM => self.handle_direct_message(event).await?,
            KIND_STALL | KIND_PRODUCT => self.handle_listing_event(event).await?,
            other => debug!("Ignoring event {} of kind {other}", event.id.to_hex()),
        }
        Ok(())
    }
}
