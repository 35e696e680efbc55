use std::time::Duration;

use nostr::{
    filter::Filter,
    key::PublicKey,
    types::Timestamp,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    features::market::{Market, MarketError},
    infra::{
        nostr::{KIND_ENCRYPTED_DM, KIND_METADATA, KIND_PRODUCT, KIND_STALL, nostr_kind},
        relay::{RelayError, RelayHandle},
        store::{Store, StoreError},
    },
};

/// `since` watermarks for each filter family; zero means from the beginning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursors {
    pub messages: u64,
    pub stalls: u64,
    pub products: u64,
    pub profiles: u64,
}

impl Cursors {
    /// Cursors for one merchant: messages resume after the newest order or DM seen.
    pub async fn for_merchant(store: &dyn Store, merchant_id: &str) -> Result<Self, StoreError> {
        let last_order = store.last_order_time(merchant_id).await?;
        let last_dm = store.last_direct_message_time(merchant_id).await?;
        let profiles = store
            .list_customers(merchant_id)
            .await?
            .iter()
            .filter_map(|c| c.event_created_at)
            .max()
            .unwrap_or(0);
        Ok(Self {
            messages: last_order.max(last_dm),
            stalls: store.last_stall_update_time(merchant_id).await?,
            products: store.last_product_update_time(merchant_id).await?,
            profiles,
        })
    }

    /// Merges per-merchant cursors into one filter set without skipping any merchant's gap.
    pub fn combine(all: &[Cursors]) -> Self {
        fn lowest(values: impl Iterator<Item = u64>) -> u64 {
            values.min().unwrap_or(0)
        }
        Self {
            messages: lowest(all.iter().map(|c| c.messages)),
            stalls: lowest(all.iter().map(|c| c.stalls)),
            products: lowest(all.iter().map(|c| c.products)),
            profiles: lowest(all.iter().map(|c| c.profiles)),
        }
    }
}

fn with_since(filter: Filter, since: u64) -> Filter {
    if since == 0 {
        filter
    } else {
        filter.since(Timestamp::from(since))
    }
}

/// Filter set for one merchant cohort.
pub fn plan_filters(merchants: &[PublicKey], customers: &[PublicKey], cursors: &Cursors) -> Vec<Filter> {
    if merchants.is_empty() {
        return Vec::new();
    }
    let dm = nostr_kind(KIND_ENCRYPTED_DM);
    let mut filters = vec![
        with_since(
            Filter::new().kind(dm).pubkeys(merchants.iter().copied()),
            cursors.messages,
        ),
        with_since(
            Filter::new().kind(dm).authors(merchants.iter().copied()),
            cursors.messages,
        ),
        with_since(
            Filter::new()
                .kind(nostr_kind(KIND_STALL))
                .authors(merchants.iter().copied()),
            cursors.stalls,
        ),
        with_since(
            Filter::new()
                .kind(nostr_kind(KIND_PRODUCT))
                .authors(merchants.iter().copied()),
            cursors.products,
        ),
    ];
    if !customers.is_empty() {
        filters.push(with_since(
            Filter::new()
                .kind(nostr_kind(KIND_METADATA))
                .authors(customers.iter().copied()),
            cursors.profiles,
        ));
    }
    filters
}

#[derive(Debug)]
struct ActiveSubscription {
    id: String,
    cohort: Vec<String>,
}

/// Tracks the single long-lived subscription and the cohort it was built for.
#[derive(Debug, Default)]
pub struct SubscriptionPlanner {
    active: Mutex<Option<ActiveSubscription>>,
}

impl SubscriptionPlanner {
    pub async fn current_id(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|a| a.id.clone())
    }

    /// Closes the current subscription, if any, and issues the new one under a fresh id.
    async fn replace(
        &self,
        relay: &RelayHandle,
        cohort: Vec<String>,
        filters: Vec<Filter>,
        force: bool,
    ) -> Result<Option<String>, RelayError> {
        let mut active = self.active.lock().await;
        if !force && active.as_ref().is_some_and(|a| a.cohort == cohort) {
            return Ok(None);
        }
        if let Some(previous) = active.take() {
            relay.unsubscribe(previous.id)?;
        }
        if filters.is_empty() {
            return Ok(None);
        }
        let id = Uuid::new_v4().simple().to_string();
        relay.subscribe(id.clone(), filters)?;
        *active = Some(ActiveSubscription {
            id: id.clone(),
            cohort,
        });
        Ok(Some(id))
    }

    /// Sends `CLOSE` for the current subscription and forgets it.
    pub async fn close(&self, relay: &RelayHandle) -> Result<(), RelayError> {
        if let Some(previous) = self.active.lock().await.take() {
            relay.unsubscribe(previous.id)?;
        }
        Ok(())
    }
}

/// Subscription that closes itself after `lifetime`.
pub fn subscribe_temporary(
    relay: &RelayHandle,
    filters: Vec<Filter>,
    lifetime: Duration,
) -> Result<String, RelayError> {
    let id = Uuid::new_v4().simple().to_string();
    relay.subscribe(id.clone(), filters)?;

    let relay = relay.clone();
    let expiring = id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(lifetime).await;
        if let Err(err) = relay.unsubscribe(expiring.clone()) {
            debug!("Temporary subscription {expiring} not closed: {err}");
        }
    });
    Ok(id)
}

impl Market {
    /// Re-issues the cohort subscription when the set of merchant keys changed, or always when `force`.
    pub async fn sync_subscription(&self, force: bool) -> Result<Option<String>, MarketError> {
        let merchants = self.store.list_merchants().await?;

        let mut cohort = Vec::with_capacity(merchants.len());
        let mut merchant_keys = Vec::with_capacity(merchants.len());
        let mut customer_keys: Vec<PublicKey> = Vec::new();
        let mut cursors = Vec::with_capacity(merchants.len());

        for merchant in &merchants {
            let Ok(pk) = PublicKey::from_hex(&merchant.public_key) else {
                warn!("Merchant {} has an invalid public key", merchant.id);
                continue;
            };
            cohort.push(merchant.public_key.clone());
            merchant_keys.push(pk);
            cursors.push(Cursors::for_merchant(self.store.as_ref(), &merchant.id).await?);
            for customer in self.store.list_customers(&merchant.id).await? {
                if let Ok(pk) = PublicKey::from_hex(&customer.public_key) {
                    if !customer_keys.contains(&pk) {
                        customer_keys.push(pk);
                    }
                }
            }
        }
        cohort.sort();

        let filters = plan_filters(&merchant_keys, &customer_keys, &Cursors::combine(&cursors));
        let id = self
            .planner
            .replace(&self.relay, cohort, filters, force)
            .await
            .map_err(|err| {
                warn!("Subscription not sent: {err}");
                err
            })
            .ok()
            .flatten();
        if let Some(id) = &id {
            info!("Subscribed {} merchant(s) as {id}", merchant_keys.len());
        }
        Ok(id)
    }

    /// Closes the cohort subscription ahead of shutdown.
    pub async fn close_subscription(&self) {
        if let Err(err) = self.planner.close(&self.relay).await {
            warn!("Failed to close subscription: {err}");
        }
    }

    /// One-shot fetch of a counterparty's profile.
    pub(crate) fn fetch_profile(&self, public_key: &PublicKey) {
        let filter = Filter::new()
            .kind(nostr_kind(KIND_METADATA))
            .authors([*public_key])
            .limit(1);
        if let Err(err) = subscribe_temporary(&self.relay, vec![filter], self.config.profile_fetch()) {
            warn!("Profile fetch for {} not sent: {err}", public_key.to_hex());
        }
    }
}
