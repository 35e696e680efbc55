use nostr::event::Event;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    adapters::nostr::event::NostrEventAdapter,
    features::market::{Market, models::CustomerProfile},
    infra::store::StoreError,
};

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    about: Option<String>,
}

impl From<Metadata> for CustomerProfile {
    fn from(md: Metadata) -> Self {
        Self {
            name: md.name.or(md.display_name),
            about: md.about,
        }
    }
}

impl Market {
    /// Refreshes the cached profile on every customer record with this key.
    pub async fn handle_profile_event(&self, event: &Event) -> Result<(), StoreError> {
        let ev = NostrEventAdapter::new(event);
        let customers = self.store.list_customers_by_pubkey(ev.raw_author()).await?;
        if customers.is_empty() {
            debug!("Profile {} is not from a known customer", ev.raw_id());
            return Ok(());
        }
        let metadata: Metadata = match serde_json::from_str(ev.raw_content()) {
            Ok(md) => md,
            Err(err) => {
                warn!("Profile {} is malformed: {err}", ev.raw_id());
                return Ok(());
            }
        };
        let profile = CustomerProfile::from(metadata);
        let created_at = ev.raw_published_at();

        for customer in customers {
            if customer.event_created_at.is_some_and(|t| t >= created_at) {
                continue;
            }
            self.store
                .update_customer_profile(
                    &customer.merchant_id,
                    &customer.public_key,
                    profile.clone(),
                    created_at,
                )
                .await?;
        }
        Ok(())
    }
}
