use nostr::event::Event;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    adapters::nostr::event::NostrEventAdapter,
    features::market::{
        Market,
        models::{Merchant, Product, ProductConfig, ProductShippingCost, Stall, StallConfig, Zone},
    },
    infra::{
        nostr::{KIND_PRODUCT, KIND_STALL},
        store::StoreError,
    },
};

#[derive(Debug, Deserialize)]
struct ListedZone {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cost: f64,
    #[serde(default)]
    regions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StallListing {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    shipping: Vec<ListedZone>,
}

#[derive(Debug, Deserialize)]
struct ListedShipping {
    id: String,
    #[serde(default)]
    cost: f64,
}

#[derive(Debug, Deserialize)]
struct ProductListing {
    stall_id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    quantity: u64,
    #[serde(default)]
    shipping: Vec<ListedShipping>,
}

/// What to do with a received listing given the local copy.
#[derive(Debug, PartialEq, Eq)]
enum Import {
    Create,
    Refresh,
    Skip(&'static str),
}

fn import_decision(
    local_event_id: Option<&str>,
    local_created_at: Option<u64>,
    local_pending: Option<bool>,
    event_id: &str,
    created_at: u64,
) -> Import {
    match local_pending {
        None => Import::Create,
        Some(_) if local_event_id == Some(event_id) => Import::Skip("own listing echo"),
        Some(false) => Import::Skip("local copy is authoritative"),
        Some(true) if local_created_at.is_some_and(|t| t >= created_at) => {
            Import::Skip("older than pending copy")
        }
        Some(true) => Import::Refresh,
    }
}

impl Market {
    /// Imports stalls and products published under a merchant key but unknown locally.
    pub async fn handle_listing_event(&self, event: &Event) -> Result<(), StoreError> {
        let ev = NostrEventAdapter::new(event);
        let Some(merchant) = self.store.get_merchant_by_pubkey(ev.raw_author()).await? else {
            debug!("Listing {} not authored by a merchant", ev.raw_id());
            return Ok(());
        };
        let Some(entity_id) = ev.tag("d") else {
            warn!("Listing {} has no d tag", ev.raw_id());
            return Ok(());
        };
        match ev.raw_kind() {
            KIND_STALL => self.import_stall(&merchant, &ev, entity_id).await,
            KIND_PRODUCT => self.import_product(&merchant, &ev, entity_id).await,
            _ => Ok(()),
        }
    }

    async fn import_stall(
        &self,
        merchant: &Merchant,
        ev: &NostrEventAdapter<'_>,
        stall_id: String,
    ) -> Result<(), StoreError> {
        let listing: StallListing = match serde_json::from_str(ev.raw_content()) {
            Ok(listing) => listing,
            Err(err) => {
                warn!("Stall listing {} is malformed: {err}", ev.raw_id());
                return Ok(());
            }
        };
        let local = self.store.get_stall(&merchant.id, &stall_id).await?;
        let decision = import_decision(
            local.as_ref().and_then(|s| s.event_id.as_deref()),
            local.as_ref().and_then(|s| s.event_created_at),
            local.as_ref().map(|s| s.pending),
            ev.raw_id(),
            ev.raw_published_at(),
        );
        if let Import::Skip(reason) = decision {
            debug!("Stall listing {} skipped: {reason}", ev.raw_id());
            return Ok(());
        }

        let currency = listing.currency.unwrap_or_else(|| "sat".to_string());
        let stall = Stall {
            id: stall_id,
            merchant_id: merchant.id.clone(),
            wallet: local.map(|s| s.wallet).unwrap_or_default(),
            name: listing.name,
            shipping_zones: listing
                .shipping
                .into_iter()
                .map(|z| Zone {
                    id: z.id,
                    name: z.name,
                    currency: currency.clone(),
                    cost: z.cost,
                    countries: z.regions,
                })
                .collect(),
            currency,
            config: StallConfig {
                image_url: None,
                description: listing.description,
            },
            pending: true,
            event_id: Some(ev.raw_id().to_string()),
            event_created_at: Some(ev.raw_published_at()),
        };
        if decision == Import::Create {
            self.store.create_stall(stall).await?;
        } else {
            self.store.update_stall(stall).await?;
        }
        info!("Imported pending stall from listing {}", ev.raw_id());
        Ok(())
    }

    async fn import_product(
        &self,
        merchant: &Merchant,
        ev: &NostrEventAdapter<'_>,
        product_id: String,
    ) -> Result<(), StoreError> {
        let listing: ProductListing = match serde_json::from_str(ev.raw_content()) {
            Ok(listing) => listing,
            Err(err) => {
                warn!("Product listing {} is malformed: {err}", ev.raw_id());
                return Ok(());
            }
        };
        if self
            .store
            .get_stall(&merchant.id, &listing.stall_id)
            .await?
            .is_none()
        {
            debug!(
                "Product listing {} references unknown stall {}",
                ev.raw_id(),
                listing.stall_id
            );
            return Ok(());
        }
        let local = self.store.get_product(&merchant.id, &product_id).await?;
        let decision = import_decision(
            local.as_ref().and_then(|p| p.event_id.as_deref()),
            local.as_ref().and_then(|p| p.event_created_at),
            local.as_ref().map(|p| p.pending),
            ev.raw_id(),
            ev.raw_published_at(),
        );
        if let Import::Skip(reason) = decision {
            debug!("Product listing {} skipped: {reason}", ev.raw_id());
            return Ok(());
        }

        let product = Product {
            id: product_id,
            stall_id: listing.stall_id,
            name: listing.name,
            categories: ev.tags_named("t"),
            images: listing.images,
            price: listing.price,
            quantity: listing.quantity,
            active: true,
            pending: true,
            config: ProductConfig {
                description: listing.description,
                currency: listing.currency,
                shipping: listing
                    .shipping
                    .into_iter()
                    .map(|s| ProductShippingCost { id: s.id, cost: s.cost })
                    .collect(),
                ..ProductConfig::default()
            },
            event_id: Some(ev.raw_id().to_string()),
            event_created_at: Some(ev.raw_published_at()),
        };
        if decision == Import::Create {
            self.store.create_product(&merchant.id, product).await?;
        } else {
            self.store.update_product(&merchant.id, product).await?;
        }
        info!("Imported pending product from listing {}", ev.raw_id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_entities_are_created() {
        assert_eq!(import_decision(None, None, None, "e1", 10), Import::Create);
    }

    #[test]
    fn echoes_and_claimed_entities_are_skipped() {
        assert!(matches!(
            import_decision(Some("e1"), Some(10), Some(false), "e1", 10),
            Import::Skip(_)
        ));
        assert!(matches!(
            import_decision(Some("e0"), Some(5), Some(false), "e1", 10),
            Import::Skip(_)
        ));
    }

    #[test]
    fn pending_copies_only_move_forward() {
        assert_eq!(
            import_decision(Some("e0"), Some(5), Some(true), "e1", 10),
            Import::Refresh
        );
        assert!(matches!(
            import_decision(Some("e2"), Some(20), Some(true), "e1", 10),
            Import::Skip(_)
        ));
    }
}
