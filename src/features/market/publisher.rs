use nostr::{event::Event, key::Keys};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    features::market::{
        Market,
        models::{Merchant, Product, Stall},
    },
    infra::{
        nostr::{
            CodecError, KIND_DELETION, KIND_METADATA, KIND_PRODUCT, KIND_STALL,
            build_event_with_tags, sign_event,
        },
        relay::RelayError,
        store::StoreError,
    },
};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Event codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Relay unavailable: {0}")]
    Relay(#[from] RelayError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// An entity that can be reflected to the network as a signed event.
pub trait Nostrable {
    fn to_upsert_event(&self, keys: &Keys) -> Result<Event, PublishError>;

    /// Tombstone for the last published event; `None` when nothing was ever published.
    fn to_delete_event(&self, keys: &Keys) -> Result<Option<Event>, PublishError>;
}

fn tombstone(keys: &Keys, event_id: Option<&str>, notice: &str) -> Result<Option<Event>, PublishError> {
    let Some(event_id) = event_id else {
        return Ok(None);
    };
    let builder = build_event_with_tags(
        KIND_DELETION,
        notice,
        vec![vec!["e".into(), event_id.to_string()]],
    );
    Ok(Some(sign_event(builder, keys)?))
}

#[derive(Serialize)]
struct StallShipping<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    cost: f64,
    regions: &'a [String],
}

#[derive(Serialize)]
struct StallContent<'a> {
    id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    currency: &'a str,
    shipping: Vec<StallShipping<'a>>,
}

impl Nostrable for Stall {
    fn to_upsert_event(&self, keys: &Keys) -> Result<Event, PublishError> {
        let content = StallContent {
            id: &self.id,
            name: &self.name,
            description: self.config.description.as_deref(),
            currency: &self.currency,
            shipping: self
                .shipping_zones
                .iter()
                .map(|z| StallShipping {
                    id: &z.id,
                    name: z.name.as_deref(),
                    cost: z.cost,
                    regions: &z.countries,
                })
                .collect(),
        };
        let builder = build_event_with_tags(
            KIND_STALL,
            serde_json::to_string(&content)?,
            vec![vec!["d".into(), self.id.clone()]],
        );
        Ok(sign_event(builder, keys)?)
    }

    fn to_delete_event(&self, keys: &Keys) -> Result<Option<Event>, PublishError> {
        tombstone(keys, self.event_id.as_deref(), &format!("Stall '{}' deleted", self.name))
    }
}

#[derive(Serialize)]
struct ProductShipping<'a> {
    id: &'a str,
    cost: f64,
}

#[derive(Serialize)]
struct ProductContent<'a> {
    id: &'a str,
    stall_id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    images: &'a [String],
    currency: &'a str,
    price: f64,
    quantity: u64,
    shipping: Vec<ProductShipping<'a>>,
}

impl Nostrable for Product {
    fn to_upsert_event(&self, keys: &Keys) -> Result<Event, PublishError> {
        let content = ProductContent {
            id: &self.id,
            stall_id: &self.stall_id,
            name: &self.name,
            description: self.config.description.as_deref(),
            images: &self.images,
            currency: self.config.currency.as_deref().unwrap_or("sat"),
            price: self.price,
            quantity: self.quantity,
            shipping: self
                .config
                .shipping
                .iter()
                .map(|s| ProductShipping {
                    id: &s.id,
                    cost: s.cost,
                })
                .collect(),
        };
        let mut tags = vec![vec!["d".to_string(), self.id.clone()]];
        tags.extend(self.categories.iter().map(|c| vec!["t".to_string(), c.clone()]));
        let builder = build_event_with_tags(KIND_PRODUCT, serde_json::to_string(&content)?, tags);
        Ok(sign_event(builder, keys)?)
    }

    fn to_delete_event(&self, keys: &Keys) -> Result<Option<Event>, PublishError> {
        tombstone(keys, self.event_id.as_deref(), &format!("Product '{}' deleted", self.name))
    }
}

impl Nostrable for Merchant {
    fn to_upsert_event(&self, keys: &Keys) -> Result<Event, PublishError> {
        let builder = build_event_with_tags(
            KIND_METADATA,
            serde_json::to_string(&self.config.profile)?,
            Vec::new(),
        );
        Ok(sign_event(builder, keys)?)
    }

    fn to_delete_event(&self, keys: &Keys) -> Result<Option<Event>, PublishError> {
        tombstone(keys, self.config.event_id.as_deref(), "Merchant profile deleted")
    }
}

impl Market {
    fn merchant_keys(merchant: &Merchant) -> Result<Keys, PublishError> {
        merchant.keys().map_err(|e| PublishError::Codec(CodecError::Key(e)))
    }

    /// Signs and enqueues the upsert. Returns `(event id, created_at)` for the store to record
    /// once the relay queue accepted it.
    fn publish_entity<T: Nostrable>(&self, keys: &Keys, entity: &T) -> Result<(String, u64), PublishError> {
        let event = entity.to_upsert_event(keys)?;
        let published = (event.id.to_hex(), event.created_at.as_u64());
        self.relay.publish(event)?;
        Ok(published)
    }

    fn publish_tombstone<T: Nostrable>(&self, keys: &Keys, entity: &T) -> Result<(), PublishError> {
        if let Some(event) = entity.to_delete_event(keys)? {
            self.relay.publish(event)?;
        }
        Ok(())
    }

    pub async fn publish_stall(&self, merchant: &Merchant, stall: Stall) -> Result<Stall, PublishError> {
        let keys = Self::merchant_keys(merchant)?;
        let (event_id, created_at) = self.publish_entity(&keys, &stall)?;
        let stall = self
            .store
            .record_stall_event(&merchant.id, &stall.id, &event_id, created_at)
            .await?;
        info!("Published stall {} for merchant {}", stall.id, merchant.id);
        Ok(stall)
    }

    /// Publishes the listing as given; only the event id is written back, so stock
    /// changed concurrently in the store is never overwritten.
    pub async fn publish_product(
        &self,
        merchant: &Merchant,
        mut product: Product,
    ) -> Result<Product, PublishError> {
        let keys = Self::merchant_keys(merchant)?;
        if product.config.currency.is_none() {
            // listings without their own currency are priced in the stall's
            product.config.currency = self
                .store
                .get_stall(&merchant.id, &product.stall_id)
                .await?
                .map(|stall| stall.currency);
        }
        let (event_id, created_at) = self.publish_entity(&keys, &product)?;
        let product = self
            .store
            .record_product_event(&merchant.id, &product.id, &event_id, created_at)
            .await?;
        info!("Published product {} for merchant {}", product.id, merchant.id);
        Ok(product)
    }

    pub async fn publish_merchant_profile(&self, merchant: &Merchant) -> Result<Merchant, PublishError> {
        let keys = Self::merchant_keys(merchant)?;
        let (event_id, created_at) = self.publish_entity(&keys, merchant)?;
        let merchant = self
            .store
            .record_merchant_event(&merchant.id, &event_id, created_at)
            .await?;
        info!("Published profile for merchant {}", merchant.id);
        Ok(merchant)
    }

    pub fn unpublish_stall(&self, merchant: &Merchant, stall: &Stall) -> Result<(), PublishError> {
        self.publish_tombstone(&Self::merchant_keys(merchant)?, stall)
    }

    pub fn unpublish_product(&self, merchant: &Merchant, product: &Product) -> Result<(), PublishError> {
        self.publish_tombstone(&Self::merchant_keys(merchant)?, product)
    }

    /// Best-effort republish after a stock change.
    pub async fn republish_products(&self, merchant: &Merchant, products: Vec<Product>) {
        for product in products {
            if product.pending {
                continue;
            }
            let id = product.id.clone();
            if let Err(err) = self.publish_product(merchant, product).await {
                warn!("Failed to republish product {id}: {err}");
            }
        }
    }

    /// Republishes every claimed stall and its products, then the profile.
    pub async fn republish_all(&self, merchant: &Merchant) -> Result<(), PublishError> {
        for stall in self.store.list_stalls(&merchant.id, Some(false)).await? {
            let products = self.store.list_products(&merchant.id, &stall.id).await?;
            self.publish_stall(merchant, stall).await?;
            self.republish_products(merchant, products).await;
        }
        self.publish_merchant_profile(merchant).await?;
        Ok(())
    }

    /// Tombstones the whole catalog tree in publish order.
    pub async fn unpublish_all(&self, merchant: &Merchant) -> Result<(), PublishError> {
        let keys = Self::merchant_keys(merchant)?;
        for stall in self.store.list_stalls(&merchant.id, None).await? {
            self.publish_tombstone(&keys, &stall)?;
            for product in self.store.list_products(&merchant.id, &stall.id).await? {
                self.publish_tombstone(&keys, &product)?;
            }
        }
        self.publish_tombstone(&keys, merchant)
    }
}
