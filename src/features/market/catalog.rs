use nostr::key::Keys;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    features::market::{
        ErrorKind, Market,
        models::{Merchant, MerchantConfig, MerchantProfile, Product, Stall, Zone},
        publisher::PublishError,
    },
    infra::{nostr::nostr_now, store::StoreError},
};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Merchant '{0}' not found")]
    MerchantNotFound(String),

    #[error("Stall '{0}' not found")]
    StallNotFound(String),

    #[error("Product '{0}' not found")]
    ProductNotFound(String),

    #[error("Shipping zone '{0}' not found")]
    ZoneNotFound(String),

    #[error("Invalid private key")]
    InvalidKey(#[from] nostr::key::Error),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),
}

impl CatalogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CatalogError::MerchantNotFound(_)
            | CatalogError::StallNotFound(_)
            | CatalogError::ProductNotFound(_)
            | CatalogError::ZoneNotFound(_) => ErrorKind::NotFound,
            CatalogError::InvalidKey(_) | CatalogError::Invalid { .. } => ErrorKind::Validation,
            CatalogError::Store(err) => ErrorKind::from_store(err),
            CatalogError::Publish(_) => ErrorKind::Unavailable,
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> CatalogError {
    CatalogError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn ensure_id(id: &mut String) {
    if id.trim().is_empty() {
        *id = Uuid::new_v4().simple().to_string();
    }
}

fn negative(amount: f64) -> bool {
    amount.is_nan() || amount < 0.0
}

fn validate_zone(zone: &Zone) -> Result<(), CatalogError> {
    if zone.currency.trim().is_empty() {
        return Err(invalid("currency", "shipping zone needs a currency"));
    }
    if negative(zone.cost) {
        return Err(invalid("cost", "shipping cost must not be negative"));
    }
    Ok(())
}

fn validate_product(product: &Product) -> Result<(), CatalogError> {
    if product.name.trim().is_empty() {
        return Err(invalid("name", "product needs a name"));
    }
    if negative(product.price) {
        return Err(invalid("price", "price must not be negative"));
    }
    if product.config.shipping.iter().any(|s| negative(s.cost)) {
        return Err(invalid("shipping", "surcharge must not be negative"));
    }
    Ok(())
}

impl Market {
    async fn merchant(&self, merchant_id: &str) -> Result<Merchant, CatalogError> {
        self.store
            .get_merchant(merchant_id)
            .await?
            .ok_or_else(|| CatalogError::MerchantNotFound(merchant_id.to_string()))
    }

    async fn resubscribe_quietly(&self) {
        if let Err(err) = self.sync_subscription(false).await {
            warn!("Subscription not refreshed: {err}");
        }
    }

    /// Registers a merchant from its private key; an already known key returns the stored merchant.
    pub async fn register_merchant(
        &self,
        private_key: &str,
        profile: MerchantProfile,
        active: bool,
    ) -> Result<Merchant, CatalogError> {
        let keys = Keys::parse(private_key)?;
        let public_key = keys.public_key().to_hex();
        if let Some(existing) = self.store.get_merchant_by_pubkey(&public_key).await? {
            return Ok(existing);
        }
        let merchant = Merchant {
            id: Uuid::new_v4().simple().to_string(),
            private_key: keys.secret_key().to_secret_hex(),
            public_key,
            config: MerchantConfig {
                profile,
                active,
                ..MerchantConfig::default()
            },
            time: Some(nostr_now()),
        };
        let merchant = self.store.create_merchant(merchant).await?;
        info!("Registered merchant {} ({})", merchant.id, merchant.public_key);
        self.resubscribe_quietly().await;
        Ok(merchant)
    }

    pub async fn update_merchant_profile(
        &self,
        merchant_id: &str,
        profile: MerchantProfile,
    ) -> Result<Merchant, CatalogError> {
        let mut merchant = self.merchant(merchant_id).await?;
        merchant.config.profile = profile;
        let merchant = self.store.update_merchant(merchant).await?;
        match self.publish_merchant_profile(&merchant).await {
            Ok(published) => Ok(published),
            Err(err) => {
                warn!("Profile for merchant {merchant_id} not published: {err}");
                Ok(merchant)
            }
        }
    }

    /// Records merchant liveness.
    pub async fn touch_merchant(&self, merchant_id: &str) -> Result<Merchant, CatalogError> {
        let mut merchant = self.merchant(merchant_id).await?;
        merchant.time = Some(nostr_now());
        Ok(self.store.update_merchant(merchant).await?)
    }

    pub async fn set_merchant_active(&self, merchant_id: &str, active: bool) -> Result<Merchant, CatalogError> {
        let mut merchant = self.merchant(merchant_id).await?;
        merchant.config.active = active;
        let merchant = self.store.update_merchant(merchant).await?;
        info!("Merchant {merchant_id} active: {active}");
        Ok(merchant)
    }

    /// Tombstones the published catalog, then removes the merchant and everything it owns.
    pub async fn delete_merchant(&self, merchant_id: &str) -> Result<(), CatalogError> {
        let merchant = self.merchant(merchant_id).await?;
        if let Err(err) = self.unpublish_all(&merchant).await {
            warn!("Tombstones for merchant {merchant_id} not sent: {err}");
        }
        self.store.delete_merchant(merchant_id).await?;
        info!("Deleted merchant {merchant_id}");
        self.resubscribe_quietly().await;
        Ok(())
    }

    pub async fn create_zone(&self, merchant_id: &str, mut zone: Zone) -> Result<Zone, CatalogError> {
        self.merchant(merchant_id).await?;
        validate_zone(&zone)?;
        ensure_id(&mut zone.id);
        Ok(self.store.create_zone(merchant_id, zone).await?)
    }

    /// Updates the zone and republishes every stall that ships to it.
    pub async fn update_zone(&self, merchant_id: &str, zone: Zone) -> Result<Zone, CatalogError> {
        let merchant = self.merchant(merchant_id).await?;
        validate_zone(&zone)?;
        if self.store.get_zone(merchant_id, &zone.id).await?.is_none() {
            return Err(CatalogError::ZoneNotFound(zone.id));
        }
        let zone = self.store.update_zone(merchant_id, zone).await?;

        for mut stall in self.store.list_stalls(merchant_id, Some(false)).await? {
            let Some(slot) = stall.shipping_zones.iter_mut().find(|z| z.id == zone.id) else {
                continue;
            };
            *slot = zone.clone();
            let stall = self.store.update_stall(stall).await?;
            let stall_id = stall.id.clone();
            if let Err(err) = self.publish_stall(&merchant, stall).await {
                warn!("Stall {stall_id} not republished: {err}");
            }
        }
        Ok(zone)
    }

    pub async fn delete_zone(&self, merchant_id: &str, zone_id: &str) -> Result<(), CatalogError> {
        if self.store.get_zone(merchant_id, zone_id).await?.is_none() {
            return Err(CatalogError::ZoneNotFound(zone_id.to_string()));
        }
        Ok(self.store.delete_zone(merchant_id, zone_id).await?)
    }

    /// Replaces the stall's zone list with the stored copies of the referenced zones.
    async fn resolve_stall_zones(&self, merchant_id: &str, stall: &mut Stall) -> Result<(), CatalogError> {
        let mut zones = Vec::with_capacity(stall.shipping_zones.len());
        for zone in &stall.shipping_zones {
            let stored = self
                .store
                .get_zone(merchant_id, &zone.id)
                .await?
                .ok_or_else(|| CatalogError::ZoneNotFound(zone.id.clone()))?;
            zones.push(stored);
        }
        stall.shipping_zones = zones;
        Ok(())
    }

    async fn publish_stall_or_warn(&self, merchant: &Merchant, stall: Stall) -> Stall {
        let fallback = stall.clone();
        match self.publish_stall(merchant, stall).await {
            Ok(stall) => stall,
            Err(err) => {
                warn!("Stall {} not published: {err}", fallback.id);
                fallback
            }
        }
    }

    async fn publish_product_or_warn(&self, merchant: &Merchant, product: Product) -> Product {
        let fallback = product.clone();
        match self.publish_product(merchant, product).await {
            Ok(product) => product,
            Err(err) => {
                warn!("Product {} not published: {err}", fallback.id);
                fallback
            }
        }
    }

    pub async fn create_stall(&self, merchant_id: &str, mut stall: Stall) -> Result<Stall, CatalogError> {
        let merchant = self.merchant(merchant_id).await?;
        if stall.name.trim().is_empty() {
            return Err(invalid("name", "stall needs a name"));
        }
        if stall.wallet.trim().is_empty() {
            return Err(invalid("wallet", "stall needs a wallet"));
        }
        ensure_id(&mut stall.id);
        stall.merchant_id = merchant.id.clone();
        stall.pending = false;
        self.resolve_stall_zones(merchant_id, &mut stall).await?;

        let stall = self.store.create_stall(stall).await?;
        Ok(self.publish_stall_or_warn(&merchant, stall).await)
    }

    pub async fn update_stall(&self, merchant_id: &str, mut stall: Stall) -> Result<Stall, CatalogError> {
        let merchant = self.merchant(merchant_id).await?;
        let current = self
            .store
            .get_stall(merchant_id, &stall.id)
            .await?
            .ok_or_else(|| CatalogError::StallNotFound(stall.id.clone()))?;
        stall.merchant_id = merchant.id.clone();
        stall.pending = false;
        stall.event_id = current.event_id;
        stall.event_created_at = current.event_created_at;
        self.resolve_stall_zones(merchant_id, &mut stall).await?;

        let stall = self.store.update_stall(stall).await?;
        Ok(self.publish_stall_or_warn(&merchant, stall).await)
    }

    /// Tombstones the stall and its products before removing them.
    pub async fn delete_stall(&self, merchant_id: &str, stall_id: &str) -> Result<(), CatalogError> {
        let merchant = self.merchant(merchant_id).await?;
        let stall = self
            .store
            .get_stall(merchant_id, stall_id)
            .await?
            .ok_or_else(|| CatalogError::StallNotFound(stall_id.to_string()))?;
        for product in self.store.list_products(merchant_id, stall_id).await? {
            if let Err(err) = self.unpublish_product(&merchant, &product) {
                warn!("Tombstone for product {} not sent: {err}", product.id);
            }
        }
        if let Err(err) = self.unpublish_stall(&merchant, &stall) {
            warn!("Tombstone for stall {stall_id} not sent: {err}");
        }
        Ok(self.store.delete_stall(merchant_id, stall_id).await?)
    }

    pub async fn create_product(&self, merchant_id: &str, mut product: Product) -> Result<Product, CatalogError> {
        let merchant = self.merchant(merchant_id).await?;
        validate_product(&product)?;
        let stall = self
            .store
            .get_stall(merchant_id, &product.stall_id)
            .await?
            .ok_or_else(|| CatalogError::StallNotFound(product.stall_id.clone()))?;
        ensure_id(&mut product.id);
        if product.config.currency.is_none() {
            product.config.currency = Some(stall.currency.clone());
        }
        product.pending = false;

        let product = self.store.create_product(merchant_id, product).await?;
        Ok(self.publish_product_or_warn(&merchant, product).await)
    }

    pub async fn update_product(&self, merchant_id: &str, mut product: Product) -> Result<Product, CatalogError> {
        let merchant = self.merchant(merchant_id).await?;
        validate_product(&product)?;
        let current = self
            .store
            .get_product(merchant_id, &product.id)
            .await?
            .ok_or_else(|| CatalogError::ProductNotFound(product.id.clone()))?;
        if self.store.get_stall(merchant_id, &product.stall_id).await?.is_none() {
            return Err(CatalogError::StallNotFound(product.stall_id));
        }
        product.pending = false;
        product.event_id = current.event_id;
        product.event_created_at = current.event_created_at;
        if product.config.currency.is_none() {
            product.config.currency = current.config.currency;
        }

        // the merchant's stock figure replaces the stored one, so order reservations wait
        let _guard = self.ledger.lock(merchant_id).await;
        let product = self.store.update_product(merchant_id, product).await?;
        Ok(self.publish_product_or_warn(&merchant, product).await)
    }

    pub async fn delete_product(&self, merchant_id: &str, product_id: &str) -> Result<(), CatalogError> {
        let merchant = self.merchant(merchant_id).await?;
        let product = self
            .store
            .get_product(merchant_id, product_id)
            .await?
            .ok_or_else(|| CatalogError::ProductNotFound(product_id.to_string()))?;
        if let Err(err) = self.unpublish_product(&merchant, &product) {
            warn!("Tombstone for product {product_id} not sent: {err}");
        }
        Ok(self.store.delete_product(merchant_id, product_id).await?)
    }
}
