//! Persistent store boundary.
//!
//! Every read and write of marketplace state goes through [`Store`]; the
//! store is the single source of truth, nothing above it caches entities.
//! Uniqueness of orders (per merchant id and per originating event id) and
//! direct messages (per merchant event id) is enforced here so idempotent
//! replay holds even when two writers race.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::features::market::models::{
    Customer, CustomerProfile, DirectMessage, Merchant, Order, Product, Stall, Zone,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} '{id}' already exists")]
    Conflict { entity: &'static str, id: String },

    #[error("Snapshot IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Failed to persist snapshot: {0}")]
    Persist(#[from] tempfile::PersistError),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn conflict(entity: &'static str, id: impl Into<String>) -> Self {
        Self::Conflict {
            entity,
            id: id.into(),
        }
    }
}

/// Partial order update applied in one write.
#[derive(Debug, Clone, Default)]
pub struct OrderPatch {
    pub paid: Option<bool>,
    pub shipped: Option<bool>,
    pub stall_id: Option<String>,
    pub invoice_id: Option<String>,
    pub shipping_id: Option<String>,
    pub total: Option<u64>,
    pub extra: Option<crate::features::market::models::OrderExtra>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // merchants
    async fn create_merchant(&self, merchant: Merchant) -> Result<Merchant, StoreError>;
    async fn update_merchant(&self, merchant: Merchant) -> Result<Merchant, StoreError>;
    async fn get_merchant(&self, merchant_id: &str) -> Result<Option<Merchant>, StoreError>;
    async fn get_merchant_by_pubkey(&self, public_key: &str)
    -> Result<Option<Merchant>, StoreError>;
    async fn list_merchants(&self) -> Result<Vec<Merchant>, StoreError>;
    /// Records the published profile event; other merchant fields are left as stored.
    async fn record_merchant_event(
        &self,
        merchant_id: &str,
        event_id: &str,
        event_created_at: u64,
    ) -> Result<Merchant, StoreError>;
    /// Removes the merchant and everything it owns.
    async fn delete_merchant(&self, merchant_id: &str) -> Result<(), StoreError>;

    // shipping zones
    async fn create_zone(&self, merchant_id: &str, zone: Zone) -> Result<Zone, StoreError>;
    async fn update_zone(&self, merchant_id: &str, zone: Zone) -> Result<Zone, StoreError>;
    async fn get_zone(&self, merchant_id: &str, zone_id: &str) -> Result<Option<Zone>, StoreError>;
    async fn list_zones(&self, merchant_id: &str) -> Result<Vec<Zone>, StoreError>;
    async fn delete_zone(&self, merchant_id: &str, zone_id: &str) -> Result<(), StoreError>;

    // stalls
    async fn create_stall(&self, stall: Stall) -> Result<Stall, StoreError>;
    async fn update_stall(&self, stall: Stall) -> Result<Stall, StoreError>;
    async fn get_stall(&self, merchant_id: &str, stall_id: &str)
    -> Result<Option<Stall>, StoreError>;
    async fn list_stalls(
        &self,
        merchant_id: &str,
        pending: Option<bool>,
    ) -> Result<Vec<Stall>, StoreError>;
    async fn record_stall_event(
        &self,
        merchant_id: &str,
        stall_id: &str,
        event_id: &str,
        event_created_at: u64,
    ) -> Result<Stall, StoreError>;
    /// Deletes the stall and its products.
    async fn delete_stall(&self, merchant_id: &str, stall_id: &str) -> Result<(), StoreError>;
    async fn last_stall_update_time(&self, merchant_id: &str) -> Result<u64, StoreError>;

    // products
    async fn create_product(&self, merchant_id: &str, product: Product)
    -> Result<Product, StoreError>;
    async fn update_product(&self, merchant_id: &str, product: Product)
    -> Result<Product, StoreError>;
    async fn get_product(
        &self,
        merchant_id: &str,
        product_id: &str,
    ) -> Result<Option<Product>, StoreError>;
    async fn get_products_by_ids(
        &self,
        merchant_id: &str,
        product_ids: &[String],
    ) -> Result<Vec<Product>, StoreError>;
    async fn list_products(
        &self,
        merchant_id: &str,
        stall_id: &str,
    ) -> Result<Vec<Product>, StoreError>;
    /// Records the published listing event without touching stock or catalog fields.
    async fn record_product_event(
        &self,
        merchant_id: &str,
        product_id: &str,
        event_id: &str,
        event_created_at: u64,
    ) -> Result<Product, StoreError>;
    /// Writes all quantities in one step; fails without writing if any id is unknown.
    async fn update_product_quantities(
        &self,
        merchant_id: &str,
        quantities: &[(String, u64)],
    ) -> Result<Vec<Product>, StoreError>;
    async fn delete_product(&self, merchant_id: &str, product_id: &str) -> Result<(), StoreError>;
    async fn last_product_update_time(&self, merchant_id: &str) -> Result<u64, StoreError>;

    // orders
    /// Fails with `Conflict` when the order id or event id is already recorded.
    async fn create_order(&self, order: Order) -> Result<Order, StoreError>;
    /// Overwrites an existing order row (same merchant and id).
    async fn replace_order(&self, order: Order) -> Result<Order, StoreError>;
    async fn get_order(&self, merchant_id: &str, order_id: &str) -> Result<Option<Order>, StoreError>;
    async fn get_order_by_event_id(
        &self,
        merchant_id: &str,
        event_id: &str,
    ) -> Result<Option<Order>, StoreError>;
    async fn list_orders(&self, merchant_id: &str) -> Result<Vec<Order>, StoreError>;
    async fn list_unpaid_orders(&self) -> Result<Vec<Order>, StoreError>;
    async fn update_order(
        &self,
        merchant_id: &str,
        order_id: &str,
        patch: OrderPatch,
    ) -> Result<Order, StoreError>;
    async fn last_order_time(&self, merchant_id: &str) -> Result<u64, StoreError>;

    // direct messages
    /// Returns `None` when a message with the same event id is already stored.
    async fn create_direct_message(
        &self,
        message: DirectMessage,
    ) -> Result<Option<DirectMessage>, StoreError>;
    async fn list_direct_messages(
        &self,
        merchant_id: &str,
        public_key: &str,
    ) -> Result<Vec<DirectMessage>, StoreError>;
    /// Order-related messages in arrival order.
    async fn list_order_messages(&self, merchant_id: &str)
    -> Result<Vec<DirectMessage>, StoreError>;
    async fn last_direct_message_time(&self, merchant_id: &str) -> Result<u64, StoreError>;

    // customers
    async fn create_customer(&self, customer: Customer) -> Result<Customer, StoreError>;
    async fn get_customer(
        &self,
        merchant_id: &str,
        public_key: &str,
    ) -> Result<Option<Customer>, StoreError>;
    async fn list_customers(&self, merchant_id: &str) -> Result<Vec<Customer>, StoreError>;
    async fn list_customers_by_pubkey(&self, public_key: &str) -> Result<Vec<Customer>, StoreError>;
    async fn update_customer_profile(
        &self,
        merchant_id: &str,
        public_key: &str,
        profile: CustomerProfile,
        event_created_at: u64,
    ) -> Result<(), StoreError>;
    async fn increment_customer_unread(
        &self,
        merchant_id: &str,
        public_key: &str,
    ) -> Result<(), StoreError>;
    async fn reset_customer_unread(&self, merchant_id: &str, public_key: &str)
    -> Result<(), StoreError>;
}
