use std::{
    fs::{self, File},
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::{sync::RwLock, task};
use tracing::info;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use super::{OrderPatch, Store, StoreError};
use crate::features::market::models::{
    Customer, CustomerProfile, DirectMessage, Merchant, Order, Product, Stall, Zone,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ZoneRow {
    merchant_id: String,
    zone: Zone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProductRow {
    merchant_id: String,
    product: Product,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    merchants: Vec<Merchant>,
    #[serde(default)]
    zones: Vec<ZoneRow>,
    #[serde(default)]
    stalls: Vec<Stall>,
    #[serde(default)]
    products: Vec<ProductRow>,
    #[serde(default)]
    orders: Vec<Order>,
    /// Kept in arrival order.
    #[serde(default)]
    direct_messages: Vec<DirectMessage>,
    #[serde(default)]
    customers: Vec<Customer>,
}

/// In-memory [`Store`], optionally mirrored to a JSON snapshot on disk.
///
/// The snapshot holds merchant private keys, so it is written with owner-only
/// permissions through a temp file that is synced and renamed into place.
/// A mutation only becomes visible once its snapshot reached the disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Snapshot>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let snapshot: Snapshot = serde_json::from_reader(reader)?;
            info!(
                "Loaded store snapshot from {} ({} merchants)",
                path.display(),
                snapshot.merchants.len()
            );
            snapshot
        } else {
            Snapshot::default()
        };
        Ok(Self {
            inner: RwLock::new(snapshot),
            path: Some(path),
        })
    }

    /// Applies `change` to a copy of the state, persists the copy, then swaps it in.
    async fn commit<T, F>(&self, change: F) -> Result<T, StoreError>
    where
        T: Send,
        F: FnOnce(&mut Snapshot) -> Result<T, StoreError> + Send,
    {
        let mut current = self.inner.write().await;
        let mut next = current.clone();
        let out = change(&mut next)?;
        if let Some(path) = self.path.clone() {
            let json = serde_json::to_vec(&next)?;
            // the write guard stays held so snapshots land on disk in commit order
            task::spawn_blocking(move || write_snapshot(&path, &json))
                .await
                .map_err(|err| StoreError::Io(std::io::Error::other(err)))??;
        }
        *current = next;
        Ok(out)
    }
}

fn write_snapshot(path: &Path, json: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(json)?;
    temp_file.as_file_mut().sync_all()?;

    #[cfg(unix)]
    {
        fs::set_permissions(temp_file.path(), fs::Permissions::from_mode(0o600))?;
    }

    temp_file.persist(path)?;
    Ok(())
}

fn merchant_owns_stall(snapshot: &Snapshot, merchant_id: &str, stall_id: &str) -> bool {
    snapshot
        .stalls
        .iter()
        .any(|s| s.id == stall_id && s.merchant_id == merchant_id)
}

fn find_customer<'a>(
    snapshot: &'a mut Snapshot,
    merchant_id: &str,
    public_key: &str,
) -> Result<&'a mut Customer, StoreError> {
    snapshot
        .customers
        .iter_mut()
        .find(|c| c.merchant_id == merchant_id && c.public_key == public_key)
        .ok_or_else(|| StoreError::not_found("customer", public_key))
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_merchant(&self, merchant: Merchant) -> Result<Merchant, StoreError> {
        self.commit(move |snapshot| {
            if snapshot
                .merchants
                .iter()
                .any(|m| m.id == merchant.id || m.public_key == merchant.public_key)
            {
                return Err(StoreError::conflict("merchant", merchant.id));
            }
            snapshot.merchants.push(merchant.clone());
            Ok(merchant)
        })
        .await
    }

    async fn update_merchant(&self, merchant: Merchant) -> Result<Merchant, StoreError> {
        self.commit(move |snapshot| {
            let slot = snapshot
                .merchants
                .iter_mut()
                .find(|m| m.id == merchant.id)
                .ok_or_else(|| StoreError::not_found("merchant", &merchant.id))?;
            *slot = merchant.clone();
            Ok(merchant)
        })
        .await
    }

    async fn get_merchant(&self, merchant_id: &str) -> Result<Option<Merchant>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot.merchants.iter().find(|m| m.id == merchant_id).cloned())
    }

    async fn get_merchant_by_pubkey(
        &self,
        public_key: &str,
    ) -> Result<Option<Merchant>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .merchants
            .iter()
            .find(|m| m.public_key == public_key)
            .cloned())
    }

    async fn list_merchants(&self) -> Result<Vec<Merchant>, StoreError> {
        Ok(self.inner.read().await.merchants.clone())
    }

    async fn record_merchant_event(
        &self,
        merchant_id: &str,
        event_id: &str,
        event_created_at: u64,
    ) -> Result<Merchant, StoreError> {
        self.commit(|snapshot| {
            let merchant = snapshot
                .merchants
                .iter_mut()
                .find(|m| m.id == merchant_id)
                .ok_or_else(|| StoreError::not_found("merchant", merchant_id))?;
            merchant.config.event_id = Some(event_id.to_string());
            merchant.config.event_created_at = Some(event_created_at);
            Ok(merchant.clone())
        })
        .await
    }

    async fn delete_merchant(&self, merchant_id: &str) -> Result<(), StoreError> {
        self.commit(|snapshot| {
            snapshot.merchants.retain(|m| m.id != merchant_id);
            snapshot.zones.retain(|z| z.merchant_id != merchant_id);
            snapshot.stalls.retain(|s| s.merchant_id != merchant_id);
            snapshot.products.retain(|p| p.merchant_id != merchant_id);
            snapshot.orders.retain(|o| o.merchant_id != merchant_id);
            snapshot.direct_messages.retain(|d| d.merchant_id != merchant_id);
            snapshot.customers.retain(|c| c.merchant_id != merchant_id);
            Ok(())
        })
        .await
    }

    async fn create_zone(&self, merchant_id: &str, zone: Zone) -> Result<Zone, StoreError> {
        self.commit(move |snapshot| {
            if snapshot
                .zones
                .iter()
                .any(|z| z.merchant_id == merchant_id && z.zone.id == zone.id)
            {
                return Err(StoreError::conflict("zone", zone.id));
            }
            snapshot.zones.push(ZoneRow {
                merchant_id: merchant_id.to_string(),
                zone: zone.clone(),
            });
            Ok(zone)
        })
        .await
    }

    async fn update_zone(&self, merchant_id: &str, zone: Zone) -> Result<Zone, StoreError> {
        self.commit(move |snapshot| {
            let row = snapshot
                .zones
                .iter_mut()
                .find(|z| z.merchant_id == merchant_id && z.zone.id == zone.id)
                .ok_or_else(|| StoreError::not_found("zone", &zone.id))?;
            row.zone = zone.clone();
            Ok(zone)
        })
        .await
    }

    async fn get_zone(&self, merchant_id: &str, zone_id: &str) -> Result<Option<Zone>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .zones
            .iter()
            .find(|z| z.merchant_id == merchant_id && z.zone.id == zone_id)
            .map(|z| z.zone.clone()))
    }

    async fn list_zones(&self, merchant_id: &str) -> Result<Vec<Zone>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .zones
            .iter()
            .filter(|z| z.merchant_id == merchant_id)
            .map(|z| z.zone.clone())
            .collect())
    }

    async fn delete_zone(&self, merchant_id: &str, zone_id: &str) -> Result<(), StoreError> {
        self.commit(|snapshot| {
            snapshot
                .zones
                .retain(|z| !(z.merchant_id == merchant_id && z.zone.id == zone_id));
            Ok(())
        })
        .await
    }

    async fn create_stall(&self, stall: Stall) -> Result<Stall, StoreError> {
        self.commit(move |snapshot| {
            if snapshot.stalls.iter().any(|s| s.id == stall.id) {
                return Err(StoreError::conflict("stall", stall.id));
            }
            snapshot.stalls.push(stall.clone());
            Ok(stall)
        })
        .await
    }

    async fn update_stall(&self, stall: Stall) -> Result<Stall, StoreError> {
        self.commit(move |snapshot| {
            let slot = snapshot
                .stalls
                .iter_mut()
                .find(|s| s.id == stall.id && s.merchant_id == stall.merchant_id)
                .ok_or_else(|| StoreError::not_found("stall", &stall.id))?;
            *slot = stall.clone();
            Ok(stall)
        })
        .await
    }

    async fn get_stall(
        &self,
        merchant_id: &str,
        stall_id: &str,
    ) -> Result<Option<Stall>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .stalls
            .iter()
            .find(|s| s.id == stall_id && s.merchant_id == merchant_id)
            .cloned())
    }

    async fn list_stalls(
        &self,
        merchant_id: &str,
        pending: Option<bool>,
    ) -> Result<Vec<Stall>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .stalls
            .iter()
            .filter(|s| s.merchant_id == merchant_id)
            .filter(|s| pending.is_none_or(|p| s.pending == p))
            .cloned()
            .collect())
    }

    async fn record_stall_event(
        &self,
        merchant_id: &str,
        stall_id: &str,
        event_id: &str,
        event_created_at: u64,
    ) -> Result<Stall, StoreError> {
        self.commit(|snapshot| {
            let stall = snapshot
                .stalls
                .iter_mut()
                .find(|s| s.id == stall_id && s.merchant_id == merchant_id)
                .ok_or_else(|| StoreError::not_found("stall", stall_id))?;
            stall.event_id = Some(event_id.to_string());
            stall.event_created_at = Some(event_created_at);
            Ok(stall.clone())
        })
        .await
    }

    async fn delete_stall(&self, merchant_id: &str, stall_id: &str) -> Result<(), StoreError> {
        self.commit(|snapshot| {
            snapshot
                .products
                .retain(|p| !(p.merchant_id == merchant_id && p.product.stall_id == stall_id));
            snapshot
                .stalls
                .retain(|s| !(s.merchant_id == merchant_id && s.id == stall_id));
            Ok(())
        })
        .await
    }

    async fn last_stall_update_time(&self, merchant_id: &str) -> Result<u64, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .stalls
            .iter()
            .filter(|s| s.merchant_id == merchant_id)
            .filter_map(|s| s.event_created_at)
            .max()
            .unwrap_or(0))
    }

    async fn create_product(
        &self,
        merchant_id: &str,
        product: Product,
    ) -> Result<Product, StoreError> {
        self.commit(move |snapshot| {
            if !merchant_owns_stall(snapshot, merchant_id, &product.stall_id) {
                return Err(StoreError::not_found("stall", &product.stall_id));
            }
            if snapshot.products.iter().any(|p| p.product.id == product.id) {
                return Err(StoreError::conflict("product", product.id));
            }
            snapshot.products.push(ProductRow {
                merchant_id: merchant_id.to_string(),
                product: product.clone(),
            });
            Ok(product)
        })
        .await
    }

    async fn update_product(
        &self,
        merchant_id: &str,
        product: Product,
    ) -> Result<Product, StoreError> {
        self.commit(move |snapshot| {
            if !merchant_owns_stall(snapshot, merchant_id, &product.stall_id) {
                return Err(StoreError::not_found("stall", &product.stall_id));
            }
            let row = snapshot
                .products
                .iter_mut()
                .find(|p| p.merchant_id == merchant_id && p.product.id == product.id)
                .ok_or_else(|| StoreError::not_found("product", &product.id))?;
            row.product = product.clone();
            Ok(product)
        })
        .await
    }

    async fn get_product(
        &self,
        merchant_id: &str,
        product_id: &str,
    ) -> Result<Option<Product>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .products
            .iter()
            .find(|p| p.merchant_id == merchant_id && p.product.id == product_id)
            .map(|p| p.product.clone()))
    }

    async fn get_products_by_ids(
        &self,
        merchant_id: &str,
        product_ids: &[String],
    ) -> Result<Vec<Product>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .products
            .iter()
            .filter(|p| p.merchant_id == merchant_id && product_ids.contains(&p.product.id))
            .map(|p| p.product.clone())
            .collect())
    }

    async fn list_products(
        &self,
        merchant_id: &str,
        stall_id: &str,
    ) -> Result<Vec<Product>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .products
            .iter()
            .filter(|p| p.merchant_id == merchant_id && p.product.stall_id == stall_id)
            .map(|p| p.product.clone())
            .collect())
    }

    async fn record_product_event(
        &self,
        merchant_id: &str,
        product_id: &str,
        event_id: &str,
        event_created_at: u64,
    ) -> Result<Product, StoreError> {
        self.commit(|snapshot| {
            let row = snapshot
                .products
                .iter_mut()
                .find(|p| p.merchant_id == merchant_id && p.product.id == product_id)
                .ok_or_else(|| StoreError::not_found("product", product_id))?;
            row.product.event_id = Some(event_id.to_string());
            row.product.event_created_at = Some(event_created_at);
            Ok(row.product.clone())
        })
        .await
    }

    async fn update_product_quantities(
        &self,
        merchant_id: &str,
        quantities: &[(String, u64)],
    ) -> Result<Vec<Product>, StoreError> {
        self.commit(|snapshot| {
            let mut updated = Vec::with_capacity(quantities.len());
            for (product_id, quantity) in quantities {
                let row = snapshot
                    .products
                    .iter_mut()
                    .find(|p| p.merchant_id == merchant_id && &p.product.id == product_id)
                    .ok_or_else(|| StoreError::not_found("product", product_id))?;
                row.product.quantity = *quantity;
                updated.push(row.product.clone());
            }
            Ok(updated)
        })
        .await
    }

    async fn delete_product(&self, merchant_id: &str, product_id: &str) -> Result<(), StoreError> {
        self.commit(|snapshot| {
            snapshot
                .products
                .retain(|p| !(p.merchant_id == merchant_id && p.product.id == product_id));
            Ok(())
        })
        .await
    }

    async fn last_product_update_time(&self, merchant_id: &str) -> Result<u64, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .products
            .iter()
            .filter(|p| p.merchant_id == merchant_id)
            .filter_map(|p| p.product.event_created_at)
            .max()
            .unwrap_or(0))
    }

    async fn create_order(&self, order: Order) -> Result<Order, StoreError> {
        self.commit(move |snapshot| {
            let duplicate = snapshot.orders.iter().any(|o| {
                o.merchant_id == order.merchant_id
                    && (o.id == order.id
                        || (order.event_id.is_some() && o.event_id == order.event_id))
            });
            if duplicate {
                return Err(StoreError::conflict("order", order.id));
            }
            snapshot.orders.push(order.clone());
            Ok(order)
        })
        .await
    }

    async fn replace_order(&self, order: Order) -> Result<Order, StoreError> {
        self.commit(move |snapshot| {
            let slot = snapshot
                .orders
                .iter_mut()
                .find(|o| o.merchant_id == order.merchant_id && o.id == order.id)
                .ok_or_else(|| StoreError::not_found("order", &order.id))?;
            *slot = order.clone();
            Ok(order)
        })
        .await
    }

    async fn get_order(&self, merchant_id: &str, order_id: &str) -> Result<Option<Order>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .orders
            .iter()
            .find(|o| o.merchant_id == merchant_id && o.id == order_id)
            .cloned())
    }

    async fn get_order_by_event_id(
        &self,
        merchant_id: &str,
        event_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .orders
            .iter()
            .find(|o| o.merchant_id == merchant_id && o.event_id.as_deref() == Some(event_id))
            .cloned())
    }

    async fn list_orders(&self, merchant_id: &str) -> Result<Vec<Order>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .orders
            .iter()
            .filter(|o| o.merchant_id == merchant_id)
            .cloned()
            .collect())
    }

    async fn list_unpaid_orders(&self) -> Result<Vec<Order>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .orders
            .iter()
            .filter(|o| !o.paid && o.invoice_id.is_some())
            .cloned()
            .collect())
    }

    async fn update_order(
        &self,
        merchant_id: &str,
        order_id: &str,
        patch: OrderPatch,
    ) -> Result<Order, StoreError> {
        self.commit(move |snapshot| {
            let order = snapshot
                .orders
                .iter_mut()
                .find(|o| o.merchant_id == merchant_id && o.id == order_id)
                .ok_or_else(|| StoreError::not_found("order", order_id))?;
            if let Some(paid) = patch.paid {
                order.paid = paid;
            }
            if let Some(shipped) = patch.shipped {
                order.shipped = shipped;
            }
            if let Some(stall_id) = patch.stall_id {
                order.stall_id = Some(stall_id);
            }
            if let Some(invoice_id) = patch.invoice_id {
                order.invoice_id = Some(invoice_id);
            }
            if let Some(shipping_id) = patch.shipping_id {
                order.shipping_id = shipping_id;
            }
            if let Some(total) = patch.total {
                order.total = total;
            }
            if let Some(extra) = patch.extra {
                order.extra = extra;
            }
            Ok(order.clone())
        })
        .await
    }

    async fn last_order_time(&self, merchant_id: &str) -> Result<u64, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .orders
            .iter()
            .filter(|o| o.merchant_id == merchant_id)
            .filter_map(|o| o.event_created_at)
            .max()
            .unwrap_or(0))
    }

    async fn create_direct_message(
        &self,
        message: DirectMessage,
    ) -> Result<Option<DirectMessage>, StoreError> {
        self.commit(move |snapshot| {
            if snapshot
                .direct_messages
                .iter()
                .any(|d| d.merchant_id == message.merchant_id && d.event_id == message.event_id)
            {
                return Ok(None);
            }
            snapshot.direct_messages.push(message.clone());
            Ok(Some(message))
        })
        .await
    }

    async fn list_direct_messages(
        &self,
        merchant_id: &str,
        public_key: &str,
    ) -> Result<Vec<DirectMessage>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .direct_messages
            .iter()
            .filter(|d| d.merchant_id == merchant_id && d.public_key == public_key)
            .cloned()
            .collect())
    }

    async fn list_order_messages(
        &self,
        merchant_id: &str,
    ) -> Result<Vec<DirectMessage>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .direct_messages
            .iter()
            .filter(|d| d.merchant_id == merchant_id && d.type_.is_order_related())
            .cloned()
            .collect())
    }

    async fn last_direct_message_time(&self, merchant_id: &str) -> Result<u64, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .direct_messages
            .iter()
            .filter(|d| d.merchant_id == merchant_id)
            .map(|d| d.event_created_at)
            .max()
            .unwrap_or(0))
    }

    async fn create_customer(&self, customer: Customer) -> Result<Customer, StoreError> {
        self.commit(move |snapshot| {
            if snapshot.customers.iter().any(|c| {
                c.merchant_id == customer.merchant_id && c.public_key == customer.public_key
            }) {
                return Err(StoreError::conflict("customer", customer.public_key));
            }
            snapshot.customers.push(customer.clone());
            Ok(customer)
        })
        .await
    }

    async fn get_customer(
        &self,
        merchant_id: &str,
        public_key: &str,
    ) -> Result<Option<Customer>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .customers
            .iter()
            .find(|c| c.merchant_id == merchant_id && c.public_key == public_key)
            .cloned())
    }

    async fn list_customers(&self, merchant_id: &str) -> Result<Vec<Customer>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .customers
            .iter()
            .filter(|c| c.merchant_id == merchant_id)
            .cloned()
            .collect())
    }

    async fn list_customers_by_pubkey(&self, public_key: &str) -> Result<Vec<Customer>, StoreError> {
        let snapshot = self.inner.read().await;
        Ok(snapshot
            .customers
            .iter()
            .filter(|c| c.public_key == public_key)
            .cloned()
            .collect())
    }

    async fn update_customer_profile(
        &self,
        merchant_id: &str,
        public_key: &str,
        profile: CustomerProfile,
        event_created_at: u64,
    ) -> Result<(), StoreError> {
        self.commit(move |snapshot| {
            let customer = find_customer(snapshot, merchant_id, public_key)?;
            customer.profile = Some(profile);
            customer.event_created_at = Some(event_created_at);
            Ok(())
        })
        .await
    }

    async fn increment_customer_unread(
        &self,
        merchant_id: &str,
        public_key: &str,
    ) -> Result<(), StoreError> {
        self.commit(|snapshot| {
            find_customer(snapshot, merchant_id, public_key)?.unread_messages += 1;
            Ok(())
        })
        .await
    }

    async fn reset_customer_unread(
        &self,
        merchant_id: &str,
        public_key: &str,
    ) -> Result<(), StoreError> {
        self.commit(|snapshot| {
            find_customer(snapshot, merchant_id, public_key)?.unread_messages = 0;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::market::models::{
        DirectMessageType, MerchantConfig, OrderExtra, OrderItem, ProductConfig, StallConfig,
    };

    fn merchant() -> Merchant {
        Merchant {
            id: "m1".into(),
            private_key: "00".repeat(32),
            public_key: "aa".repeat(32),
            config: MerchantConfig::default(),
            time: None,
        }
    }

    fn stall() -> Stall {
        Stall {
            id: "s1".into(),
            merchant_id: "m1".into(),
            wallet: "w1".into(),
            name: "Stall".into(),
            currency: "sat".into(),
            shipping_zones: vec![],
            config: StallConfig::default(),
            pending: false,
            event_id: None,
            event_created_at: None,
        }
    }

    fn product(quantity: u64) -> Product {
        Product {
            id: "p1".into(),
            stall_id: "s1".into(),
            name: "Soap".into(),
            categories: vec![],
            images: vec![],
            price: 10.0,
            quantity,
            active: true,
            pending: false,
            config: ProductConfig::default(),
            event_id: None,
            event_created_at: None,
        }
    }

    fn order(id: &str, event_id: &str) -> Order {
        Order {
            id: id.into(),
            merchant_id: "m1".into(),
            event_id: Some(event_id.into()),
            event_created_at: Some(10),
            public_key: "bb".repeat(32),
            merchant_public_key: "aa".repeat(32),
            shipping_id: "z1".into(),
            items: vec![OrderItem {
                product_id: "p1".into(),
                quantity: 1,
            }],
            contact: None,
            address: None,
            stall_id: None,
            invoice_id: None,
            total: 0,
            paid: false,
            shipped: false,
            time: 10,
            extra: OrderExtra::default(),
        }
    }

    #[tokio::test]
    async fn orders_are_unique_per_id_and_event() {
        let store = MemoryStore::new();
        store.create_order(order("o1", "e1")).await.unwrap();
        assert!(matches!(
            store.create_order(order("o1", "e2")).await,
            Err(StoreError::Conflict { .. })
        ));
        assert!(matches!(
            store.create_order(order("o2", "e1")).await,
            Err(StoreError::Conflict { .. })
        ));
        assert_eq!(store.list_orders("m1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn direct_messages_dedup_on_event_id() {
        let store = MemoryStore::new();
        let dm = DirectMessage {
            id: "d1".into(),
            merchant_id: "m1".into(),
            event_id: "e1".into(),
            event_created_at: 5,
            message: "hi".into(),
            public_key: "bb".repeat(32),
            incoming: true,
            type_: DirectMessageType::PlainText,
            time: 5,
        };
        assert!(store.create_direct_message(dm.clone()).await.unwrap().is_some());
        let again = DirectMessage {
            id: "d2".into(),
            ..dm
        };
        assert!(store.create_direct_message(again).await.unwrap().is_none());
        assert_eq!(store.last_direct_message_time("m1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("souk.json");
        {
            let store = MemoryStore::open(&path).unwrap();
            store.create_merchant(merchant()).await.unwrap();
            store.create_order(order("o1", "e1")).await.unwrap();
        }
        let store = MemoryStore::open(&path).unwrap();
        assert!(store.get_merchant("m1").await.unwrap().is_some());
        assert!(store.get_order_by_event_id("m1", "e1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_write_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("souk.json");
        let store = MemoryStore::open(&path).unwrap();
        store.create_merchant(merchant()).await.unwrap();

        // a directory in place of the snapshot file makes the rename fail
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        assert!(store.create_order(order("o1", "e1")).await.is_err());
        assert!(store.get_order("m1", "o1").await.unwrap().is_none());
        assert!(store.delete_merchant("m1").await.is_err());
        assert!(store.get_merchant("m1").await.unwrap().is_some());

        let missing = MemoryStore::open(dir.path().join("missing").join("souk.json")).unwrap();
        assert!(missing.create_merchant(merchant()).await.is_err());
        assert!(missing.list_merchants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recording_a_listing_event_keeps_stock() {
        let store = MemoryStore::new();
        store.create_merchant(merchant()).await.unwrap();
        store.create_stall(stall()).await.unwrap();
        store.create_product("m1", product(5)).await.unwrap();

        let stale = store.get_product("m1", "p1").await.unwrap().unwrap();
        store
            .update_product_quantities("m1", &[("p1".to_string(), 2)])
            .await
            .unwrap();
        let recorded = store
            .record_product_event("m1", &stale.id, "ev1", 42)
            .await
            .unwrap();
        assert_eq!(recorded.quantity, 2);
        assert_eq!(recorded.event_id.as_deref(), Some("ev1"));
        assert_eq!(store.last_product_update_time("m1").await.unwrap(), 42);
        assert!(matches!(
            store.record_product_event("m1", "nope", "ev2", 43).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_id_rolls_back_every_quantity() {
        let store = MemoryStore::new();
        store.create_stall(stall()).await.unwrap();
        store.create_product("m1", product(5)).await.unwrap();
        let err = store
            .update_product_quantities("m1", &[("p1".to_string(), 1), ("p9".to_string(), 1)])
            .await;
        assert!(matches!(err, Err(StoreError::NotFound { .. })));
        assert_eq!(store.get_product("m1", "p1").await.unwrap().unwrap().quantity, 5);
    }

    #[tokio::test]
    async fn delete_merchant_cascades() {
        let store = MemoryStore::new();
        store.create_merchant(merchant()).await.unwrap();
        store.create_order(order("o1", "e1")).await.unwrap();
        store.delete_merchant("m1").await.unwrap();
        assert!(store.list_merchants().await.unwrap().is_empty());
        assert!(store.list_orders("m1").await.unwrap().is_empty());
    }
}
