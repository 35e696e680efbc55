use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    features::market::models::{OrderItem, Product},
    infra::store::{Store, StoreError},
};

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Product '{0}' not found")]
    UnknownProduct(String),

    #[error(
        "Not enough quantity for product '{name}' ({product_id}): required {required}, available {available}"
    )]
    Shortfall {
        product_id: String,
        name: String,
        required: u64,
        available: u64,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Proof that the caller holds the merchant's inventory lock.
pub type InventoryGuard = OwnedMutexGuard<()>;

/// Sums quantities per product id, keeping first-seen order.
fn demand(items: &[OrderItem]) -> Vec<(String, u64)> {
    let mut totals: Vec<(String, u64)> = Vec::new();
    for item in items {
        match totals.iter_mut().find(|(id, _)| *id == item.product_id) {
            Some((_, qty)) => *qty = qty.saturating_add(item.quantity),
            None => totals.push((item.product_id.clone(), item.quantity)),
        }
    }
    totals
}

/// New quantities after taking `items` out of `products`; first shortfall wins.
pub fn plan_decrement(
    products: &[Product],
    items: &[OrderItem],
) -> Result<Vec<(String, u64)>, InventoryError> {
    demand(items)
        .into_iter()
        .map(|(product_id, required)| {
            let product = products
                .iter()
                .find(|p| p.id == product_id)
                .ok_or_else(|| InventoryError::UnknownProduct(product_id.clone()))?;
            if required > product.quantity {
                return Err(InventoryError::Shortfall {
                    product_id,
                    name: product.name.clone(),
                    required,
                    available: product.quantity,
                });
            }
            Ok((product_id, product.quantity - required))
        })
        .collect()
}

/// Serializes stock changes per merchant.
#[derive(Debug, Default)]
pub struct InventoryLedger {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InventoryLedger {
    pub async fn lock(&self, merchant_id: &str) -> InventoryGuard {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(merchant_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Checks every line against current stock and writes all decrements in one step.
    pub async fn reserve(
        &self,
        store: &dyn Store,
        merchant_id: &str,
        items: &[OrderItem],
        _guard: &InventoryGuard,
    ) -> Result<Vec<Product>, InventoryError> {
        let ids: Vec<String> = demand(items).into_iter().map(|(id, _)| id).collect();
        let products = store.get_products_by_ids(merchant_id, &ids).await?;
        let quantities = plan_decrement(&products, items)?;
        Ok(store.update_product_quantities(merchant_id, &quantities).await?)
    }

    /// Puts stock back after an order could not be completed.
    pub async fn release(
        &self,
        store: &dyn Store,
        merchant_id: &str,
        items: &[OrderItem],
        _guard: &InventoryGuard,
    ) -> Result<Vec<Product>, InventoryError> {
        let totals = demand(items);
        let ids: Vec<String> = totals.iter().map(|(id, _)| id.clone()).collect();
        let products = store.get_products_by_ids(merchant_id, &ids).await?;
        let quantities: Vec<(String, u64)> = products
            .iter()
            .filter_map(|p| {
                totals
                    .iter()
                    .find(|(id, _)| *id == p.id)
                    .map(|(_, qty)| (p.id.clone(), p.quantity.saturating_add(*qty)))
            })
            .collect();
        Ok(store.update_product_quantities(merchant_id, &quantities).await?)
    }

    /// Decrement applied when a paid order never reserved stock; clamps at zero instead of failing.
    pub async fn settle(
        &self,
        store: &dyn Store,
        merchant_id: &str,
        items: &[OrderItem],
        _guard: &InventoryGuard,
    ) -> Result<Vec<Product>, InventoryError> {
        let totals = demand(items);
        let ids: Vec<String> = totals.iter().map(|(id, _)| id.clone()).collect();
        let products = store.get_products_by_ids(merchant_id, &ids).await?;
        let quantities: Vec<(String, u64)> = products
            .iter()
            .filter_map(|p| {
                totals
                    .iter()
                    .find(|(id, _)| *id == p.id)
                    .map(|(_, qty)| (p.id.clone(), p.quantity.saturating_sub(*qty)))
            })
            .collect();
        Ok(store.update_product_quantities(merchant_id, &quantities).await?)
    }
}
