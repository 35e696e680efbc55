#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    features::market::{
        ErrorKind, Market,
        inventory::{InventoryError, InventoryGuard},
        messages::MessageError,
        models::{
            CustomerOrder, DirectMessage, DmPayload, Merchant, Order, OrderExtra,
            OrderStatusUpdate, PaymentOption, PaymentRequest, Product, Stall, Zone,
        },
        pricing::{OrderQuote, QuoteLine, quote_order},
    },
    infra::{
        invoice::{InvoiceError, InvoiceRequest},
        nostr::nostr_now,
        rates::RateError,
        store::{OrderPatch, StoreError},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Requested,
    Priced,
    InvoiceIssued,
    Paid,
    Failed,
    Shipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid order transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: OrderStatus,
    pub to: OrderStatus,
}

pub fn ensure_transition(from: OrderStatus, to: OrderStatus) -> Result<(), TransitionError> {
    if from == to {
        return Ok(());
    }
    let allowed = match from {
        OrderStatus::Requested => matches!(to, OrderStatus::Priced | OrderStatus::Failed),
        OrderStatus::Priced => matches!(
            to,
            OrderStatus::InvoiceIssued | OrderStatus::Paid | OrderStatus::Failed
        ),
        OrderStatus::InvoiceIssued => matches!(to, OrderStatus::Paid | OrderStatus::Failed),
        OrderStatus::Paid => matches!(to, OrderStatus::Shipped),
        OrderStatus::Failed => false,
        OrderStatus::Shipped => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Order '{0}' has no items")]
    EmptyOrder(String),

    #[error("Invalid quantity for product '{0}'")]
    InvalidQuantity(String),

    #[error("Product '{0}' not found")]
    ProductNotFound(String),

    #[error("Product '{0}' is not available for sale")]
    ProductUnavailable(String),

    #[error("Order '{0}' has products from different stalls")]
    MixedStalls(String),

    #[error("Stall '{0}' not found")]
    StallNotFound(String),

    #[error("Shipping zone '{0}' not found")]
    ZoneNotFound(String),

    #[error("Order '{0}' not found")]
    OrderNotFound(String),

    #[error("Merchant '{0}' not found")]
    MerchantNotFound(String),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invoice error: {0}")]
    Invoice(#[from] InvoiceError),

    #[error("Exchange rate error: {0}")]
    Rate(#[from] RateError),

    #[error("Messaging error: {0}")]
    Message(#[from] MessageError),
}

impl OrderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrderError::EmptyOrder(_)
            | OrderError::InvalidQuantity(_)
            | OrderError::ProductNotFound(_)
            | OrderError::ProductUnavailable(_)
            | OrderError::MixedStalls(_)
            | OrderError::StallNotFound(_)
            | OrderError::ZoneNotFound(_) => ErrorKind::Validation,
            OrderError::Inventory(InventoryError::Store(err)) => ErrorKind::from_store(err),
            OrderError::Inventory(_) => ErrorKind::Validation,
            OrderError::OrderNotFound(_) | OrderError::MerchantNotFound(_) => ErrorKind::NotFound,
            OrderError::Transition(_) => ErrorKind::Conflict,
            OrderError::Store(err) => ErrorKind::from_store(err),
            OrderError::Invoice(_) | OrderError::Rate(_) | OrderError::Message(_) => {
                ErrorKind::Unavailable
            }
        }
    }
}

/// Result of one order-creation attempt.
#[derive(Debug, Clone)]
pub enum OrderOutcome {
    Created {
        order: Order,
        payment_request: PaymentRequest,
    },
    /// Persisted with a failure reason the customer is told about.
    Failed { order: Order, reason: String },
    /// Already recorded under the same order id or event id.
    Duplicate(Order),
}

/// Where an order request came from.
#[derive(Debug, Clone, Copy)]
pub struct OrderSource<'a> {
    pub customer_pubkey: &'a str,
    pub event_id: Option<&'a str>,
    pub event_created_at: Option<u64>,
}

struct PricedOrder {
    stall: Stall,
    quote: OrderQuote,
}

fn order_extra(quote: &OrderQuote) -> OrderExtra {
    OrderExtra {
        products: quote.overview(),
        currency: quote.currency.clone(),
        btc_price: quote.btc_price,
        shipping_cost: quote.shipping_cost,
        shipping_cost_sat: quote.shipping_cost_sat,
        ..OrderExtra::default()
    }
}

fn payment_request(order_id: &str, receipt: String, pay_text: &str) -> PaymentRequest {
    PaymentRequest {
        id: order_id.to_string(),
        message: Some(receipt),
        payment_options: vec![PaymentOption {
            type_: "ln".to_string(),
            link: pay_text.to_string(),
        }],
    }
}

impl Market {
    async fn find_existing_order(
        &self,
        merchant_id: &str,
        order_id: &str,
        event_id: Option<&str>,
    ) -> Result<Option<Order>, StoreError> {
        if let Some(order) = self.store.get_order(merchant_id, order_id).await? {
            return Ok(Some(order));
        }
        match event_id {
            Some(event_id) => self.store.get_order_by_event_id(merchant_id, event_id).await,
            None => Ok(None),
        }
    }

    async fn resolve_zone(&self, merchant_id: &str, stall: &Stall, zone_id: &str) -> Result<Zone, OrderError> {
        let Some(listed) = stall.shipping_zones.iter().find(|z| z.id == zone_id) else {
            return Err(OrderError::ZoneNotFound(zone_id.to_string()));
        };
        Ok(self
            .store
            .get_zone(merchant_id, zone_id)
            .await?
            .unwrap_or_else(|| listed.clone()))
    }

    /// Validates the item list against the catalog and prices it.
    async fn price_order(&self, merchant: &Merchant, request: &CustomerOrder) -> Result<PricedOrder, OrderError> {
        if request.items.is_empty() {
            return Err(OrderError::EmptyOrder(request.id.clone()));
        }
        if let Some(item) = request.items.iter().find(|i| i.quantity == 0) {
            return Err(OrderError::InvalidQuantity(item.product_id.clone()));
        }

        let ids: Vec<String> = request
            .items
            .iter()
            .map(|i| i.product_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let products = self.store.get_products_by_ids(&merchant.id, &ids).await?;

        let mut lines: Vec<(&Product, u64)> = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let product = products
                .iter()
                .find(|p| p.id == item.product_id)
                .ok_or_else(|| OrderError::ProductNotFound(item.product_id.clone()))?;
            if !product.active || product.pending {
                return Err(OrderError::ProductUnavailable(product.id.clone()));
            }
            lines.push((product, item.quantity));
        }

        let stall_ids: BTreeSet<&str> = lines.iter().map(|(p, _)| p.stall_id.as_str()).collect();
        if stall_ids.len() > 1 {
            return Err(OrderError::MixedStalls(request.id.clone()));
        }
        let stall_id = lines[0].0.stall_id.clone();
        let stall = self
            .store
            .get_stall(&merchant.id, &stall_id)
            .await?
            .ok_or_else(|| OrderError::StallNotFound(stall_id.clone()))?;
        let zone = self.resolve_zone(&merchant.id, &stall, &request.shipping_id).await?;

        let quote_lines = lines
            .iter()
            .map(|(p, qty)| QuoteLine::from_product(p, &stall.currency, &zone.id, *qty))
            .collect();
        let quote = quote_order(self.rates.as_ref(), quote_lines, &zone).await?;
        Ok(PricedOrder { stall, quote })
    }

    fn new_order(&self, merchant: &Merchant, request: &CustomerOrder, source: OrderSource<'_>) -> Order {
        Order {
            id: request.id.clone(),
            merchant_id: merchant.id.clone(),
            event_id: source.event_id.map(str::to_string),
            event_created_at: source.event_created_at,
            public_key: source.customer_pubkey.to_string(),
            merchant_public_key: merchant.public_key.clone(),
            shipping_id: request.shipping_id.clone(),
            items: request.items.clone(),
            contact: request.contact.clone(),
            address: request.address.clone(),
            stall_id: None,
            invoice_id: None,
            total: 0,
            paid: false,
            shipped: false,
            time: nostr_now(),
            extra: OrderExtra::default(),
        }
    }

    async fn record_failed_order(
        &self,
        mut order: Order,
        stall_id: Option<String>,
        reason: String,
    ) -> Result<OrderOutcome, OrderError> {
        order.stall_id = stall_id;
        order.extra.fail_message = Some(reason.clone());
        let order = self.store.create_order(order).await?;
        warn!("Order {} for merchant {} failed: {reason}", order.id, order.merchant_id);
        Ok(OrderOutcome::Failed { order, reason })
    }

    /// Creates an order at most once: validate, price, reserve stock, invoice, persist.
    pub async fn create_order(
        &self,
        merchant: &Merchant,
        request: &CustomerOrder,
        source: OrderSource<'_>,
    ) -> Result<OrderOutcome, OrderError> {
        let guard = self.ledger.lock(&merchant.id).await;

        if let Some(existing) = self
            .find_existing_order(&merchant.id, &request.id, source.event_id)
            .await?
        {
            return Ok(OrderOutcome::Duplicate(existing));
        }

        let order = self.new_order(merchant, request, source);
        let priced = match self.price_order(merchant, request).await {
            Ok(priced) => priced,
            Err(err) if err.kind() == ErrorKind::Validation => {
                return self.record_failed_order(order, None, err.to_string()).await;
            }
            Err(err) => return Err(err),
        };

        let reserved = match self
            .ledger
            .reserve(self.store.as_ref(), &merchant.id, &request.items, &guard)
            .await
        {
            Ok(products) => products,
            Err(InventoryError::Store(err)) => return Err(err.into()),
            Err(err) => {
                return self
                    .record_failed_order(order, Some(priced.stall.id.clone()), err.to_string())
                    .await;
            }
        };

        let total = priced.quote.total_sat();
        let invoice_request = InvoiceRequest {
            wallet: priced.stall.wallet.clone(),
            amount_sat: total,
            memo: format!("Order '{}' for {}", request.id, priced.stall.name),
            order_id: request.id.clone(),
            merchant_pubkey: merchant.public_key.clone(),
        };
        let invoice = match self.invoices.create_invoice(&invoice_request).await {
            Ok(invoice) => invoice,
            Err(err) => {
                if let Err(release) = self
                    .ledger
                    .release(self.store.as_ref(), &merchant.id, &request.items, &guard)
                    .await
                {
                    error!("Failed to release stock for order {}: {release}", request.id);
                }
                return Err(err.into());
            }
        };

        let mut extra = order_extra(&priced.quote);
        extra.stock_reserved = true;
        extra.payment_link = Some(invoice.pay_text.clone());
        let order = Order {
            stall_id: Some(priced.stall.id.clone()),
            invoice_id: Some(invoice.invoice_id.clone()),
            total,
            extra,
            ..order
        };
        let order = match self.store.create_order(order).await {
            Ok(order) => order,
            Err(err) => {
                if let Err(release) = self
                    .ledger
                    .release(self.store.as_ref(), &merchant.id, &request.items, &guard)
                    .await
                {
                    error!("Failed to release stock for order {}: {release}", request.id);
                }
                return Err(err.into());
            }
        };
        // listings go out under the lock so relays see stock levels in order
        self.republish_products(merchant, reserved).await;
        drop(guard);

        info!(
            "Created order {} for merchant {} ({} sat)",
            order.id, merchant.id, order.total
        );
        let payment_request = payment_request(&order.id, priced.quote.receipt(), &invoice.pay_text);
        Ok(OrderOutcome::Created {
            order,
            payment_request,
        })
    }

    /// Answers an incoming order message; the customer always hears back unless it is a redelivery.
    pub(crate) async fn respond_to_customer_order(
        &self,
        merchant: &Merchant,
        customer_pubkey: &str,
        request: &CustomerOrder,
        message: &DirectMessage,
    ) {
        let source = OrderSource {
            customer_pubkey,
            event_id: Some(&message.event_id),
            event_created_at: Some(message.event_created_at),
        };
        let reply = match self.create_order(merchant, request, source).await {
            Ok(OrderOutcome::Created {
                payment_request, ..
            }) => DmPayload::PaymentRequest(payment_request),
            Ok(OrderOutcome::Failed { reason, .. }) => DmPayload::PlainText(reason),
            Ok(OrderOutcome::Duplicate(order)) => {
                debug!("Order {} already recorded, no reply", order.id);
                return;
            }
            Err(err) => {
                error!("Order {} for merchant {} not processed: {err}", request.id, merchant.id);
                DmPayload::PlainText(format!(
                    "Order '{}' could not be processed right now. Please try again later.",
                    request.id
                ))
            }
        };
        if let Err(err) = self.send_dm(merchant, customer_pubkey, &reply).await {
            error!("Failed to answer order {}: {err}", request.id);
        }
    }

    async fn release_quietly(&self, merchant_id: &str, order: &Order, guard: &InventoryGuard) {
        if let Err(err) = self
            .ledger
            .release(self.store.as_ref(), merchant_id, &order.items, guard)
            .await
        {
            error!("Failed to release stock for order {}: {err}", order.id);
        }
    }

    async fn load_order(&self, merchant_id: &str, order_id: &str) -> Result<(Merchant, Order), OrderError> {
        let merchant = self
            .store
            .get_merchant(merchant_id)
            .await?
            .ok_or_else(|| OrderError::MerchantNotFound(merchant_id.to_string()))?;
        let order = self
            .store
            .get_order(merchant_id, order_id)
            .await?
            .ok_or_else(|| OrderError::OrderNotFound(order_id.to_string()))?;
        Ok((merchant, order))
    }

    /// New invoice for an unpaid order, optionally for another shipping zone.
    ///
    /// Stock already held by the order is kept. An order that never reserved stock
    /// (one rebuilt from history) reserves it here and fails on a shortfall.
    pub async fn reissue_order(
        &self,
        merchant_id: &str,
        order_id: &str,
        shipping_id: Option<&str>,
    ) -> Result<PaymentRequest, OrderError> {
        let guard = self.ledger.lock(merchant_id).await;
        let (merchant, order) = self.load_order(merchant_id, order_id).await?;
        ensure_transition(order.status(), OrderStatus::InvoiceIssued)?;

        let stall_id = order.stall_id.clone().ok_or(TransitionError {
            from: order.status(),
            to: OrderStatus::InvoiceIssued,
        })?;
        let stall = self
            .store
            .get_stall(merchant_id, &stall_id)
            .await?
            .ok_or_else(|| OrderError::StallNotFound(stall_id.clone()))?;
        let shipping_id = shipping_id.unwrap_or(&order.shipping_id).to_string();
        let zone = self.resolve_zone(merchant_id, &stall, &shipping_id).await?;
        let zone_changed = shipping_id != order.shipping_id;

        let mut lines = Vec::with_capacity(order.items.len());
        for item in &order.items {
            let frozen = order
                .extra
                .products
                .iter()
                .find(|p| p.id == item.product_id)
                .ok_or_else(|| OrderError::ProductNotFound(item.product_id.clone()))?;
            let surcharge = if zone_changed {
                self.store
                    .get_product(merchant_id, &item.product_id)
                    .await?
                    .map(|p| p.shipping_surcharge(&zone.id))
                    .unwrap_or(0.0)
            } else {
                frozen.product_shipping_cost
            };
            lines.push(QuoteLine {
                product_id: frozen.id.clone(),
                name: frozen.name.clone(),
                price: frozen.price,
                currency: frozen.currency.clone().unwrap_or_else(|| stall.currency.clone()),
                surcharge,
                quantity: item.quantity,
            });
        }
        let quote = quote_order(self.rates.as_ref(), lines, &zone).await?;
        let total = quote.total_sat();

        let reserved_here = !order.extra.stock_reserved;
        let reserved = if reserved_here {
            self.ledger
                .reserve(self.store.as_ref(), merchant_id, &order.items, &guard)
                .await?
        } else {
            Vec::new()
        };

        let invoice_request = InvoiceRequest {
            wallet: stall.wallet.clone(),
            amount_sat: total,
            memo: format!("Order '{}' for {}", order.id, stall.name),
            order_id: order.id.clone(),
            merchant_pubkey: merchant.public_key.clone(),
        };
        let invoice = match self.invoices.create_invoice(&invoice_request).await {
            Ok(invoice) => invoice,
            Err(err) => {
                if reserved_here {
                    self.release_quietly(merchant_id, &order, &guard).await;
                }
                return Err(err.into());
            }
        };

        let mut extra = order_extra(&quote);
        extra.stock_reserved = true;
        extra.payment_link = Some(invoice.pay_text.clone());
        let patch = OrderPatch {
            shipping_id: Some(shipping_id),
            invoice_id: Some(invoice.invoice_id.clone()),
            total: Some(total),
            extra: Some(extra),
            ..OrderPatch::default()
        };
        let order = match self.store.update_order(merchant_id, order_id, patch).await {
            Ok(order) => order,
            Err(err) => {
                if reserved_here {
                    self.release_quietly(merchant_id, &order, &guard).await;
                }
                return Err(err.into());
            }
        };
        self.republish_products(&merchant, reserved).await;
        drop(guard);

        let request = payment_request(&order.id, quote.receipt(), &invoice.pay_text);
        self.send_dm(&merchant, &order.public_key, &DmPayload::PaymentRequest(request.clone()))
            .await?;
        info!("Reissued invoice for order {} ({} sat)", order.id, total);
        Ok(request)
    }

    /// Settlement: mark paid, settle stock, republish listings, notify the customer.
    pub async fn handle_order_paid(&self, order_id: &str, merchant_pubkey: &str) -> Result<Order, OrderError> {
        let merchant = self
            .store
            .get_merchant_by_pubkey(merchant_pubkey)
            .await?
            .ok_or_else(|| OrderError::MerchantNotFound(merchant_pubkey.to_string()))?;

        let (order, autoreplies) = {
            let guard = self.ledger.lock(&merchant.id).await;
            // read under the lock so two settlements of one order cannot both decrement
            let order = self
                .store
                .get_order(&merchant.id, order_id)
                .await?
                .ok_or_else(|| OrderError::OrderNotFound(order_id.to_string()))?;
            if order.paid {
                debug!("Order {order_id} already paid");
                return Ok(order);
            }
            ensure_transition(order.status(), OrderStatus::Paid)?;

            let settled = if order.extra.stock_reserved {
                let ids: Vec<String> = order.items.iter().map(|i| i.product_id.clone()).collect();
                self.store.get_products_by_ids(&merchant.id, &ids).await?
            } else {
                self.ledger
                    .settle(self.store.as_ref(), &merchant.id, &order.items, &guard)
                    .await?
            };
            let mut extra = order.extra.clone();
            extra.stock_reserved = true;
            let patch = OrderPatch {
                paid: Some(true),
                extra: Some(extra),
                ..OrderPatch::default()
            };
            let order = self.store.update_order(&merchant.id, order_id, patch).await?;
            let autoreplies: Vec<String> = settled
                .iter()
                .filter(|p| p.config.use_autoreply)
                .filter_map(|p| p.config.autoreply_message.clone())
                .collect();
            self.republish_products(&merchant, settled).await;
            drop(guard);
            (order, autoreplies)
        };
        info!("Order {} for merchant {} paid", order.id, merchant.id);

        let status = DmPayload::OrderStatus(OrderStatusUpdate {
            id: order.id.clone(),
            message: Some("Payment received.".to_string()),
            paid: Some(true),
            shipped: Some(false),
        });
        self.send_dm(&merchant, &order.public_key, &status).await?;
        self.notifier.notify(
            &merchant.id,
            json!({"type": "order-paid", "order_id": order.id}),
        );

        for text in autoreplies {
            tokio::time::sleep(self.config.autoreply_interval()).await;
            if let Err(err) = self
                .send_dm(&merchant, &order.public_key, &DmPayload::PlainText(text))
                .await
            {
                warn!("Autoreply for order {} not sent: {err}", order.id);
            }
        }
        Ok(order)
    }

    /// Flips the shipped flag and tells the customer.
    pub async fn update_order_shipped(
        &self,
        merchant_id: &str,
        order_id: &str,
        shipped: bool,
        message: Option<String>,
    ) -> Result<Order, OrderError> {
        let (merchant, order) = self.load_order(merchant_id, order_id).await?;
        let target = if shipped {
            OrderStatus::Shipped
        } else {
            OrderStatus::Paid
        };
        ensure_transition(order.status(), target)?;

        let order = self
            .store
            .update_order(
                merchant_id,
                order_id,
                OrderPatch {
                    shipped: Some(shipped),
                    ..OrderPatch::default()
                },
            )
            .await?;
        let status = DmPayload::OrderStatus(OrderStatusUpdate {
            id: order.id.clone(),
            message,
            paid: Some(order.paid),
            shipped: Some(shipped),
        });
        self.send_dm(&merchant, &order.public_key, &status).await?;
        Ok(order)
    }

    /// Replays stored order messages to rebuild local orders. Local only: no stock changes, invoices or replies.
    pub async fn restore_from_history(&self, merchant_id: &str) -> Result<RestoreReport, OrderError> {
        let merchant = self
            .store
            .get_merchant(merchant_id)
            .await?
            .ok_or_else(|| OrderError::MerchantNotFound(merchant_id.to_string()))?;

        let mut flagged = merchant.clone();
        flagged.config.restore_in_progress = true;
        self.store.update_merchant(flagged).await?;

        let result = self.replay_order_messages(&merchant).await;

        if let Some(mut current) = self.store.get_merchant(merchant_id).await? {
            current.config.restore_in_progress = false;
            self.store.update_merchant(current).await?;
        }
        let report = result?;
        info!(
            "Restored merchant {}: {} created, {} repaired, {} updated",
            merchant_id, report.created, report.repaired, report.updated
        );
        Ok(report)
    }

    async fn replay_order_messages(&self, merchant: &Merchant) -> Result<RestoreReport, OrderError> {
        let mut report = RestoreReport::default();
        for message in self.store.list_order_messages(&merchant.id).await? {
            match DmPayload::classify(&message.message) {
                DmPayload::CustomerOrder(request) if message.incoming => {
                    self.restore_customer_order(merchant, &message, &request, &mut report)
                        .await?;
                }
                DmPayload::PaymentRequest(request) if !message.incoming => {
                    self.restore_payment_request(merchant, &request, &mut report)
                        .await?;
                }
                DmPayload::OrderStatus(update) if !message.incoming => {
                    self.restore_order_status(merchant, &update, &mut report)
                        .await?;
                }
                _ => {}
            }
        }
        Ok(report)
    }

    async fn restore_customer_order(
        &self,
        merchant: &Merchant,
        message: &DirectMessage,
        request: &CustomerOrder,
        report: &mut RestoreReport,
    ) -> Result<(), OrderError> {
        let existing = self
            .find_existing_order(&merchant.id, &request.id, Some(&message.event_id))
            .await?;
        // only orders whose stall never resolved need rebuilding
        if existing.as_ref().is_some_and(|o| o.stall_id.is_some()) {
            return Ok(());
        }

        let source = OrderSource {
            customer_pubkey: &message.public_key,
            event_id: Some(&message.event_id),
            event_created_at: Some(message.event_created_at),
        };
        let base = match &existing {
            Some(order) => order.clone(),
            None => self.new_order(merchant, request, source),
        };

        let rebuilt = match self.price_order(merchant, request).await {
            Ok(priced) => {
                let mut extra = order_extra(&priced.quote);
                extra.stock_reserved = base.extra.stock_reserved;
                extra.payment_link = base.extra.payment_link.clone();
                Order {
                    stall_id: Some(priced.stall.id),
                    total: priced.quote.total_sat(),
                    extra,
                    ..base
                }
            }
            Err(err) if err.kind() == ErrorKind::Validation => {
                if existing.is_some() {
                    return Ok(());
                }
                let mut failed = base;
                failed.extra.fail_message = Some(err.to_string());
                failed
            }
            Err(err) => return Err(err),
        };

        if existing.is_some() {
            self.store.replace_order(rebuilt).await?;
            report.repaired += 1;
        } else {
            match self.store.create_order(rebuilt).await {
                Ok(_) => report.created += 1,
                Err(StoreError::Conflict { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn restore_payment_request(
        &self,
        merchant: &Merchant,
        request: &PaymentRequest,
        report: &mut RestoreReport,
    ) -> Result<(), OrderError> {
        let Some(order) = self.store.get_order(&merchant.id, &request.id).await? else {
            return Ok(());
        };
        let Some(option) = request.payment_options.iter().find(|o| o.type_ == "ln") else {
            return Ok(());
        };
        if order.extra.payment_link.as_deref() == Some(option.link.as_str()) {
            return Ok(());
        }
        let mut extra = order.extra.clone();
        extra.payment_link = Some(option.link.clone());
        self.store
            .update_order(
                &merchant.id,
                &order.id,
                OrderPatch {
                    extra: Some(extra),
                    ..OrderPatch::default()
                },
            )
            .await?;
        report.updated += 1;
        Ok(())
    }

    async fn restore_order_status(
        &self,
        merchant: &Merchant,
        update: &OrderStatusUpdate,
        report: &mut RestoreReport,
    ) -> Result<(), OrderError> {
        let Some(mut order) = self.store.get_order(&merchant.id, &update.id).await? else {
            return Ok(());
        };
        let mut patch = OrderPatch::default();
        if update.paid == Some(true) && !order.paid {
            if let Err(err) = ensure_transition(order.status(), OrderStatus::Paid) {
                warn!("Restore skipped payment for order {}: {err}", order.id);
                return Ok(());
            }
            order.paid = true;
            patch.paid = Some(true);
        }
        if let Some(shipped) = update.shipped {
            if shipped != order.shipped {
                let target = if shipped {
                    OrderStatus::Shipped
                } else {
                    OrderStatus::Paid
                };
                if let Err(err) = ensure_transition(order.status(), target) {
                    warn!("Restore skipped shipment for order {}: {err}", order.id);
                } else {
                    patch.shipped = Some(shipped);
                }
            }
        }
        if patch.paid.is_none() && patch.shipped.is_none() {
            return Ok(());
        }
        self.store.update_order(&merchant.id, &order.id, patch).await?;
        report.updated += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub created: usize,
    pub repaired: usize,
    pub updated: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_rejects_payment_after_failure() {
        let err = ensure_transition(OrderStatus::Failed, OrderStatus::Paid);
        assert!(err.is_err());
    }

    #[test]
    fn transition_allows_payment_after_invoice() {
        assert!(ensure_transition(OrderStatus::InvoiceIssued, OrderStatus::Paid).is_ok());
    }

    #[test]
    fn shipped_is_terminal() {
        assert!(ensure_transition(OrderStatus::Shipped, OrderStatus::Paid).is_err());
        assert!(ensure_transition(OrderStatus::Shipped, OrderStatus::Shipped).is_ok());
    }

    #[test]
    fn shipping_requires_payment() {
        assert_eq!(
            ensure_transition(OrderStatus::InvoiceIssued, OrderStatus::Shipped),
            Err(TransitionError {
                from: OrderStatus::InvoiceIssued,
                to: OrderStatus::Shipped,
            })
        );
    }

    #[test]
    fn validation_errors_are_customer_facing() {
        assert_eq!(OrderError::MixedStalls("o1".into()).kind(), ErrorKind::Validation);
        assert_eq!(
            OrderError::Inventory(InventoryError::Shortfall {
                product_id: "p1".into(),
                name: "Soap".into(),
                required: 10,
                available: 5,
            })
            .kind(),
            ErrorKind::Validation
        );
        assert_eq!(OrderError::OrderNotFound("o1".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            OrderError::Invoice(InvoiceError::NotConfigured).kind(),
            ErrorKind::Unavailable
        );
    }
}
