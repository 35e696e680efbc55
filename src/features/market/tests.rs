use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use nostr::{
    event::Event,
    key::{Keys, PublicKey},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::MarketConfig,
    features::market::{
        Market,
        models::{
            CustomerOrder, DirectMessage, DirectMessageType, DmPayload, Merchant, MerchantProfile,
            OrderItem, Product, ProductConfig, Stall, StallConfig, Zone,
        },
        inventory::InventoryError,
        orders::{OrderError, OrderOutcome, OrderSource, RestoreReport},
        payments::run_payment_bridge,
        planner::Cursors,
    },
    infra::{
        invoice::{Invoice, InvoiceError, InvoiceIssuer, InvoiceRequest, SettledPayment},
        nostr::{
            KIND_METADATA, KIND_PRODUCT, KIND_STALL, build_direct_message, build_event_with_tags,
            sign_event,
        },
        notify::LiveNotifier,
        rates::FixedRates,
        relay::{OutboundFrame, RelayHandle},
        store::{MemoryStore, Store},
    },
};

#[derive(Default)]
struct StubInvoices {
    issued: AtomicUsize,
}

#[async_trait]
impl InvoiceIssuer for StubInvoices {
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice, InvoiceError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(Invoice {
            invoice_id: format!("hash-{n}"),
            pay_text: format!("lnbc{}n{n}", request.amount_sat),
        })
    }

    async fn is_paid(&self, _wallet: &str, _invoice_id: &str) -> Result<bool, InvoiceError> {
        Ok(false)
    }
}

struct Fixture {
    market: Arc<Market>,
    store: Arc<dyn Store>,
    frames: mpsc::UnboundedReceiver<OutboundFrame>,
    invoices: Arc<StubInvoices>,
    merchant: Merchant,
    merchant_keys: Keys,
}

fn zone(id: &str) -> Zone {
    Zone {
        id: id.into(),
        name: Some("Local".into()),
        currency: "sat".into(),
        cost: 0.0,
        countries: vec![],
    }
}

fn stall(id: &str, zone_id: &str) -> Stall {
    Stall {
        id: id.into(),
        merchant_id: String::new(),
        wallet: "wallet-1".into(),
        name: format!("Stall {id}"),
        currency: "sat".into(),
        shipping_zones: vec![zone(zone_id)],
        config: StallConfig::default(),
        pending: false,
        event_id: None,
        event_created_at: None,
    }
}

fn product(id: &str, stall_id: &str, price: f64, quantity: u64) -> Product {
    Product {
        id: id.into(),
        stall_id: stall_id.into(),
        name: "Soap".into(),
        categories: vec!["bath".into()],
        images: vec![],
        price,
        quantity,
        active: true,
        pending: false,
        config: ProductConfig::default(),
        event_id: None,
        event_created_at: None,
    }
}

async fn fixture(active: bool) -> Fixture {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let (relay, frames) = RelayHandle::detached();
    let invoices = Arc::new(StubInvoices::default());
    let market = Arc::new(Market::new(
        store.clone(),
        relay,
        invoices.clone(),
        Arc::new(FixedRates::default()),
        LiveNotifier::default(),
        MarketConfig::default(),
    ));

    let merchant_keys = Keys::generate();
    let merchant = market
        .register_merchant(
            &merchant_keys.secret_key().to_secret_hex(),
            MerchantProfile::default(),
            active,
        )
        .await
        .unwrap();
    market.create_zone(&merchant.id, zone("z1")).await.unwrap();
    market
        .create_stall(&merchant.id, stall("s1", "z1"))
        .await
        .unwrap();
    market
        .create_product(&merchant.id, product("p1", "s1", 1000.0, 5))
        .await
        .unwrap();

    Fixture {
        market,
        store,
        frames,
        invoices,
        merchant,
        merchant_keys,
    }
}

fn customer_order(id: &str, product_id: &str, quantity: u64) -> CustomerOrder {
    CustomerOrder {
        id: id.into(),
        shipping_id: "z1".into(),
        items: vec![OrderItem {
            product_id: product_id.into(),
            quantity,
        }],
        contact: None,
        address: None,
        message: None,
    }
}

fn order_event(customer: &Keys, merchant: &Merchant, order: CustomerOrder) -> Event {
    let body = DmPayload::CustomerOrder(order).to_message().unwrap();
    let recipient = PublicKey::from_hex(&merchant.public_key).unwrap();
    build_direct_message(customer, &recipient, &body).unwrap()
}

async fn quantity_of(fx: &Fixture, product_id: &str) -> u64 {
    fx.store
        .get_product(&fx.merchant.id, product_id)
        .await
        .unwrap()
        .unwrap()
        .quantity
}

async fn outgoing(fx: &Fixture, customer: &Keys) -> Vec<DirectMessage> {
    fx.store
        .list_direct_messages(&fx.merchant.id, &customer.public_key().to_hex())
        .await
        .unwrap()
        .into_iter()
        .filter(|m| !m.incoming)
        .collect()
}

fn published_events(frames: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(frame) = frames.try_recv() {
        if let OutboundFrame::Event(event) = frame {
            events.push(*event);
        }
    }
    events
}

#[tokio::test]
async fn order_message_reserves_stock_and_requests_payment() {
    let fx = fixture(true).await;
    let customer = Keys::generate();

    let event = order_event(&customer, &fx.merchant, customer_order("o1", "p1", 2));
    fx.market.handle_event(&event).await.unwrap();

    let order = fx
        .store
        .get_order(&fx.merchant.id, "o1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.total, 2000);
    assert!(!order.paid);
    assert_eq!(order.stall_id.as_deref(), Some("s1"));
    assert!(order.extra.stock_reserved);
    assert_eq!(quantity_of(&fx, "p1").await, 3);

    let replies = outgoing(&fx, &customer).await;
    assert_eq!(replies.len(), 1);
    match DmPayload::classify(&replies[0].message) {
        DmPayload::PaymentRequest(request) => {
            assert_eq!(request.id, "o1");
            assert_eq!(request.payment_options.len(), 1);
            assert_eq!(request.payment_options[0].type_, "ln");
            assert_eq!(request.payment_options[0].link, "lnbc2000n0");
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn shortfall_fails_the_order_without_touching_stock() {
    let fx = fixture(true).await;
    let customer = Keys::generate();

    let event = order_event(&customer, &fx.merchant, customer_order("o2", "p1", 10));
    fx.market.handle_event(&event).await.unwrap();

    assert_eq!(quantity_of(&fx, "p1").await, 5);
    let order = fx
        .store
        .get_order(&fx.merchant.id, "o2")
        .await
        .unwrap()
        .unwrap();
    let reason = order.extra.fail_message.unwrap();
    assert!(reason.contains("p1"));
    assert!(reason.contains("required 10"));
    assert!(reason.contains("available 5"));
    assert_eq!(fx.invoices.issued.load(Ordering::SeqCst), 0);

    let replies = outgoing(&fx, &customer).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].type_, DirectMessageType::PlainText);
    assert_eq!(replies[0].message, reason);
}

#[tokio::test]
async fn settlement_marks_paid_and_notifies_customer() {
    let fx = fixture(true).await;
    let customer = Keys::generate();
    let event = order_event(&customer, &fx.merchant, customer_order("o1", "p1", 2));
    fx.market.handle_event(&event).await.unwrap();

    let (tx, rx) = mpsc::channel(4);
    let bridge = tokio::spawn(run_payment_bridge(
        fx.market.clone(),
        rx,
        CancellationToken::new(),
    ));
    tx.send(SettledPayment {
        order_id: "o1".into(),
        merchant_pubkey: fx.merchant.public_key.clone(),
    })
    .await
    .unwrap();
    drop(tx);
    bridge.await.unwrap();

    let order = fx
        .store
        .get_order(&fx.merchant.id, "o1")
        .await
        .unwrap()
        .unwrap();
    assert!(order.paid);
    // stock was taken at order time
    assert_eq!(quantity_of(&fx, "p1").await, 3);

    let last = outgoing(&fx, &customer).await.pop().unwrap();
    assert_eq!(last.type_, DirectMessageType::OrderPaidOrShipped);
    match DmPayload::classify(&last.message) {
        DmPayload::OrderStatus(update) => {
            assert_eq!(update.id, "o1");
            assert_eq!(update.paid, Some(true));
        }
        other => panic!("unexpected reply {other:?}"),
    }

    // a second notification is a no-op
    let again = fx
        .market
        .handle_order_paid("o1", &fx.merchant.public_key)
        .await
        .unwrap();
    assert!(again.paid);
    assert_eq!(outgoing(&fx, &customer).await.len(), 2);
}

#[tokio::test]
async fn redelivered_order_is_recorded_once() {
    let fx = fixture(true).await;
    let customer = Keys::generate();
    let event = order_event(&customer, &fx.merchant, customer_order("o1", "p1", 2));

    fx.market.handle_event(&event).await.unwrap();
    fx.market.handle_event(&event).await.unwrap();

    let orders = fx.store.list_orders(&fx.merchant.id).await.unwrap();
    assert_eq!(orders.iter().filter(|o| o.id == "o1").count(), 1);
    assert_eq!(quantity_of(&fx, "p1").await, 3);
    assert_eq!(fx.invoices.issued.load(Ordering::SeqCst), 1);

    let customer_row = fx
        .store
        .get_customer(&fx.merchant.id, &customer.public_key().to_hex())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(customer_row.unread_messages, 1);
    assert_eq!(outgoing(&fx, &customer).await.len(), 1);
}

#[tokio::test]
async fn own_replies_seen_again_do_not_count_as_unread() {
    let mut fx = fixture(true).await;
    let customer = Keys::generate();
    let event = order_event(&customer, &fx.merchant, customer_order("o1", "p1", 1));
    fx.market.handle_event(&event).await.unwrap();

    let replies: Vec<Event> = published_events(&mut fx.frames)
        .into_iter()
        .filter(|e| e.kind.as_u16() == 4)
        .collect();
    assert_eq!(replies.len(), 1);
    fx.market.handle_event(&replies[0]).await.unwrap();

    let customer_row = fx
        .store
        .get_customer(&fx.merchant.id, &customer.public_key().to_hex())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(customer_row.unread_messages, 1);
    assert_eq!(outgoing(&fx, &customer).await.len(), 1);
}

#[tokio::test]
async fn concurrent_orders_cannot_oversell() {
    let fx = fixture(true).await;
    let a = Keys::generate().public_key().to_hex();
    let b = Keys::generate().public_key().to_hex();
    let first = customer_order("oa", "p1", 3);
    let second = customer_order("ob", "p1", 3);

    let (left, right) = tokio::join!(
        fx.market.create_order(
            &fx.merchant,
            &first,
            OrderSource {
                customer_pubkey: &a,
                event_id: Some("ev-a"),
                event_created_at: Some(10),
            },
        ),
        fx.market.create_order(
            &fx.merchant,
            &second,
            OrderSource {
                customer_pubkey: &b,
                event_id: Some("ev-b"),
                event_created_at: Some(11),
            },
        ),
    );
    let outcomes = [left.unwrap(), right.unwrap()];
    let created = outcomes
        .iter()
        .filter(|o| matches!(o, OrderOutcome::Created { .. }))
        .count();
    let failed = outcomes
        .iter()
        .filter(|o| matches!(o, OrderOutcome::Failed { .. }))
        .count();
    assert_eq!((created, failed), (1, 1));
    assert_eq!(quantity_of(&fx, "p1").await, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_orders_keep_every_stock_decrement() {
    for round in 0..5u64 {
        let fx = fixture(true).await;
        let mut tasks = Vec::new();
        for n in 0..10u64 {
            let market = fx.market.clone();
            let merchant = fx.merchant.clone();
            tasks.push(tokio::spawn(async move {
                let customer = Keys::generate().public_key().to_hex();
                let event_id = format!("ev-{round}-{n}");
                let request = customer_order(&format!("o-{round}-{n}"), "p1", 1);
                market
                    .create_order(
                        &merchant,
                        &request,
                        OrderSource {
                            customer_pubkey: &customer,
                            event_id: Some(&event_id),
                            event_created_at: Some(10 + n),
                        },
                    )
                    .await
            }));
        }

        let mut created = 0u64;
        for task in tasks {
            if let OrderOutcome::Created { .. } = task.await.unwrap().unwrap() {
                created += 1;
            }
        }
        let left = quantity_of(&fx, "p1").await;
        assert_eq!(created + left, 5, "round {round}");
        assert_eq!(created, 5, "round {round}");
    }
}

#[tokio::test]
async fn republished_listing_does_not_restore_sold_stock() {
    let fx = fixture(true).await;
    let stale = fx
        .store
        .get_product(&fx.merchant.id, "p1")
        .await
        .unwrap()
        .unwrap();
    fx.store
        .update_product_quantities(&fx.merchant.id, &[("p1".to_string(), 1)])
        .await
        .unwrap();

    let published = fx.market.publish_product(&fx.merchant, stale).await.unwrap();
    assert_eq!(published.quantity, 1);
    assert_eq!(quantity_of(&fx, "p1").await, 1);
    assert!(published.event_id.is_some());
}

#[tokio::test]
async fn listing_without_currency_uses_the_stall_currency() {
    let mut fx = fixture(true).await;
    let mut euro = stall("s3", "z1");
    euro.merchant_id = fx.merchant.id.clone();
    euro.currency = "EUR".into();
    fx.store.create_stall(euro).await.unwrap();
    let listing = fx
        .store
        .create_product(&fx.merchant.id, product("p3", "s3", 12.0, 2))
        .await
        .unwrap();
    assert!(listing.config.currency.is_none());
    published_events(&mut fx.frames);

    fx.market.publish_product(&fx.merchant, listing).await.unwrap();
    let event = published_events(&mut fx.frames)
        .into_iter()
        .find(|e| e.kind.as_u16() == KIND_PRODUCT)
        .unwrap();
    let content: serde_json::Value = serde_json::from_str(&event.content).unwrap();
    assert_eq!(content["currency"], "EUR");
}

#[tokio::test]
async fn unavailable_products_cannot_be_ordered() {
    let fx = fixture(true).await;
    let customer = Keys::generate().public_key().to_hex();
    let mut listing = fx
        .store
        .get_product(&fx.merchant.id, "p1")
        .await
        .unwrap()
        .unwrap();

    listing.active = false;
    fx.store
        .update_product(&fx.merchant.id, listing.clone())
        .await
        .unwrap();
    let outcome = fx
        .market
        .create_order(
            &fx.merchant,
            &customer_order("o-off", "p1", 1),
            OrderSource {
                customer_pubkey: &customer,
                event_id: Some("ev-off"),
                event_created_at: Some(10),
            },
        )
        .await
        .unwrap();
    match outcome {
        OrderOutcome::Failed { reason, .. } => assert!(reason.contains("not available")),
        other => panic!("unexpected outcome {other:?}"),
    }

    listing.active = true;
    listing.pending = true;
    fx.store.update_product(&fx.merchant.id, listing).await.unwrap();
    let outcome = fx
        .market
        .create_order(
            &fx.merchant,
            &customer_order("o-pending", "p1", 1),
            OrderSource {
                customer_pubkey: &customer,
                event_id: Some("ev-pending"),
                event_created_at: Some(11),
            },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, OrderOutcome::Failed { .. }));
    assert_eq!(quantity_of(&fx, "p1").await, 5);
    assert_eq!(fx.invoices.issued.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn orders_spanning_stalls_are_rejected() {
    let fx = fixture(true).await;
    fx.market
        .create_stall(&fx.merchant.id, stall("s2", "z1"))
        .await
        .unwrap();
    fx.market
        .create_product(&fx.merchant.id, product("p2", "s2", 500.0, 5))
        .await
        .unwrap();

    let mut request = customer_order("o3", "p1", 1);
    request.items.push(OrderItem {
        product_id: "p2".into(),
        quantity: 1,
    });
    let customer = Keys::generate().public_key().to_hex();
    let outcome = fx
        .market
        .create_order(
            &fx.merchant,
            &request,
            OrderSource {
                customer_pubkey: &customer,
                event_id: None,
                event_created_at: None,
            },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, OrderOutcome::Failed { .. }));
    assert_eq!(quantity_of(&fx, "p1").await, 5);
    assert_eq!(quantity_of(&fx, "p2").await, 5);
}

#[tokio::test]
async fn inactive_merchant_orders_wait_for_restore() {
    let fx = fixture(false).await;
    let customer = Keys::generate();
    let event = order_event(&customer, &fx.merchant, customer_order("o1", "p1", 2));
    fx.market.handle_event(&event).await.unwrap();

    assert!(fx.store.get_order(&fx.merchant.id, "o1").await.unwrap().is_none());
    assert!(outgoing(&fx, &customer).await.is_empty());

    let report = fx.market.restore_from_history(&fx.merchant.id).await.unwrap();
    assert_eq!(report.created, 1);
    let order = fx
        .store
        .get_order(&fx.merchant.id, "o1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.stall_id.as_deref(), Some("s1"));
    assert_eq!(order.total, 2000);
    assert!(order.invoice_id.is_none());
    // restore never moves stock or talks to the customer
    assert_eq!(quantity_of(&fx, "p1").await, 5);
    assert!(outgoing(&fx, &customer).await.is_empty());

    let again = fx.market.restore_from_history(&fx.merchant.id).await.unwrap();
    assert_eq!(again, RestoreReport::default());
    let merchant = fx
        .store
        .get_merchant(&fx.merchant.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!merchant.config.restore_in_progress);
}

#[tokio::test]
async fn reissuing_restored_orders_reserves_stock() {
    let fx = fixture(false).await;
    let first = Keys::generate();
    let second = Keys::generate();
    for (customer, id) in [(&first, "o1"), (&second, "o2")] {
        let event = order_event(customer, &fx.merchant, customer_order(id, "p1", 4));
        fx.market.handle_event(&event).await.unwrap();
    }
    let report = fx.market.restore_from_history(&fx.merchant.id).await.unwrap();
    assert_eq!(report.created, 2);
    assert_eq!(quantity_of(&fx, "p1").await, 5);

    let request = fx
        .market
        .reissue_order(&fx.merchant.id, "o1", None)
        .await
        .unwrap();
    assert_eq!(request.id, "o1");
    assert_eq!(quantity_of(&fx, "p1").await, 1);

    let shortfall = fx.market.reissue_order(&fx.merchant.id, "o2", None).await;
    assert!(matches!(
        shortfall,
        Err(OrderError::Inventory(InventoryError::Shortfall { required: 4, available: 1, .. }))
    ));
    let blocked = fx
        .store
        .get_order(&fx.merchant.id, "o2")
        .await
        .unwrap()
        .unwrap();
    assert!(blocked.invoice_id.is_none());
    assert!(!blocked.extra.stock_reserved);
    assert_eq!(outgoing(&fx, &second).await.len(), 0);

    let paid = fx
        .market
        .handle_order_paid("o1", &fx.merchant.public_key)
        .await
        .unwrap();
    assert!(paid.paid);
    // o1 took its units at reissue, payment does not take them again
    assert_eq!(quantity_of(&fx, "p1").await, 1);

    // paid orders are not reissued and their units stay sold
    let reissue_paid = fx.market.reissue_order(&fx.merchant.id, "o1", None).await;
    assert!(matches!(reissue_paid, Err(OrderError::Transition(_))));
    assert_eq!(quantity_of(&fx, "p1").await, 1);
}

#[tokio::test]
async fn message_cursor_follows_newest_event() {
    let fx = fixture(true).await;
    let before = Cursors::for_merchant(fx.store.as_ref(), &fx.merchant.id)
        .await
        .unwrap();
    assert_eq!(before.messages, 0);

    let customer = Keys::generate();
    let event = order_event(&customer, &fx.merchant, customer_order("o1", "p1", 1));
    fx.market.handle_event(&event).await.unwrap();

    let after = Cursors::for_merchant(fx.store.as_ref(), &fx.merchant.id)
        .await
        .unwrap();
    assert!(after.messages >= event.created_at.as_u64());
}

#[tokio::test]
async fn shipping_follows_payment_and_cannot_be_undone() {
    let fx = fixture(true).await;
    let customer = Keys::generate();
    let event = order_event(&customer, &fx.merchant, customer_order("o1", "p1", 1));
    fx.market.handle_event(&event).await.unwrap();

    let early = fx
        .market
        .update_order_shipped(&fx.merchant.id, "o1", true, None)
        .await;
    assert!(matches!(early, Err(OrderError::Transition(_))));

    fx.market
        .handle_order_paid("o1", &fx.merchant.public_key)
        .await
        .unwrap();
    let shipped = fx
        .market
        .update_order_shipped(&fx.merchant.id, "o1", true, Some("On its way".into()))
        .await
        .unwrap();
    assert!(shipped.shipped);

    let undo = fx
        .market
        .update_order_shipped(&fx.merchant.id, "o1", false, None)
        .await;
    assert!(matches!(undo, Err(OrderError::Transition(_))));
}

#[tokio::test]
async fn foreign_listing_is_imported_as_pending() {
    let mut fx = fixture(true).await;

    let content = r#"{"id":"s9","name":"Imported","currency":"sat","shipping":[{"id":"z9","cost":2,"regions":["EU"]}]}"#;
    let event = sign_event(
        build_event_with_tags(KIND_STALL, content, vec![vec!["d".into(), "s9".into()]]),
        &fx.merchant_keys,
    )
    .unwrap();
    fx.market.handle_event(&event).await.unwrap();

    let imported = fx
        .store
        .get_stall(&fx.merchant.id, "s9")
        .await
        .unwrap()
        .unwrap();
    assert!(imported.pending);
    assert_eq!(imported.shipping_zones[0].countries, vec!["EU".to_string()]);

    // our own listing coming back leaves the local copy alone
    let own = published_events(&mut fx.frames)
        .into_iter()
        .find(|e| e.kind.as_u16() == KIND_STALL)
        .unwrap();
    fx.market.handle_event(&own).await.unwrap();
    let local = fx
        .store
        .get_stall(&fx.merchant.id, "s1")
        .await
        .unwrap()
        .unwrap();
    assert!(!local.pending);
    assert_eq!(local.wallet, "wallet-1");
}

#[tokio::test]
async fn customer_profile_is_cached() {
    let fx = fixture(true).await;
    let customer = Keys::generate();
    let event = order_event(&customer, &fx.merchant, customer_order("o1", "p1", 1));
    fx.market.handle_event(&event).await.unwrap();

    let profile = sign_event(
        build_event_with_tags(KIND_METADATA, r#"{"name":"alice","about":"buyer"}"#, vec![]),
        &customer,
    )
    .unwrap();
    fx.market.handle_event(&profile).await.unwrap();

    let row = fx
        .store
        .get_customer(&fx.merchant.id, &customer.public_key().to_hex())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.profile.unwrap().name.as_deref(), Some("alice"));
    assert_eq!(row.event_created_at, Some(profile.created_at.as_u64()));
}
