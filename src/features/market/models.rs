#![forbid(unsafe_code)]

use nostr::key::Keys;
use serde::{Deserialize, Serialize};

use crate::features::market::orders::OrderStatus;

fn default_true() -> bool {
    true
}

fn default_sat() -> String {
    "sat".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerchantProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lud16: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerchantConfig {
    #[serde(default)]
    pub profile: MerchantProfile,
    /// Gates automatic order processing for incoming messages.
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub restore_in_progress: bool,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub event_created_at: Option<u64>,
}

impl Default for MerchantConfig {
    fn default() -> Self {
        Self {
            profile: MerchantProfile::default(),
            active: true,
            restore_in_progress: false,
            event_id: None,
            event_created_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Merchant {
    pub id: String,
    pub private_key: String,
    pub public_key: String,
    pub config: MerchantConfig,
    /// Last liveness touch, unix seconds.
    #[serde(default)]
    pub time: Option<u64>,
}

impl Merchant {
    pub fn keys(&self) -> Result<Keys, nostr::key::Error> {
        Keys::parse(&self.private_key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub currency: String,
    pub cost: f64,
    #[serde(default)]
    pub countries: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StallConfig {
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stall {
    pub id: String,
    pub merchant_id: String,
    pub wallet: String,
    pub name: String,
    #[serde(default = "default_sat")]
    pub currency: String,
    #[serde(default)]
    pub shipping_zones: Vec<Zone>,
    #[serde(default)]
    pub config: StallConfig,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub event_created_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductShippingCost {
    pub id: String,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductConfig {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub use_autoreply: bool,
    #[serde(default)]
    pub autoreply_message: Option<String>,
    /// Per-zone surcharge on top of the zone's base cost.
    #[serde(default)]
    pub shipping: Vec<ProductShippingCost>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub stall_id: String,
    pub name: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    pub price: f64,
    pub quantity: u64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub config: ProductConfig,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub event_created_at: Option<u64>,
}

impl Product {
    pub fn shipping_surcharge(&self, zone_id: &str) -> f64 {
        self.config
            .shipping
            .iter()
            .find(|s| s.id == zone_id)
            .map(|s| s.cost)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: String,
    pub quantity: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderContact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nostr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Price of one product frozen at order time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductOverview {
    pub id: String,
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub product_shipping_cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderExtra {
    #[serde(default)]
    pub products: Vec<ProductOverview>,
    #[serde(default = "default_sat")]
    pub currency: String,
    /// Sats per unit of `currency` at order time.
    #[serde(default)]
    pub btc_price: f64,
    #[serde(default)]
    pub shipping_cost: f64,
    #[serde(default)]
    pub shipping_cost_sat: f64,
    #[serde(default)]
    pub fail_message: Option<String>,
    /// Stock for this order has already been taken from the catalog.
    #[serde(default)]
    pub stock_reserved: bool,
    #[serde(default)]
    pub payment_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub merchant_id: String,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub event_created_at: Option<u64>,
    /// Customer public key.
    pub public_key: String,
    pub merchant_public_key: String,
    pub shipping_id: String,
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub contact: Option<OrderContact>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub stall_id: Option<String>,
    #[serde(default)]
    pub invoice_id: Option<String>,
    /// Total in sats.
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub paid: bool,
    #[serde(default)]
    pub shipped: bool,
    pub time: u64,
    #[serde(default)]
    pub extra: OrderExtra,
}

impl Order {
    pub fn status(&self) -> OrderStatus {
        if self.extra.fail_message.is_some() {
            OrderStatus::Failed
        } else if self.shipped {
            OrderStatus::Shipped
        } else if self.paid {
            OrderStatus::Paid
        } else if self.invoice_id.is_some() {
            OrderStatus::InvoiceIssued
        } else if self.stall_id.is_some() {
            OrderStatus::Priced
        } else {
            OrderStatus::Requested
        }
    }
}

/// Discriminant carried in the `type` field of structured messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum DirectMessageType {
    PlainText,
    CustomerOrder,
    PaymentRequest,
    OrderPaidOrShipped,
}

impl DirectMessageType {
    pub fn is_order_related(self) -> bool {
        !matches!(self, DirectMessageType::PlainText)
    }
}

impl From<DirectMessageType> for i8 {
    fn from(value: DirectMessageType) -> Self {
        match value {
            DirectMessageType::PlainText => -1,
            DirectMessageType::CustomerOrder => 0,
            DirectMessageType::PaymentRequest => 1,
            DirectMessageType::OrderPaidOrShipped => 2,
        }
    }
}

impl TryFrom<i8> for DirectMessageType {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::PlainText),
            0 => Ok(Self::CustomerOrder),
            1 => Ok(Self::PaymentRequest),
            2 => Ok(Self::OrderPaidOrShipped),
            other => Err(format!("unknown direct message type {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: String,
    pub merchant_id: String,
    pub event_id: String,
    pub event_created_at: u64,
    pub message: String,
    /// Counterparty public key.
    pub public_key: String,
    pub incoming: bool,
    #[serde(rename = "type")]
    pub type_: DirectMessageType,
    pub time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub about: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub merchant_id: String,
    pub public_key: String,
    #[serde(default)]
    pub event_created_at: Option<u64>,
    #[serde(default)]
    pub profile: Option<CustomerProfile>,
    #[serde(default)]
    pub unread_messages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerOrder {
    pub id: String,
    pub shipping_id: String,
    pub items: Vec<OrderItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<OrderContact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOption {
    #[serde(rename = "type")]
    pub type_: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub payment_options: Vec<PaymentOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipped: Option<bool>,
}

/// Decrypted direct message body.
#[derive(Debug, Clone, PartialEq)]
pub enum DmPayload {
    CustomerOrder(CustomerOrder),
    PaymentRequest(PaymentRequest),
    OrderStatus(OrderStatusUpdate),
    PlainText(String),
}

impl DmPayload {
    pub fn message_type(&self) -> DirectMessageType {
        match self {
            DmPayload::CustomerOrder(_) => DirectMessageType::CustomerOrder,
            DmPayload::PaymentRequest(_) => DirectMessageType::PaymentRequest,
            DmPayload::OrderStatus(_) => DirectMessageType::OrderPaidOrShipped,
            DmPayload::PlainText(_) => DirectMessageType::PlainText,
        }
    }

    /// Parses a message body; anything without a known `type` is plain text.
    pub fn classify(text: &str) -> Self {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return DmPayload::PlainText(text.to_string());
        };
        let type_ = value
            .get("type")
            .and_then(|t| t.as_i64())
            .and_then(|t| i8::try_from(t).ok())
            .and_then(|t| DirectMessageType::try_from(t).ok());

        let parsed = match type_ {
            Some(DirectMessageType::CustomerOrder) => {
                serde_json::from_value(value).ok().map(DmPayload::CustomerOrder)
            }
            Some(DirectMessageType::PaymentRequest) => {
                serde_json::from_value(value).ok().map(DmPayload::PaymentRequest)
            }
            Some(DirectMessageType::OrderPaidOrShipped) => {
                serde_json::from_value(value).ok().map(DmPayload::OrderStatus)
            }
            _ => None,
        };
        parsed.unwrap_or_else(|| DmPayload::PlainText(text.to_string()))
    }

    /// Wire body: structured payloads carry their `type` discriminant.
    pub fn to_message(&self) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct Tagged<'a, T: Serialize> {
            #[serde(rename = "type")]
            type_: i8,
            #[serde(flatten)]
            payload: &'a T,
        }

        let type_ = i8::from(self.message_type());
        match self {
            DmPayload::CustomerOrder(p) => serde_json::to_string(&Tagged { type_, payload: p }),
            DmPayload::PaymentRequest(p) => serde_json::to_string(&Tagged { type_, payload: p }),
            DmPayload::OrderStatus(p) => serde_json::to_string(&Tagged { type_, payload: p }),
            DmPayload::PlainText(text) => Ok(text.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_falls_back_to_plain_text() {
        assert_eq!(
            DmPayload::classify("hello there"),
            DmPayload::PlainText("hello there".into())
        );
        assert_eq!(
            DmPayload::classify(r#"{"type": 9, "id": "x"}"#).message_type(),
            DirectMessageType::PlainText
        );
        assert_eq!(
            DmPayload::classify(r#"{"id": "x"}"#).message_type(),
            DirectMessageType::PlainText
        );
        // known type but wrong shape
        assert_eq!(
            DmPayload::classify(r#"{"type": 0, "id": "x"}"#).message_type(),
            DirectMessageType::PlainText
        );
    }

    #[test]
    fn classify_customer_order() {
        let body = r#"{"type":0,"id":"o1","shipping_id":"z1","items":[{"product_id":"p1","quantity":2}]}"#;
        match DmPayload::classify(body) {
            DmPayload::CustomerOrder(order) => {
                assert_eq!(order.id, "o1");
                assert_eq!(order.items[0].quantity, 2);
                assert!(order.contact.is_none());
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn structured_message_carries_type() {
        let payload = DmPayload::OrderStatus(OrderStatusUpdate {
            id: "o1".into(),
            message: None,
            paid: Some(true),
            shipped: None,
        });
        let text = payload.to_message().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], 2);
        assert_eq!(value["paid"], true);
        assert_eq!(DmPayload::classify(&text), payload);
    }

    #[test]
    fn message_type_serializes_as_number() {
        let json = serde_json::to_string(&DirectMessageType::PaymentRequest).unwrap();
        assert_eq!(json, "1");
        let parsed: DirectMessageType = serde_json::from_str("-1").unwrap();
        assert_eq!(parsed, DirectMessageType::PlainText);
    }
}
