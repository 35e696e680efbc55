use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{config::PaymentsConfig, infra::store::Store};

/// Tag attached to every invoice this agent issues.
pub const PAYMENT_TAG: &str = "souk";

#[derive(Debug, Error)]
pub enum InvoiceError {
    #[error("Payment rail is not configured")]
    NotConfigured,

    #[error("No invoice key for wallet '{0}'")]
    UnknownWallet(String),

    #[error("Payment rail request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Payment rail rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceRequest {
    pub wallet: String,
    pub amount_sat: u64,
    pub memo: String,
    pub order_id: String,
    pub merchant_pubkey: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub invoice_id: String,
    pub pay_text: String,
}

/// Settlement notification correlated back to an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledPayment {
    pub order_id: String,
    pub merchant_pubkey: String,
}

#[async_trait]
pub trait InvoiceIssuer: Send + Sync {
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice, InvoiceError>;

    async fn is_paid(&self, wallet: &str, invoice_id: &str) -> Result<bool, InvoiceError>;
}

/// LNbits-compatible payment rail.
pub struct LnbitsInvoiceIssuer {
    http: reqwest::Client,
    url: String,
    default_key: Option<String>,
    wallet_keys: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CreatedInvoice {
    payment_hash: String,
    #[serde(alias = "bolt11")]
    payment_request: String,
}

#[derive(Debug, Deserialize)]
struct PaymentStatus {
    #[serde(default)]
    paid: bool,
}

impl LnbitsInvoiceIssuer {
    pub fn from_config(config: &PaymentsConfig) -> Result<Self, InvoiceError> {
        let url = config.url.clone().ok_or(InvoiceError::NotConfigured)?;
        Ok(Self {
            http: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
            default_key: config.default_key.clone(),
            wallet_keys: config.wallet_keys.clone(),
        })
    }

    fn key_for(&self, wallet: &str) -> Result<&str, InvoiceError> {
        self.wallet_keys
            .get(wallet)
            .or(self.default_key.as_ref())
            .map(String::as_str)
            .ok_or_else(|| InvoiceError::UnknownWallet(wallet.to_string()))
    }
}

#[async_trait]
impl InvoiceIssuer for LnbitsInvoiceIssuer {
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<Invoice, InvoiceError> {
        let key = self.key_for(&request.wallet)?;
        let body = json!({
            "out": false,
            "amount": request.amount_sat,
            "memo": request.memo,
            "extra": {
                "tag": PAYMENT_TAG,
                "order_id": request.order_id,
                "merchant_pubkey": request.merchant_pubkey,
            },
        });
        let response = self
            .http
            .post(format!("{}/api/v1/payments", self.url))
            .header("X-Api-Key", key)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(InvoiceError::Rejected(format!("{status}: {text}")));
        }
        let created: CreatedInvoice = response.json().await?;
        info!(
            "Created invoice {} for order {} ({} sat)",
            created.payment_hash, request.order_id, request.amount_sat
        );
        Ok(Invoice {
            invoice_id: created.payment_hash,
            pay_text: created.payment_request,
        })
    }

    async fn is_paid(&self, wallet: &str, invoice_id: &str) -> Result<bool, InvoiceError> {
        let key = self.key_for(wallet)?;
        let response = self
            .http
            .get(format!("{}/api/v1/payments/{invoice_id}", self.url))
            .header("X-Api-Key", key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(InvoiceError::Rejected(response.status().to_string()));
        }
        let status: PaymentStatus = response.json().await?;
        Ok(status.paid)
    }
}

/// Stand-in rail used when no payment url is configured; every request fails.
pub struct DisabledInvoiceIssuer;

#[async_trait]
impl InvoiceIssuer for DisabledInvoiceIssuer {
    async fn create_invoice(&self, _request: &InvoiceRequest) -> Result<Invoice, InvoiceError> {
        Err(InvoiceError::NotConfigured)
    }

    async fn is_paid(&self, _wallet: &str, _invoice_id: &str) -> Result<bool, InvoiceError> {
        Err(InvoiceError::NotConfigured)
    }
}

/// Picks the configured rail, falling back to [`DisabledInvoiceIssuer`].
pub fn issuer_from_config(config: &PaymentsConfig) -> Arc<dyn InvoiceIssuer> {
    match LnbitsInvoiceIssuer::from_config(config) {
        Ok(issuer) => Arc::new(issuer),
        Err(_) => {
            warn!("No payment rail configured, orders will not receive invoices");
            Arc::new(DisabledInvoiceIssuer)
        }
    }
}

/// Polls unpaid invoices and emits a [`SettledPayment`] for each one the rail reports paid.
pub async fn watch_settlements(
    issuer: Arc<dyn InvoiceIssuer>,
    store: Arc<dyn Store>,
    settled: mpsc::Sender<SettledPayment>,
    interval: Duration,
    cancel: CancellationToken,
) {
    info!("Watching invoice settlements every {}s", interval.as_secs());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let orders = match store.list_unpaid_orders().await {
            Ok(orders) => orders,
            Err(err) => {
                warn!("settlements: failed to list unpaid orders: {err}");
                continue;
            }
        };

        for order in orders {
            let (Some(invoice_id), Some(stall_id)) = (&order.invoice_id, &order.stall_id) else {
                continue;
            };
            let wallet = match store.get_stall(&order.merchant_id, stall_id).await {
                Ok(Some(stall)) => stall.wallet,
                Ok(None) => {
                    debug!("settlements: stall {stall_id} for order {} is gone", order.id);
                    continue;
                }
                Err(err) => {
                    warn!("settlements: failed to load stall {stall_id}: {err}");
                    continue;
                }
            };
            match issuer.is_paid(&wallet, invoice_id).await {
                Ok(true) => {
                    let payment = SettledPayment {
                        order_id: order.id.clone(),
                        merchant_pubkey: order.merchant_public_key.clone(),
                    };
                    if settled.send(payment).await.is_err() {
                        return;
                    }
                }
                Ok(false) => {}
                Err(err) => warn!("settlements: status check for {invoice_id} failed: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallet_key_falls_back_to_default() {
        let mut config = PaymentsConfig {
            url: Some("https://pay.example/".into()),
            default_key: None,
            wallet_keys: HashMap::from([("w1".to_string(), "k1".to_string())]),
            poll_secs: 10,
        };
        let issuer = LnbitsInvoiceIssuer::from_config(&config).unwrap();
        assert_eq!(issuer.url, "https://pay.example");
        assert_eq!(issuer.key_for("w1").unwrap(), "k1");
        assert!(matches!(
            issuer.key_for("w2"),
            Err(InvoiceError::UnknownWallet(_))
        ));

        config.default_key = Some("fallback".into());
        let issuer = LnbitsInvoiceIssuer::from_config(&config).unwrap();
        assert_eq!(issuer.key_for("w2").unwrap(), "fallback");
    }

    #[test]
    fn unconfigured_rail_is_rejected() {
        assert!(matches!(
            LnbitsInvoiceIssuer::from_config(&PaymentsConfig::default()),
            Err(InvoiceError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn disabled_rail_refuses_invoices() {
        let issuer = issuer_from_config(&PaymentsConfig::default());
        let request = InvoiceRequest {
            wallet: "w1".into(),
            amount_sat: 10,
            memo: "order".into(),
            order_id: "o1".into(),
            merchant_pubkey: "pk".into(),
        };
        assert!(matches!(
            issuer.create_invoice(&request).await,
            Err(InvoiceError::NotConfigured)
        ));
    }
}
