use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub const SAT: &str = "sat";
const SATS_PER_BTC: f64 = 100_000_000.0;

#[derive(Debug, Error)]
pub enum RateError {
    #[error("Exchange rate service is not configured")]
    NotConfigured,

    #[error("No exchange rate for currency '{0}'")]
    UnknownCurrency(String),

    #[error("Exchange rate request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait ExchangeRates: Send + Sync {
    /// Sats per one unit of `currency`.
    async fn sats_per_unit(&self, currency: &str) -> Result<f64, RateError>;
}

pub fn is_sat(currency: &str) -> bool {
    currency.eq_ignore_ascii_case(SAT)
}

/// Rate used to convert `currency` into sats; `sat` itself is 1.
pub async fn rate_for(rates: &dyn ExchangeRates, currency: &str) -> Result<f64, RateError> {
    if is_sat(currency) {
        Ok(1.0)
    } else {
        rates.sats_per_unit(currency).await
    }
}

/// Coinbase-style `exchange-rates?currency=BTC` endpoint.
pub struct HttpExchangeRates {
    http: reqwest::Client,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RatesResponse {
    data: RatesData,
}

#[derive(Debug, Deserialize)]
struct RatesData {
    rates: HashMap<String, String>,
}

impl HttpExchangeRates {
    pub fn new(url: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl ExchangeRates for HttpExchangeRates {
    async fn sats_per_unit(&self, currency: &str) -> Result<f64, RateError> {
        let url = self.url.as_deref().ok_or(RateError::NotConfigured)?;
        let response: RatesResponse = self.http.get(url).send().await?.json().await?;
        let units_per_btc = response
            .data
            .rates
            .get(&currency.to_uppercase())
            .and_then(|r| r.parse::<f64>().ok())
            .filter(|r| *r > 0.0)
            .ok_or_else(|| RateError::UnknownCurrency(currency.to_string()))?;
        Ok(SATS_PER_BTC / units_per_btc)
    }
}

/// Static table, for offline operation and tests.
#[derive(Debug, Clone, Default)]
pub struct FixedRates {
    rates: HashMap<String, f64>,
}

impl FixedRates {
    pub fn new(rates: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            rates: rates
                .into_iter()
                .map(|(currency, rate)| (currency.to_uppercase(), rate))
                .collect(),
        }
    }
}

#[async_trait]
impl ExchangeRates for FixedRates {
    async fn sats_per_unit(&self, currency: &str) -> Result<f64, RateError> {
        self.rates
            .get(&currency.to_uppercase())
            .copied()
            .ok_or_else(|| RateError::UnknownCurrency(currency.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sat_needs_no_lookup() {
        let rates = FixedRates::default();
        assert_eq!(rate_for(&rates, "sat").await.unwrap(), 1.0);
        assert_eq!(rate_for(&rates, "SAT").await.unwrap(), 1.0);
        assert!(matches!(
            rate_for(&rates, "usd").await,
            Err(RateError::UnknownCurrency(_))
        ));
    }

    #[tokio::test]
    async fn fixed_rates_are_case_insensitive() {
        let rates = FixedRates::new([("usd".to_string(), 1500.0)]);
        assert_eq!(rate_for(&rates, "USD").await.unwrap(), 1500.0);
    }

    #[test]
    fn parses_coinbase_payload() {
        let body = r#"{"data":{"currency":"BTC","rates":{"USD":"50000.0","EUR":"46000"}}}"#;
        let parsed: RatesResponse = serde_json::from_str(body).unwrap();
        let usd: f64 = parsed.data.rates["USD"].parse().unwrap();
        assert_eq!(SATS_PER_BTC / usd, 2000.0);
    }
}
