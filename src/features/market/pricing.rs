use std::fmt::Write as _;

use crate::{
    features::market::models::{Product, ProductOverview, Zone},
    infra::rates::{ExchangeRates, RateError, rate_for},
};

/// One order line ready for costing.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteLine {
    pub product_id: String,
    pub name: String,
    pub price: f64,
    pub currency: String,
    /// Product-specific surcharge for the chosen zone, in `currency`.
    pub surcharge: f64,
    pub quantity: u64,
}

impl QuoteLine {
    pub fn from_product(product: &Product, stall_currency: &str, zone_id: &str, quantity: u64) -> Self {
        Self {
            product_id: product.id.clone(),
            name: product.name.clone(),
            price: product.price,
            currency: product
                .config
                .currency
                .clone()
                .unwrap_or_else(|| stall_currency.to_string()),
            surcharge: product.shipping_surcharge(zone_id),
            quantity,
        }
    }

    pub fn subtotal(&self) -> f64 {
        self.quantity as f64 * (self.price + self.surcharge)
    }
}

/// Priced order: every amount converted to sats at the captured rates.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderQuote {
    pub lines: Vec<QuoteLine>,
    pub currency: String,
    /// Sats per unit of `currency`.
    pub btc_price: f64,
    pub shipping_cost: f64,
    pub shipping_cost_sat: f64,
    pub product_cost_sat: f64,
}

impl OrderQuote {
    pub fn total_sat(&self) -> u64 {
        (self.product_cost_sat + self.shipping_cost_sat).round().max(0.0) as u64
    }

    /// Frozen price snapshot kept on the order.
    pub fn overview(&self) -> Vec<ProductOverview> {
        self.lines
            .iter()
            .map(|line| ProductOverview {
                id: line.product_id.clone(),
                name: line.name.clone(),
                price: line.price,
                currency: Some(line.currency.clone()),
                product_shipping_cost: line.surcharge,
            })
            .collect()
    }

    /// Itemized receipt sent with the payment request.
    pub fn receipt(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            let _ = writeln!(
                out,
                "{}: {} x ({} + {}) = {} {}",
                line.name,
                line.quantity,
                line.price,
                line.surcharge,
                line.subtotal(),
                line.currency
            );
        }
        let _ = writeln!(out, "Product cost: {} sat", self.product_cost_sat.round());
        let _ = writeln!(out, "Shipping cost: {} sat", self.shipping_cost_sat.round());
        let _ = write!(out, "Total: {} sat", self.total_sat());
        out
    }
}

/// Converts each line at its own currency's rate and the zone cost at the zone's rate.
pub async fn quote_order(
    rates: &dyn ExchangeRates,
    lines: Vec<QuoteLine>,
    zone: &Zone,
) -> Result<OrderQuote, RateError> {
    let mut product_cost_sat = 0.0;
    for line in &lines {
        let rate = rate_for(rates, &line.currency).await?;
        product_cost_sat += line.subtotal() * rate;
    }
    let shipping_cost_sat = zone.cost * rate_for(rates, &zone.currency).await?;

    let currency = lines
        .first()
        .map(|l| l.currency.clone())
        .unwrap_or_else(|| zone.currency.clone());
    let btc_price = rate_for(rates, &currency).await?;

    Ok(OrderQuote {
        lines,
        currency,
        btc_price,
        shipping_cost: zone.cost,
        shipping_cost_sat,
        product_cost_sat,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::rates::FixedRates;

    fn line(id: &str, price: f64, currency: &str, surcharge: f64, quantity: u64) -> QuoteLine {
        QuoteLine {
            product_id: id.into(),
            name: format!("Product {id}"),
            price,
            currency: currency.into(),
            surcharge,
            quantity,
        }
    }

    fn zone(cost: f64, currency: &str) -> Zone {
        Zone {
            id: "z1".into(),
            name: Some("Local".into()),
            currency: currency.into(),
            cost,
            countries: vec![],
        }
    }

    #[tokio::test]
    async fn total_is_quantity_times_price_plus_surcharge_plus_zone() {
        let rates = FixedRates::default();
        let quote = quote_order(
            &rates,
            vec![line("p1", 1000.0, "sat", 10.0, 2), line("p2", 50.0, "sat", 0.0, 3)],
            &zone(100.0, "sat"),
        )
        .await
        .unwrap();
        assert_eq!(quote.product_cost_sat, 2170.0);
        assert_eq!(quote.shipping_cost_sat, 100.0);
        assert_eq!(quote.total_sat(), 2270);
    }

    #[tokio::test]
    async fn lines_convert_at_their_own_currency() {
        let rates = FixedRates::new([("usd".to_string(), 2000.0), ("eur".to_string(), 2500.0)]);
        let quote = quote_order(
            &rates,
            vec![line("p1", 1.5, "usd", 0.0, 2), line("p2", 1.0, "eur", 0.0, 1)],
            &zone(2.0, "eur"),
        )
        .await
        .unwrap();
        assert_eq!(quote.product_cost_sat, 6000.0 + 2500.0);
        assert_eq!(quote.shipping_cost_sat, 5000.0);
        assert_eq!(quote.currency, "usd");
        assert_eq!(quote.btc_price, 2000.0);
        assert_eq!(quote.total_sat(), 13_500);
    }

    #[tokio::test]
    async fn missing_rate_is_an_error() {
        let rates = FixedRates::default();
        let err = quote_order(&rates, vec![line("p1", 1.0, "usd", 0.0, 1)], &zone(0.0, "sat")).await;
        assert!(matches!(err, Err(RateError::UnknownCurrency(_))));
    }

    #[tokio::test]
    async fn receipt_lists_lines_and_totals() {
        let quote = quote_order(
            &FixedRates::default(),
            vec![line("p1", 1000.0, "sat", 0.0, 2)],
            &zone(0.0, "sat"),
        )
        .await
        .unwrap();
        let receipt = quote.receipt();
        assert!(receipt.contains("Product p1: 2 x (1000 + 0) = 2000 sat"));
        assert!(receipt.contains("Shipping cost: 0 sat"));
        assert!(receipt.ends_with("Total: 2000 sat"));
    }
}
