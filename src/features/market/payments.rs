use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    features::market::{ErrorKind, Market},
    infra::invoice::SettledPayment,
};

/// Applies settlement notifications to orders until cancelled or the rail hangs up.
pub async fn run_payment_bridge(
    market: Arc<Market>,
    mut settled: mpsc::Receiver<SettledPayment>,
    cancel: CancellationToken,
) {
    info!("Payment bridge started");
    loop {
        let payment = tokio::select! {
            _ = cancel.cancelled() => break,
            payment = settled.recv() => match payment {
                Some(payment) => payment,
                None => break,
            },
        };

        match market
            .handle_order_paid(&payment.order_id, &payment.merchant_pubkey)
            .await
        {
            Ok(order) => info!("Order {} settled for merchant {}", order.id, order.merchant_id),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("payments: settlement for unknown order {}: {err}", payment.order_id);
            }
            Err(err) => error!("payments: order {} could not be marked paid: {err}", payment.order_id),
        }
    }
    info!("Payment bridge stopped");
}
