use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::Configuration,
    features::market::{Market, payments::run_payment_bridge, subscriber::subscriber},
    infra::{
        invoice::{issuer_from_config, watch_settlements},
        notify::LiveNotifier,
        rates::HttpExchangeRates,
        relay::RelayLink,
        store::{MemoryStore, Store},
    },
};

const SETTLEMENT_CAPACITY: usize = 64;

pub struct Souk {
    pub market: Arc<Market>,
}

pub struct SoukHandle {
    market: Arc<Market>,
    cancel: CancellationToken,
    grace: Duration,
    join: Option<JoinHandle<()>>,
}

impl Clone for SoukHandle {
    fn clone(&self) -> Self {
        Self {
            market: Arc::clone(&self.market),
            cancel: self.cancel.clone(),
            grace: self.grace,
            join: None, // only the original handle joins the workers
        }
    }
}

impl SoukHandle {
    /// Closes the cohort subscription, gives the link time to flush it, then cancels every task.
    pub async fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.market.close_subscription().await;
        tokio::time::sleep(self.grace).await;
        self.cancel.cancel();
    }

    pub async fn stopped(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

fn open_store(config: &Configuration) -> Result<Arc<dyn Store>> {
    Ok(match &config.data_path {
        Some(path) => {
            info!("Using snapshot store at {path}");
            Arc::new(MemoryStore::open(path)?)
        }
        None => {
            warn!("No data_path configured, state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    })
}

impl Souk {
    /// Wires the store, payment rail, rates and relay link together and starts the workers.
    pub fn start(config: &Configuration) -> Result<(Self, SoukHandle)> {
        let store = open_store(config)?;
        let (link, relay, inbox) = RelayLink::new(config.relay_url.clone(), config.link.clone());
        let invoices = issuer_from_config(&config.payments);
        let rates = Arc::new(HttpExchangeRates::new(config.rates.url.clone()));

        let market = Arc::new(Market::new(
            store.clone(),
            relay,
            invoices.clone(),
            rates,
            LiveNotifier::default(),
            config.market.clone(),
        ));

        let cancel = CancellationToken::new();
        let (settled_tx, settled_rx) = mpsc::channel(SETTLEMENT_CAPACITY);

        let mut tasks = vec![
            tokio::spawn(link.run(cancel.clone())),
            tokio::spawn(subscriber(market.clone(), inbox, cancel.clone())),
            tokio::spawn(run_payment_bridge(
                market.clone(),
                settled_rx,
                cancel.clone(),
            )),
        ];
        // without a rail the sender stays parked so the bridge waits for cancellation
        let mut idle_sender = None;
        if config.payments.url.is_some() {
            tasks.push(tokio::spawn(watch_settlements(
                invoices,
                store,
                settled_tx,
                config.payments.poll(),
                cancel.clone(),
            )));
        } else {
            idle_sender = Some(settled_tx);
        }

        let join = tokio::spawn(async move {
            let _idle_sender = idle_sender;
            for task in tasks {
                if let Err(err) = task.await {
                    warn!("Worker ended abnormally: {err}");
                }
            }
        });

        let handle = SoukHandle {
            market: market.clone(),
            cancel,
            grace: config.link.grace(),
            join: Some(join),
        };
        Ok((Self { market }, handle))
    }
}
