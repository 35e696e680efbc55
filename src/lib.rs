pub mod adapters;
pub mod cli;
pub mod config;
pub mod infra;
pub mod souk;

pub mod features {
    pub mod market;
}

pub use cli::Args as cli_args;

use anyhow::Result;
use tracing::{info, warn};

use crate::{
    features::market::{Market, models::MerchantProfile},
    souk::Souk,
};

async fn seed_merchants(market: &Market, seeds: &[config::MerchantSeed]) {
    for seed in seeds {
        let profile = MerchantProfile {
            name: seed.name.clone(),
            about: seed.about.clone(),
            ..MerchantProfile::default()
        };
        match market
            .register_merchant(&seed.private_key, profile, seed.active.unwrap_or(true))
            .await
        {
            Ok(merchant) => info!("Merchant {} ready ({})", merchant.id, merchant.public_key),
            Err(e) => warn!("Failed to register configured merchant: {e}"),
        }
    }
}

async fn republish_catalogs(market: &Market) -> Result<()> {
    for merchant in market.store().list_merchants().await? {
        if let Err(e) = market.republish_all(&merchant).await {
            warn!("Failed to republish catalog of merchant {}: {e}", merchant.id);
        } else {
            info!("Republished catalog of merchant {}", merchant.id);
        }
    }
    Ok(())
}

pub async fn run_souk(settings: &config::Settings, args: &cli_args) -> Result<()> {
    let (souk, handle) = Souk::start(&settings.config)?;
    let market = souk.market.clone();

    seed_merchants(&market, &settings.merchants).await;
    market.sync_subscription(true).await?;

    if let Some(merchant_id) = &args.restore {
        match market.restore_from_history(merchant_id).await {
            Ok(report) => info!(
                "Restore of {merchant_id}: {} created, {} repaired, {} updated",
                report.created, report.repaired, report.updated
            ),
            Err(e) => warn!("Restore of {merchant_id} failed: {e}"),
        }
    }
    if args.republish {
        republish_catalogs(&market).await?;
    }

    let stop_handle = handle.clone();
    let stopped = handle.stopped();
    tokio::pin!(stopped);

    let shutdown = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("Failed to listen for shutdown signal: {e}");
            }
            true
        }
        _ = &mut stopped => false,
    };
    if shutdown {
        info!("Shutting down...");
        stop_handle.stop().await;
        stopped.await;
    }

    Ok(())
}
