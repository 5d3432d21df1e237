//! Process wiring: store selection, the wallet facade, metrics and the
//! background sweeper.

use crate::config::Config;
use anyhow::Context;
use prometheus::Registry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use wallet_core::{MemoryStore, PgStore, Wallet, WalletStore};

/// Build the wallet over Postgres, or over the in-process store when
/// `database.in_memory` is set.
pub async fn build_wallet(config: &Config) -> anyhow::Result<Arc<Wallet>> {
    let store: Arc<dyn WalletStore> = if config.database.in_memory {
        warn!("Using the in-memory store; balances are lost on restart");
        Arc::new(MemoryStore::new())
    } else {
        let store = PgStore::connect(&config.database.url, config.database.max_connections)
            .await
            .context("Failed to connect to database")?;
        if config.database.run_migrations {
            store.migrate().await.context("Failed to run migrations")?;
            info!("Database migrations applied");
        }
        Arc::new(store)
    };

    let wallet = Wallet::from_config(store, config.wallet.clone())
        .context("Invalid wallet configuration")?;
    Ok(Arc::new(wallet))
}

/// Registry with the wallet counters registered
pub fn metrics_registry() -> anyhow::Result<Registry> {
    let registry = Registry::new();
    wallet_core::metrics::register_metrics(&registry).context("Failed to register metrics")?;
    Ok(registry)
}

/// Start the expiry sweeper unless disabled
pub fn spawn_sweeper(wallet: &Wallet) -> Option<JoinHandle<()>> {
    if !wallet.config().sweeper.enabled {
        info!("Expiry sweeper disabled");
        return None;
    }
    let sweeper = wallet.sweeper();
    Some(tokio::spawn(sweeper.start_loop()))
}
