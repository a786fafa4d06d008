//! Bridge Validator - ledger snapshots and Merkle root commits across two chains
//!
//! This validator scans swap and claim activity on both bridged chains, builds
//! the next ledger snapshot and co-signs the lock and update-root cycle with
//! the other validators.

use anyhow::{Context, Result};
use ethers::signers::{LocalWallet, Signer};
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};

use bridge_validator::chain::{ChainAdapter, ChainManager};
use bridge_validator::config::Settings;
use bridge_validator::coordinator::{BridgeSide, Coordinator};
use bridge_validator::ledger::{builder_for, TokenRegistry};
use bridge_validator::metrics::{HealthState, MetricsServer};
use bridge_validator::proxy::{EvmBridgeHead, EvmValidatorProxy};
use bridge_validator::store::Stores;
use bridge_validator::types::Side;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Bridge Validator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} ({}) <-> {} ({})",
        settings.chains.primary.name,
        settings.chains.primary.chain_id,
        settings.chains.secondary.name,
        settings.chains.secondary.chain_id
    );

    let wallet = load_wallet(&settings)?;
    info!(
        instance = %settings.validator.instance_id,
        address = ?wallet.address(),
        "Validator key loaded"
    );

    // Open the snapshot, ledger and bridge-record stores
    let stores = Stores::open(&settings.store).await?;
    info!("Store ready ({:?} backend)", settings.store.backend);

    // Initialize chain manager (handles both chain connections)
    let chain_manager = Arc::new(ChainManager::new(&settings, &wallet)?);
    info!("Chain connections initialized");

    let mut sides = Vec::with_capacity(2);
    for side in Side::BOTH {
        let adapter = chain_manager.adapter(side)?;
        let provider = adapter.provider().clone();
        let adapter: Arc<dyn ChainAdapter> = adapter;
        sides.push(BridgeSide {
            adapter: adapter.clone(),
            head: Arc::new(EvmBridgeHead::new(provider.clone())),
            validator: Arc::new(EvmValidatorProxy::new(provider, adapter)),
        });
    }
    let sides: [BridgeSide; 2] = sides
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected exactly two bridge sides"))?;

    // Initialize the snapshot engine and the coordinator
    let registry = Arc::new(TokenRegistry::from_settings(&settings));
    let builder = builder_for(&settings.validator, registry)?;
    info!("Snapshot builder: {:?}", builder.kind());

    let coordinator = Arc::new(Coordinator::new(
        sides,
        stores.clone(),
        builder,
        wallet,
        settings.validator.commit(),
        Coordinator::genesis(&settings),
    ));

    let health = Arc::new(HealthState::new());

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port, health.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Commit tick loop
    let tick_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        let health = health.clone();
        let period = std::time::Duration::from_millis(settings.validator.tick_interval_ms);
        async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let outcome = coordinator.tick().await;
                debug!("Tick finished: {}", outcome.as_str());
                health.set_tick(outcome.as_str()).await;
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let health = health.clone();
        let stores = stores.clone();
        let interval = settings.validator.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                // Check chain connections
                for (chain_id, healthy) in chain_manager.health_check().await {
                    health.set_chain(chain_id, healthy);
                    if !healthy {
                        warn!("Chain {} health check failed", chain_id);
                        continue;
                    }
                    if let Ok(adapter) = chain_manager.get_adapter(chain_id) {
                        match adapter.head_number().await {
                            Ok(head) => debug!("Chain {} head at {}", chain_id, head),
                            Err(e) => warn!("Chain {} head query failed: {}", chain_id, e),
                        }
                    }
                }

                // Check database connection
                if let Err(e) = stores.health_check().await {
                    warn!("Store health check failed: {}", e);
                }
            }
        }
    });

    info!("Bridge Validator is running");
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Abort background tasks
    tick_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!(
        "Bridge Validator stopped in state {}",
        coordinator
            .state()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "<tick in flight>".to_string())
    );
    Ok(())
}

fn load_wallet(settings: &Settings) -> Result<LocalWallet> {
    let var = &settings.wallet.private_key_env;
    let key = std::env::var(var)
        .with_context(|| format!("Validator private key variable {} is not set", var))?;
    key.trim()
        .parse::<LocalWallet>()
        .with_context(|| format!("Variable {} does not hold a valid private key", var))
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,bridge_validator=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
