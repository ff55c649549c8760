// =============================================================================
// Concord Sector Engine — Main Entry Point
// =============================================================================
//
// Multi-agent deliberation and action-execution engine for a simulated
// trading environment. One cooperative ticker per sector drives confidence
// updates, discussions, manager scoring, and execution; an independent
// watchdog breaks stalls.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod checklist;
mod confidence;
mod discussion_engine;
mod error;
mod execution;
mod market_data;
mod model;
mod oracle;
mod orchestrator;
mod portfolio;
mod price_model;
mod registry;
mod runtime_config;
mod scorer;
mod storage;
mod ticker;
mod types;
mod watchdog;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::market_data::CandleFeed;
use crate::model::UserAccount;
use crate::orchestrator::SystemOrchestrator;
use crate::runtime_config::RuntimeConfig;
use crate::storage::{collections, KeyedStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Concord Sector Engine — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    info!(
        mode = %config.mode,
        max_sectors = config.max_sectors,
        tick_period_ms = config.tick_period_ms,
        use_llm = config.use_llm,
        "engine configuration"
    );

    // ── 2. Storage ───────────────────────────────────────────────────────
    let store = Arc::new(KeyedStore::open(
        &config.data_dir,
        Duration::from_millis(config.storage_op_timeout_ms),
        config.storage_retry_attempts,
    )?);

    // Seed the user account on first launch.
    let seed_balance = config.user_account_balance;
    store
        .update::<UserAccount, _, _>(collections::USER_ACCOUNT, move |accounts| {
            if accounts.is_empty() {
                accounts.push(UserAccount::new(seed_balance));
                info!(balance = seed_balance, "user account seeded");
            }
            Ok(())
        })
        .await?;

    // ── 3. Shared state & orchestrator ───────────────────────────────────
    let state = Arc::new(AppState::new(
        config,
        store,
        Arc::new(CandleFeed::new()),
    ));
    let orchestrator = SystemOrchestrator::new(state.clone());
    orchestrator.start().await?;

    // ── 4. API server ────────────────────────────────────────────────────
    let bind_addr =
        std::env::var("CONCORD_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let api_orch = orchestrator.clone();
    let bind_addr_clone = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_orch);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    orchestrator.shutdown().await;

    if let Err(e) = state.runtime_config.read().save("runtime_config.json") {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Concord Sector Engine shut down complete.");
    Ok(())
}
