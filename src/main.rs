// =============================================================================
// Aurora Spot Nexus — Main Entry Point
// =============================================================================
//
// The engine starts in Paper + Paused mode for safety. Operators must
// explicitly switch to Live mode via the REST control surface.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod decision_envelope;
mod diagnostics;
mod error;
mod exchange;
mod execution;
mod exit;
mod futures_intel;
mod indicators;
mod market_data;
mod metrics;
mod orchestrator;
mod persistence;
mod position_engine;
mod reconcile;
mod regime;
mod resource_governor;
mod risk;
mod scanner;
mod signals;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::{SystemConfig, TradingPreset};
use crate::exchange::{bybit::BybitAdapter, paper, ExchangeAdapter};
use crate::market_data::CandleKey;
use crate::orchestrator::Orchestrator;
use crate::resource_governor::ResourceGovernor;
use crate::types::AccountMode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    let system_config = SystemConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(system_config.log_level.clone())),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Spot Nexus — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let preset = TradingPreset::default();
    if let Err(e) = preset.validate() {
        error!(error = %e, "trading preset failed validation — refusing to start");
        return Err(anyhow::anyhow!("{e}"));
    }

    info!(symbols = ?system_config.symbols, "configured trading pairs");
    info!(
        trading_mode = %system_config.trading_mode,
        account_mode = %system_config.account_mode,
        "engine starting in SAFE mode (Paper + Paused)"
    );

    let symbols = system_config.symbols.clone();
    let account_mode = system_config.account_mode;
    let paper_starting_balance = system_config.paper_starting_balance;

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(system_config, preset));

    // ── 2b. Reload open positions from the last run, if persisted ───────
    match state.position_store.reload_open_positions().await {
        Ok(positions) => {
            let mut restored = 0;
            for position in positions {
                if !position.invariant_holds() {
                    warn!(id = %position.id, "discarding reloaded position that fails its invariant");
                    continue;
                }
                state.position_manager.open_position(position);
                restored += 1;
            }
            if restored > 0 {
                info!(count = restored, "reloaded open positions from persistence");
            }
        }
        Err(e) => error!(error = %e, "failed to reload open positions, starting flat"),
    }

    // ── 3. Build the exchange adapter ────────────────────────────────────
    let adapter: Arc<dyn ExchangeAdapter> = match account_mode {
        AccountMode::Live => Arc::new(BybitAdapter::live()),
        AccountMode::Paper => {
            paper::new_shared(paper_starting_balance, state.preset.read().execution_config.clone())
        }
    };

    // ── 4. Orchestrator ───────────────────────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(state.clone(), adapter.clone()));
    let shutdown = orchestrator.shutdown_token();

    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator.run().await;
        });
    }

    // ── 5. Spawn market data streams ─────────────────────────────────────
    for symbol in &symbols {
        let cb = state.candle_buffer.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = market_data::candle_buffer::run_kline_stream(&sym, "1m", &cb).await {
                    error!(symbol = %sym, error = %e, "kline 1m stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });

        let cb = state.candle_buffer.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = market_data::candle_buffer::run_kline_stream(&sym, "5m", &cb).await {
                    error!(symbol = %sym, error = %e, "kline 5m stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });

        {
            let procs = state.trade_processors.read();
            if let Some(tp) = procs.get(symbol) {
                let processor = tp.clone();
                let sym = symbol.clone();
                tokio::spawn(async move {
                    loop {
                        if let Err(e) = market_data::trade_stream::run_trade_stream(&sym, &processor).await {
                            error!(symbol = %sym, error = %e, "trade stream error — reconnecting in 5s");
                        }
                        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                    }
                });
            }
        }

        let ob = state.orderbook_manager.clone();
        let diag = state.diagnostics.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = market_data::orderbook::run_depth_stream(&sym, 50, &ob, &diag).await {
                    error!(symbol = %sym, error = %e, "depth stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    info!(count = symbols.len(), "market data streams launched");

    // ── 6. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let api_orchestrator = orchestrator.clone();
    let bind_addr = std::env::var("AURORA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let bind_addr_clone = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state, api_orchestrator);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    // ── 7. Resource governor ──────────────────────────────────────────────
    {
        let governor_state = state.clone();
        let governor_shutdown = shutdown.clone();
        tokio::spawn(async move {
            ResourceGovernor::new(governor_state).run(governor_shutdown).await;
        });
    }

    // ── 8. Reconciliation loop ───────────────────────────────────────────
    {
        let recon_state = state.clone();
        let recon_adapter = adapter.clone();
        let recon_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                if recon_shutdown.is_triggered() {
                    return;
                }
                if recon_state.system_config.read().account_mode == AccountMode::Paper {
                    continue;
                }
                match reconcile::reconcile_once(
                    recon_adapter.as_ref(),
                    &recon_state.position_manager,
                    &recon_state.balances,
                )
                .await
                {
                    Ok(result) => {
                        *recon_state.last_reconcile_ok.write() = Some(std::time::Instant::now());
                        *recon_state.last_reconcile_error.write() = None;
                        recon_state.increment_version();
                        info!(?result, "reconciliation completed");
                    }
                    Err(e) => {
                        *recon_state.last_reconcile_error.write() = Some(format!("{e}"));
                        warn!(error = %e, "reconciliation failed");
                    }
                }
            }
        });
    }

    // ── 9. Regime detection loop ─────────────────────────────────────────
    {
        let regime_state = state.clone();
        let regime_shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(tokio::time::Duration::from_secs(60)).await;
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                if regime_shutdown.is_triggered() {
                    return;
                }
                let syms = regime_state.system_config.read().symbols.clone();
                if let Some(symbol) = syms.first() {
                    let key = CandleKey { symbol: symbol.clone(), interval: "5m".to_string() };
                    let candles = regime_state.candle_buffer.get_closed_candles(&key, 100);
                    if candles.len() >= 50 {
                        regime_state.regime_detector.update(&candles);
                        regime_state.increment_version();
                    }
                }
            }
        });
    }

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 10. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    if let Err(e) = orchestrator.stop() {
        error!(error = %e, "failed to transition orchestrator to STOPPED");
    }

    info!("Aurora Spot Nexus shut down complete.");
    Ok(())
}
