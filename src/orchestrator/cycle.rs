// =============================================================================
// Per-state cycle stages
// =============================================================================
//
// Each `run_*` function implements one FSM state's contract from the
// orchestrator's per-state timeout table. Stages communicate through their
// return values and `AppState.last_scan`/`last_candles_by_symbol` only — no
// stage reaches into another stage's locals directly.
// =============================================================================

use std::collections::HashMap;

use tracing::{info, instrument, warn};

use super::Orchestrator;
use crate::decision_envelope::DecisionEnvelope;
use crate::exchange::MarketSpec;
use crate::execution::{CancelToken, MarketSnapshot};
use crate::indicators::{atr, bollinger, ema};
use crate::market_data::{Candle, CandleKey};
use crate::scanner::Scanner;
use crate::signals;
use crate::types::{L2Depth, MarketData, OrderSide, Position, PositionMeta, PositionState, Signal};

/// A signal that has been sized and is ready to route to the execution
/// manager.
pub struct SizedSignal {
    pub signal: Signal,
    pub sized: crate::risk::SizedOrder,
    pub market_spec: MarketSpec,
    pub snapshot: MarketSnapshot,
}

/// Builds the tradable universe's `MarketData` rows from the candle buffer,
/// order book, and trade processors already running on the orchestrator's
/// `AppState`.
fn build_universe(orch: &Orchestrator, now_ms: i64) -> (Vec<MarketData>, HashMap<String, Vec<Candle>>) {
    let symbols = orch.state.system_config.read().symbols.clone();
    let mut universe = Vec::with_capacity(symbols.len());
    let mut candles_by_symbol = HashMap::with_capacity(symbols.len());

    let btc_closes = orch.state.candle_buffer.get_closes(
        &CandleKey { symbol: "BTCUSDT".to_string(), interval: "5m".to_string() },
        60,
    );

    for symbol in &symbols {
        let key_5m = CandleKey { symbol: symbol.clone(), interval: "5m".to_string() };
        let key_15m = CandleKey { symbol: symbol.clone(), interval: "15m".to_string() };
        let candles_5m = orch.state.candle_buffer.get_closed_candles(&key_5m, 100);
        if candles_5m.len() < 20 {
            continue;
        }
        let candles_15m = orch.state.candle_buffer.get_closed_candles(&key_15m, 30);

        let last = candles_5m.last().expect("checked len >= 20");
        let closes: Vec<f64> = candles_5m.iter().map(|c| c.close).collect();
        let atr_5m = atr::calculate_atr(&candles_5m, 14).unwrap_or(0.0);
        let atr_15m = atr::calculate_atr(&candles_15m, 14).unwrap_or(atr_5m);
        let bb_width_pct = bollinger::calculate_bollinger(&closes, 20, 2.0)
            .map(|b| if b.middle > 0.0 { b.width / b.middle * 100.0 } else { 0.0 })
            .unwrap_or(0.0);

        // Trailing quote-volume proxy for 24h volume: widest window the
        // candle buffer retains (288 5m candles = 24h once fully warm).
        let volume_window = orch.state.candle_buffer.get_closed_candles(&key_5m, 288);
        let volume_24h_usd: f64 = volume_window.iter().map(|c| c.quote_volume).sum();

        let trades_per_minute = {
            let trade_procs = orch.state.trade_processors.read();
            trade_procs.get(symbol).map(|tp| tp.trades_per_minute(now_ms)).unwrap_or(0.0)
        };

        let l2_depth = orch.state.orderbook_manager.get(symbol).map(|snap| {
            let spread_bps = orch.state.orderbook_manager.spread_bps(symbol).unwrap_or(0.0);
            let bid_0_5: f64 = snap.bids.iter().take(10).map(|l| l.price * l.size).sum();
            let ask_0_5: f64 = snap.asks.iter().take(10).map(|l| l.price * l.size).sum();
            L2Depth::from_bands(bid_0_5 * 0.6, ask_0_5 * 0.6, bid_0_5, ask_0_5, spread_bps)
        });

        let btc_correlation = if symbol == "BTCUSDT" {
            1.0
        } else {
            correlation(&closes, &btc_closes)
        };

        let vol_surge_1h = volume_surge_ratio(&volume_window, 12);
        let vol_surge_5m = volume_surge_ratio(&candles_5m, 1);

        universe.push(MarketData {
            symbol: symbol.clone(),
            price: last.close,
            volume_24h_usd,
            oi_usd: None,
            trades_per_minute,
            atr_5m,
            atr_15m,
            bb_width_pct,
            btc_correlation,
            vol_surge_1h,
            vol_surge_5m,
            oi_delta: None,
            l2_depth,
            ts: now_ms,
        });
        candles_by_symbol.insert(symbol.clone(), candles_5m);
    }

    (universe, candles_by_symbol)
}

/// Ratio of the most recent `recent_bars` bars' total volume to the mean
/// volume of same-sized buckets over the rest of the window. 1.0 means flat;
/// above 1.0 means the recent window is trading above its own baseline.
fn volume_surge_ratio(candles: &[Candle], recent_bars: usize) -> f64 {
    if candles.len() <= recent_bars || recent_bars == 0 {
        return 1.0;
    }
    let recent: f64 = candles[candles.len() - recent_bars..].iter().map(|c| c.volume).sum();
    let baseline_bars = &candles[..candles.len() - recent_bars];
    let bucket_count = baseline_bars.len() / recent_bars;
    if bucket_count == 0 {
        return 1.0;
    }
    let baseline_total: f64 = baseline_bars[baseline_bars.len() - bucket_count * recent_bars..]
        .iter()
        .map(|c| c.volume)
        .sum();
    let baseline_avg = baseline_total / bucket_count as f64;
    if baseline_avg > 0.0 {
        recent / baseline_avg
    } else {
        1.0
    }
}

/// On-balance volume over the trailing `lookback` closed bars: true if OBV
/// at the end of the window is higher than at its start, i.e. volume is
/// confirming the up-move during a pullback.
fn obv_rising(candles: &[Candle], lookback: usize) -> bool {
    if candles.len() < lookback + 1 {
        return false;
    }
    let window = &candles[candles.len() - lookback - 1..];
    let mut obv = 0.0;
    let start_obv = obv;
    for i in 1..window.len() {
        if window[i].close > window[i - 1].close {
            obv += window[i].volume;
        } else if window[i].close < window[i - 1].close {
            obv -= window[i].volume;
        }
    }
    obv > start_obv
}

/// Pearson correlation of the trailing min-length window of two close
/// series. Returns 0.0 when either series is too short to compare.
fn correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 10 {
        return 0.0;
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        0.0
    } else {
        (cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0)
    }
}

#[instrument(skip(orch))]
pub async fn run_scanning(orch: &Orchestrator) -> Result<(), String> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let (universe, candles_by_symbol) = build_universe(orch, now_ms);
    if universe.is_empty() {
        return Err("no symbols in universe have sufficient candle history".to_string());
    }

    let preset = orch.state.preset.read().clone();
    let scanner = Scanner::new(preset.scanner_config.max_candidates as usize * 4);
    let results = scanner.scan(
        &universe,
        &candles_by_symbol,
        &preset.scanner_config,
        &preset.liquidity_filters,
        &preset.volatility_filters,
        preset.correlation_limit,
        now_ms,
    );

    info!(candidates = results.len(), "scan complete");
    orch.state.last_scan.write().replace(results);
    orch.state.last_candles_by_symbol.write().clone_from(&candles_by_symbol);
    Ok(())
}

#[instrument(skip(orch))]
pub async fn run_level_building(orch: &Orchestrator) -> Result<(), String> {
    // Levels are already attached by the scanner during SCANNING (Donchian
    // detection runs inline per candidate); this stage exists as its own FSM
    // state so a future levels-refresh policy can re-run independently of a
    // full rescan without the transition table changing shape.
    let candidates = orch.state.last_scan.read().clone().unwrap_or_default();
    info!(candidates = candidates.len(), "levels available for signal generation");
    Ok(())
}

#[instrument(skip(orch))]
pub async fn run_signal_wait(orch: &Orchestrator) -> Result<Vec<Signal>, String> {
    let preset = orch.state.preset.read().clone();
    let candidates = orch.state.last_scan.read().clone().unwrap_or_default();
    let candles_by_symbol = orch.state.last_candles_by_symbol.read().clone();
    let now_ms = chrono::Utc::now().timestamp_millis();

    let mut signals = Vec::new();
    for candidate in &candidates {
        let candles = candles_by_symbol.get(&candidate.symbol).cloned().unwrap_or_default();
        let symbol_signals = signals::generate(candidate, &candles, &preset.signal_config, now_ms);

        let envelope = if symbol_signals.is_empty() {
            DecisionEnvelope::blocked(
                candidate.symbol.as_str(),
                "n/a",
                "scan",
                "signal_wait",
                format!("no signal conditions met across {} level(s)", candidate.levels.len()),
            )
        } else {
            DecisionEnvelope::allow(candidate.symbol.as_str(), "n/a", "scan")
        };
        orch.state.push_decision(envelope);

        signals.extend(symbol_signals);
    }

    Ok(signals)
}

#[instrument(skip(orch, signals))]
pub async fn run_sizing(orch: &Orchestrator, signals: Vec<Signal>) -> Result<Vec<SizedSignal>, String> {
    let preset = orch.state.preset.read().clone();
    let markets = orch.adapter.load_markets().await.map_err(|e| e.to_string())?;
    let market_by_symbol: HashMap<&str, &MarketSpec> = markets.iter().map(|m| (m.symbol.as_str(), m)).collect();

    let correlations: Vec<f64> = orch
        .state
        .last_scan
        .read()
        .clone()
        .unwrap_or_default()
        .iter()
        .map(|r| r.market_data.btc_correlation)
        .collect();

    let mut sized_signals = Vec::new();
    for signal in signals {
        if let Err(e) = orch.state.risk_engine.can_open_position(&correlations) {
            warn!(symbol = %signal.symbol, error = %e, "signal rejected by risk gate");
            orch.state.push_engine_error(&e);
            continue;
        }

        let Some(market_spec) = market_by_symbol.get(signal.symbol.as_str()) else {
            warn!(symbol = %signal.symbol, "no market spec available — skipping signal");
            continue;
        };

        let depth = orch.state.orderbook_manager.get(&signal.symbol);
        let depth_usd_at_side = depth
            .as_ref()
            .map(|d| match signal.side {
                crate::types::Side::Long => d.asks.iter().take(10).map(|l| l.price * l.size).sum(),
                crate::types::Side::Short => d.bids.iter().take(10).map(|l| l.price * l.size).sum(),
            })
            .unwrap_or(0.0);
        let spread_bps = orch.state.orderbook_manager.spread_bps(&signal.symbol).unwrap_or(5.0);

        match orch.state.risk_engine.size_position(
            signal.entry,
            signal.stop_loss,
            depth_usd_at_side,
            market_spec,
            &preset.execution_config,
            preset.signal_config.min_stop_distance_ticks,
        ) {
            Ok(sized) => {
                let snapshot = MarketSnapshot {
                    reference_price: signal.entry,
                    depth_usd_at_side,
                    spread_bps,
                };
                sized_signals.push(SizedSignal { signal, sized, market_spec: (*market_spec).clone(), snapshot });
            }
            Err(e) => {
                warn!(symbol = %signal.symbol, error = %e, "signal rejected during sizing");
                orch.state.push_engine_error(&e);
            }
        }
    }

    Ok(sized_signals)
}

#[instrument(skip(orch, sized_signals))]
pub async fn run_execution(orch: &Orchestrator, sized_signals: Vec<SizedSignal>) -> Result<(), String> {
    let preset = orch.state.preset.read().clone();
    let exec_engine = crate::execution::ExecutionEngine::new(orch.adapter.clone(), preset.execution_config.clone());

    for item in sized_signals {
        let side = match item.signal.side {
            crate::types::Side::Long => OrderSide::Buy,
            crate::types::Side::Short => OrderSide::Sell,
        };
        let report = exec_engine
            .execute(
                &item.signal.symbol,
                side,
                crate::types::OrderIntent::Entry,
                Some(item.signal.strategy),
                item.sized,
                Some(item.signal.entry),
                item.snapshot,
                false,
                CancelToken::from_flag(orch.shutdown_token().flag()),
                item.market_spec.amount_step,
            )
            .await;

        match report {
            Ok(report) if report.filled_qty > 0.0 => {
                orch.state.risk_engine.register_position_opened();
                let opened_ts = chrono::Utc::now().timestamp_millis();
                let position = Position {
                    id: report.parent_id.clone(),
                    symbol: item.signal.symbol.clone(),
                    side: item.signal.side,
                    qty_open: report.filled_qty,
                    initial_qty: report.filled_qty,
                    entry_price: report.avg_fill_price,
                    stop_loss: item.signal.stop_loss,
                    take_profit_levels: preset.position_config.tp_ladder(),
                    realized_pnl_usd: 0.0,
                    realized_pnl_r: 0.0,
                    opened_ts,
                    mode: orch.state.system_config.read().account_mode,
                    strategy: item.signal.strategy,
                    state: PositionState::Open,
                    origin_signal_id: None,
                    meta: PositionMeta::default(),
                    initial_stop_distance: (item.signal.entry - item.signal.stop_loss).abs(),
                };
                orch.state.position_manager.open_position(position.clone());
                orch.state.increment_version();
                if let Err(e) = orch.state.position_store.save_position(position).await {
                    warn!(error = %e, "failed to persist newly opened position");
                }
                info!(symbol = %item.signal.symbol, qty = report.filled_qty, "position opened");
            }
            Ok(report) => {
                warn!(symbol = %item.signal.symbol, status = ?report.status, "entry order did not fill");
            }
            Err(e) => {
                orch.state.push_engine_error(&e);
            }
        }
    }

    Ok(())
}

#[instrument(skip(orch))]
pub async fn run_managing(orch: &Orchestrator) -> Result<(), String> {
    let preset = orch.state.preset.read().clone();
    let now_ts = chrono::Utc::now().timestamp_millis();

    for position in orch.state.position_manager.open_positions() {
        let current_price = {
            let trade_procs = orch.state.trade_processors.read();
            trade_procs.get(&position.symbol).map(|tp| tp.last_price()).unwrap_or(0.0)
        };
        if current_price <= 0.0 {
            continue;
        }
        let key_5m = CandleKey { symbol: position.symbol.clone(), interval: "5m".to_string() };
        let key_1m = CandleKey { symbol: position.symbol.clone(), interval: "1m".to_string() };
        let atr_5m = atr::calculate_atr(&orch.state.candle_buffer.get_closed_candles(&key_5m, 30), 14).unwrap_or(0.0);
        let atr_1m = atr::calculate_atr(&orch.state.candle_buffer.get_closed_candles(&key_1m, 30), 14).unwrap_or(atr_5m);

        let ctx = crate::position_engine::TickContext { current_price, atr_5m, atr_1m, now_ts };
        match orch.state.position_manager.evaluate_tick(&position.id, &ctx) {
            Ok(instructions) => {
                for instruction in instructions {
                    dispatch_instruction(orch, &preset, &position, current_price, instruction).await;
                }
            }
            Err(e) => orch.state.push_engine_error(&e),
        }

        if preset.position_config.add_on_enabled {
            let candles_5m = orch.state.candle_buffer.get_closed_candles(&key_5m, 30);
            let closes: Vec<f64> = candles_5m.iter().map(|c| c.close).collect();
            let ema9_5m = ema::calculate_ema(&closes, 9).last().copied().unwrap_or(current_price);
            let obv_confirms = obv_rising(&candles_5m, 10);
            let incremental_risk_r = preset.position_config.add_on_max_size_pct;
            let daily_risk_remaining_r = orch.state.risk_engine.remaining_daily_risk_r();
            match orch.state.position_manager.try_add_on(
                &position.id,
                current_price,
                ema9_5m,
                obv_confirms,
                incremental_risk_r,
                daily_risk_remaining_r,
            ) {
                Ok(Some(instruction)) => {
                    dispatch_instruction(orch, &preset, &position, current_price, instruction).await;
                }
                Ok(None) => {}
                Err(e) => orch.state.push_engine_error(&e),
            }
        }
    }
    Ok(())
}

/// Routes one `UpdateInstruction` to the exchange and reconciles the result
/// back into the position manager and risk engine.
async fn dispatch_instruction(
    orch: &Orchestrator,
    preset: &crate::config::TradingPreset,
    position: &Position,
    current_price: f64,
    instruction: crate::position_engine::UpdateInstruction,
) {
    use crate::position_engine::UpdateInstruction;

    match instruction {
        UpdateInstruction::MoveSl { position_id, new_sl } => {
            info!(position_id = %position_id, new_sl, "stop moved");
            persist_position(orch, &position_id).await;
        }
        UpdateInstruction::AddOn { position_id, qty } => {
            route_add_on(orch, preset, position, current_price, &position_id, qty).await;
        }
        UpdateInstruction::PartialClose { position_id, intent, qty, reason } => {
            route_close(orch, preset, position, current_price, &position_id, intent, qty, &reason).await;
        }
        UpdateInstruction::FullClose { position_id, intent, reason } => {
            let qty = position.qty_open;
            route_close(orch, preset, position, current_price, &position_id, intent, qty, &reason).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn route_close(
    orch: &Orchestrator,
    preset: &crate::config::TradingPreset,
    position: &Position,
    current_price: f64,
    position_id: &str,
    intent: crate::types::OrderIntent,
    qty: f64,
    reason: &str,
) {
    let side = match position.side {
        crate::types::Side::Long => OrderSide::Sell,
        crate::types::Side::Short => OrderSide::Buy,
    };
    let spread_bps = orch.state.orderbook_manager.spread_bps(&position.symbol).unwrap_or(5.0);
    let depth_usd_at_side = orch
        .state
        .orderbook_manager
        .get(&position.symbol)
        .map(|d| match side {
            OrderSide::Sell => d.bids.iter().take(10).map(|l| l.price * l.size).sum(),
            OrderSide::Buy => d.asks.iter().take(10).map(|l| l.price * l.size).sum(),
        })
        .unwrap_or(0.0);
    let snapshot = MarketSnapshot { reference_price: current_price, depth_usd_at_side, spread_bps };
    let sized = crate::risk::SizedOrder { qty, mark_for_twap: false };
    let amount_step = orch
        .adapter
        .load_markets()
        .await
        .ok()
        .and_then(|markets| markets.into_iter().find(|m| m.symbol == position.symbol).map(|m| m.amount_step))
        .unwrap_or(0.0);

    let exec_engine = crate::execution::ExecutionEngine::new(orch.adapter.clone(), preset.execution_config.clone());
    match exec_engine
        .execute(
            &position.symbol,
            side,
            intent,
            Some(position.strategy),
            sized,
            Some(current_price),
            snapshot,
            true,
            CancelToken::from_flag(orch.shutdown_token().flag()),
            amount_step,
        )
        .await
    {
        Ok(report) if report.filled_qty > 0.0 => {
            match orch.state.position_manager.confirm_fill(
                position_id,
                intent,
                report.filled_qty,
                report.avg_fill_price,
                report.fees_usd,
            ) {
                Ok(outcome) => {
                    if outcome.position_closed {
                        orch.state.risk_engine.register_position_closed(outcome.realized_pnl_usd, outcome.realized_pnl_r);
                        if let Err(e) = orch.state.position_store.delete_position(position_id).await {
                            warn!(error = %e, "failed to drop closed position from store");
                        }
                    } else {
                        persist_position(orch, position_id).await;
                    }
                    orch.state.increment_version();
                    info!(position_id, intent = ?intent, reason, filled = report.filled_qty, "exit fill reconciled");
                }
                Err(e) => orch.state.push_engine_error(&e),
            }
        }
        Ok(report) => {
            warn!(position_id, status = ?report.status, "exit order did not fill");
        }
        Err(e) => {
            orch.state.push_engine_error(&e);
        }
    }
}

/// Routes an add-on fill in the same direction as the position. The size
/// was already folded into the position's tracked qty by
/// `PositionManager::try_add_on`; this just acquires it at the exchange.
async fn route_add_on(
    orch: &Orchestrator,
    preset: &crate::config::TradingPreset,
    position: &Position,
    current_price: f64,
    position_id: &str,
    qty: f64,
) {
    let side = match position.side {
        crate::types::Side::Long => OrderSide::Buy,
        crate::types::Side::Short => OrderSide::Sell,
    };
    let spread_bps = orch.state.orderbook_manager.spread_bps(&position.symbol).unwrap_or(5.0);
    let depth_usd_at_side = orch
        .state
        .orderbook_manager
        .get(&position.symbol)
        .map(|d| match side {
            OrderSide::Buy => d.asks.iter().take(10).map(|l| l.price * l.size).sum(),
            OrderSide::Sell => d.bids.iter().take(10).map(|l| l.price * l.size).sum(),
        })
        .unwrap_or(0.0);
    let snapshot = MarketSnapshot { reference_price: current_price, depth_usd_at_side, spread_bps };
    let sized = crate::risk::SizedOrder { qty, mark_for_twap: false };
    let amount_step = orch
        .adapter
        .load_markets()
        .await
        .ok()
        .and_then(|markets| markets.into_iter().find(|m| m.symbol == position.symbol).map(|m| m.amount_step))
        .unwrap_or(0.0);

    let exec_engine = crate::execution::ExecutionEngine::new(orch.adapter.clone(), preset.execution_config.clone());
    match exec_engine
        .execute(
            &position.symbol,
            side,
            crate::types::OrderIntent::AddOn,
            Some(position.strategy),
            sized,
            Some(current_price),
            snapshot,
            false,
            CancelToken::from_flag(orch.shutdown_token().flag()),
            amount_step,
        )
        .await
    {
        Ok(report) if report.filled_qty > 0.0 => {
            orch.state.increment_version();
            persist_position(orch, position_id).await;
            info!(position_id, filled = report.filled_qty, "add-on fill routed");
        }
        Ok(report) => {
            warn!(position_id, status = ?report.status, "add-on order did not fill");
        }
        Err(e) => {
            orch.state.push_engine_error(&e);
        }
    }
}

/// Writes a position's current tracked state to the store. Best-effort: a
/// failed write is logged, not propagated, since the in-memory position
/// manager remains the source of truth for the running process.
async fn persist_position(orch: &Orchestrator, position_id: &str) {
    if let Some(position) = orch.state.position_manager.get(position_id) {
        if let Err(e) = orch.state.position_store.save_position(position).await {
            warn!(error = %e, "failed to persist position update");
        }
    }
}
