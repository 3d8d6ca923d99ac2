//! Per-run orchestration: validation, warmup preflight, feed construction,
//! and the single-threaded hot loop over exec bars. The per-bar order is
//! fixed: exchange step, MTF index advance, snapshot build, gates, strategy
//! evaluation, order submission, equity record, tracker.

pub mod gates;
pub mod tracker;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::artifacts::{
    compute_metrics, hashes, RunArtifacts, RunHashes, RunManifest, TfRoles, EQUITY_TS_COL,
};
use crate::dsl::eval::{evaluate_actions, EvalCtx};
use crate::dsl::ActionDef;
use crate::error::{ErrorKind, PlaybackError};
use crate::exchange::{size_order, SimExchange};
use crate::feed::build_feed;
use crate::play::warmup::{compute_warmup_plan, verify_coverage};
use crate::play::{validate_play, ValidatedPlay};
use crate::snapshot::FeedSet;
use crate::types::{
    Bar, Direction, FundingEvent, Order, OrderKind, Side, Signal, TimeInForce, Timeframe,
};

use gates::{evaluate_gates, GateResult};
use tracker::{BarObservation, StateTracker};

/// Bars for every (symbol, timeframe) pair a run needs. Loading them is the
/// caller's concern; the core only consumes arrays.
#[derive(Debug, Default)]
pub struct RunData {
    pub bars: BTreeMap<(String, Timeframe), Vec<Bar>>,
}

impl RunData {
    pub fn insert(&mut self, symbol: &str, tf: Timeframe, bars: Vec<Bar>) {
        self.bars.insert((symbol.to_string(), tf), bars);
    }

    fn get(&self, symbol: &str, tf: Timeframe) -> Option<&[Bar]> {
        self.bars
            .get(&(symbol.to_string(), tf))
            .map(Vec::as_slice)
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Symbol to run; defaults to the first entry of the Play's universe.
    pub symbol: Option<String>,
    pub start_ts_ms: Option<i64>,
    pub end_ts_ms: Option<i64>,
    /// Funding events, if the caller has any. Empty is valid.
    pub funding_events: Vec<FundingEvent>,
    /// Record per-bar block states into `events.jsonl`. Never changes trades.
    pub track_states: bool,
    /// Cooperative cancel, observed between bars only.
    pub cancel: Option<Arc<AtomicBool>>,
    /// Data provenance label folded into the input hash.
    pub provenance: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            symbol: None,
            start_ts_ms: None,
            end_ts_ms: None,
            funding_events: Vec::new(),
            track_states: false,
            cancel: None,
            provenance: "caller".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Failed,
}

/// Structured run result. Graceful terminations (run-stop conditions,
/// cancel) are `Ok` with artifacts and a `stop_reason`; schema/data/
/// invariant failures are `Failed` with no artifacts.
pub struct RunOutcome {
    pub status: RunStatus,
    pub artifacts: Option<RunArtifacts>,
    pub error_kind: Option<ErrorKind>,
    pub error_code: Option<&'static str>,
    pub error_details: Option<String>,
}

pub fn run_backtest(play_doc: &Value, data: &RunData, cfg: &RunConfig) -> RunOutcome {
    match run_inner(play_doc, data, cfg) {
        Ok(artifacts) => RunOutcome {
            status: RunStatus::Ok,
            artifacts: Some(artifacts),
            error_kind: None,
            error_code: None,
            error_details: None,
        },
        Err(e) => {
            tracing::warn!(error = %e, "run failed");
            RunOutcome {
                status: RunStatus::Failed,
                artifacts: None,
                error_kind: Some(e.kind()),
                error_code: Some(e.code()),
                error_details: Some(e.to_string()),
            }
        }
    }
}

fn run_inner(
    play_doc: &Value,
    data: &RunData,
    cfg: &RunConfig,
) -> Result<RunArtifacts, PlaybackError> {
    let vp = validate_play(play_doc)?;
    let plan = compute_warmup_plan(&vp.play, &vp.features)?;

    let symbol = match &cfg.symbol {
        Some(s) => {
            if !vp.play.symbol_universe.contains(s) {
                return Err(PlaybackError::InvalidPlay(format!(
                    "symbol {s} not in the play universe"
                )));
            }
            s.clone()
        }
        None => vp.play.symbol_universe[0].clone(),
    };

    // Role bars, coverage-gated before any feature computation.
    let exec_tf = vp.play.tf;
    let exec_bars = data
        .get(&symbol, exec_tf)
        .ok_or_else(|| missing_feed(&symbol, exec_tf))?;
    if exec_bars.is_empty() {
        return Err(missing_feed(&symbol, exec_tf));
    }
    if plan.sim_start_idx >= exec_bars.len() {
        return Err(PlaybackError::InsufficientCoverage {
            symbol: symbol.clone(),
            tf: exec_tf.to_string(),
            ranges: vec![(
                exec_bars.last().map_or(0, |b| b.ts_close),
                exec_bars[0].ts_open + (plan.sim_start_idx as i64 + 1) * exec_tf.duration_ms(),
            )],
        });
    }
    let eval_start_ts_ms = exec_bars[plan.sim_start_idx].ts_close;
    let start_ts_ms = cfg.start_ts_ms.unwrap_or(exec_bars[0].ts_open);
    let end_ts_ms = cfg.end_ts_ms.unwrap_or(exec_bars[exec_bars.len() - 1].ts_close);

    verify_coverage(
        &symbol,
        exec_tf,
        exec_bars,
        plan.lookback_bars.exec,
        eval_start_ts_ms,
        end_ts_ms,
    )?;
    let mid_bars = role_bars(data, &symbol, vp.play.mid_tf, plan.lookback_bars.mid, eval_start_ts_ms, end_ts_ms)?;
    let high_bars = role_bars(data, &symbol, vp.play.high_tf, plan.lookback_bars.high, eval_start_ts_ms, end_ts_ms)?;

    // Feature frames per TF.
    let feeds = FeedSet {
        exec: build_feed(exec_bars, exec_tf, crate::types::TfRole::Exec, &vp.features)?,
        mid: match (vp.play.mid_tf, mid_bars) {
            (Some(tf), Some(bars)) => Some(build_feed(bars, tf, crate::types::TfRole::Mid, &vp.features)?),
            _ => None,
        },
        high: match (vp.play.high_tf, high_bars) {
            (Some(tf), Some(bars)) => Some(build_feed(bars, tf, crate::types::TfRole::High, &vp.features)?),
            _ => None,
        },
    };

    let play_hash = hashes::play_hash(&vp.normalized_doc);
    let mut tf_pairs: Vec<(&str, String)> = vec![("exec", exec_tf.to_string())];
    if let Some(tf) = vp.play.mid_tf {
        tf_pairs.push(("mid", tf.to_string()));
    }
    if let Some(tf) = vp.play.high_tf {
        tf_pairs.push(("high", tf.to_string()));
    }
    let input_hash = hashes::input_hash(&symbol, &tf_pairs, start_ts_ms, end_ts_ms, &cfg.provenance);

    let HotLoopOutput {
        trades,
        equity,
        events_jsonl,
        stop_reason,
    } = hot_loop(&vp, &feeds, &symbol, plan.sim_start_idx, cfg)?;

    let metrics = compute_metrics(
        &equity,
        &trades,
        vp.play.account.starting_equity_usdt,
        exec_tf,
    );
    let manifest = RunManifest {
        play_id: vp.play.id.clone(),
        play_version: vp.play.version,
        symbol: symbol.clone(),
        tf_roles: TfRoles {
            exec: exec_tf.to_string(),
            mid: vp.play.mid_tf.map(|t| t.to_string()),
            high: vp.play.high_tf.map(|t| t.to_string()),
        },
        start_ts_ms,
        end_ts_ms,
        eval_start_ts_ms,
        eval_start_utc: crate::artifacts::iso_utc(eval_start_ts_ms),
        lookback_bars: plan.lookback_bars,
        delay_bars: plan.delay_bars,
        play_hash: play_hash.clone(),
        input_hash: input_hash.clone(),
        equity_timestamp_column: EQUITY_TS_COL,
        stop_reason,
    };
    let hash_set = RunHashes::build(play_hash, input_hash, &trades, &equity);

    Ok(RunArtifacts {
        trades,
        equity,
        metrics,
        manifest,
        hashes: hash_set,
        events_jsonl,
    })
}

fn missing_feed(symbol: &str, tf: Timeframe) -> PlaybackError {
    PlaybackError::InsufficientCoverage {
        symbol: symbol.to_string(),
        tf: tf.to_string(),
        ranges: vec![(0, 0)],
    }
}

fn role_bars<'a>(
    data: &'a RunData,
    symbol: &str,
    tf: Option<Timeframe>,
    lookback: Option<usize>,
    eval_start_ts_ms: i64,
    end_ts_ms: i64,
) -> Result<Option<&'a [Bar]>, PlaybackError> {
    let Some(tf) = tf else {
        return Ok(None);
    };
    let bars = data
        .get(symbol, tf)
        .ok_or_else(|| missing_feed(symbol, tf))?;
    verify_coverage(
        symbol,
        tf,
        bars,
        lookback.unwrap_or(0),
        eval_start_ts_ms,
        end_ts_ms,
    )?;
    Ok(Some(bars))
}

struct HotLoopOutput {
    trades: Vec<crate::types::TradeRecord>,
    equity: Vec<crate::types::EquityPoint>,
    events_jsonl: Option<String>,
    stop_reason: String,
}

fn hot_loop(
    vp: &ValidatedPlay,
    feeds: &FeedSet,
    symbol: &str,
    sim_start_idx: usize,
    cfg: &RunConfig,
) -> Result<HotLoopOutput, PlaybackError> {
    let n = feeds.exec.len();
    let mut exchange = SimExchange::new(
        vp.play.account.clone(),
        vp.play.position_policy.clone(),
        cfg.funding_events.clone(),
    );
    let mut state_tracker = StateTracker::new(cfg.track_states);
    let mut equity_log = Vec::with_capacity(n);
    let mut stop_reason = "completed".to_string();
    let mut margin_starved_bars = 0usize;
    let mut prev_bar: Option<Bar> = None;

    tracing::info!(symbol, bars = n, sim_start_idx, "run started");

    for i in 0..n {
        // Cancel-safe at bar boundaries only.
        if let Some(cancel) = &cfg.cancel {
            if cancel.load(Ordering::Relaxed) {
                stop_reason = "canceled".to_string();
                if let Some(prev) = &prev_bar {
                    exchange.close_all(prev.close, prev.ts_close, i.saturating_sub(1));
                    refresh_last_equity(&mut equity_log, &exchange, prev.ts_close);
                }
                break;
            }
        }

        let bar = feeds.exec.bar_at(i)?;
        exchange.step(&bar, prev_bar.as_ref(), i);

        // Run-stop conditions, checked on the post-step account state.
        let balance = exchange.balance();
        if balance.equity <= 0.0 {
            exchange.close_all(bar.close, bar.ts_close, i);
            equity_log.push(exchange.equity_point(bar.ts_close));
            stop_reason = "account_blown".to_string();
            tracing::warn!(equity = balance.equity, "account blown, stopping run");
            break;
        }
        if let Some(limit) = vp.play.position_policy.insufficient_margin_stop_bars {
            if balance.free_margin < vp.play.position_policy.min_free_margin_usdt {
                margin_starved_bars += 1;
                if margin_starved_bars >= limit {
                    exchange.close_all(bar.close, bar.ts_close, i);
                    equity_log.push(exchange.equity_point(bar.ts_close));
                    stop_reason = "insufficient_free_margin".to_string();
                    break;
                }
            } else {
                margin_starved_bars = 0;
            }
        }

        if i < sim_start_idx {
            // Warmup/delay: no snapshot, no evaluation, but the account is
            // still marked and recorded.
            equity_log.push(exchange.equity_point(bar.ts_close));
            state_tracker.on_bar_end(bar.ts_close, GateResult::WarmupRemaining, BarObservation::NoSignal);
            prev_bar = Some(bar);
            continue;
        }

        let snapshot = feeds.snapshot_at(i)?;
        snapshot.assert_no_lookahead(bar.ts_close)?;

        let gate = evaluate_gates(
            i,
            sim_start_idx,
            symbol,
            &vp.play.position_policy,
            &exchange,
        );
        // Warmup/history gates block evaluation entirely; the remaining
        // gates only block new entries: exit rules must keep running while
        // a position is open.
        let hard_blocked = matches!(
            gate,
            GateResult::WarmupRemaining | GateResult::HistoryNotReady
        );
        let mut observation = BarObservation::NoSignal;
        if !hard_blocked {
            let ctx = EvalCtx {
                feeds,
                snap: &snapshot,
            };
            let actions = evaluate_actions(&vp.rules, &ctx);
            observation = apply_actions(
                &actions,
                vp,
                &mut exchange,
                symbol,
                &snapshot,
                &bar,
                i,
                gate.passed(),
            );
        }

        equity_log.push(exchange.equity_point(bar.ts_close));
        state_tracker.on_bar_end(bar.ts_close, gate, observation);
        prev_bar = Some(bar);
    }

    // End of data: flatten at the last mark so every entry has an exit row.
    if stop_reason == "completed" {
        if let Some(last) = &prev_bar {
            if !exchange.positions().is_empty() {
                exchange.close_all(last.close, last.ts_close, n.saturating_sub(1));
                refresh_last_equity(&mut equity_log, &exchange, last.ts_close);
            }
        }
    }

    tracing::info!(
        trades = exchange.trades().len(),
        stop_reason,
        "run finished"
    );

    Ok(HotLoopOutput {
        trades: exchange.trades().to_vec(),
        equity: equity_log,
        events_jsonl: cfg.track_states.then(|| state_tracker.to_jsonl()),
        stop_reason,
    })
}

/// The final forced close lands inside the last bar: refresh its equity row.
fn refresh_last_equity(
    equity_log: &mut Vec<crate::types::EquityPoint>,
    exchange: &SimExchange,
    ts_close_ms: i64,
) {
    if equity_log.last().is_some_and(|e| e.ts_close_ms == ts_close_ms) {
        equity_log.pop();
    }
    equity_log.push(exchange.equity_point(ts_close_ms));
}

/// Drain one bar's emitted actions: exits first, then at most one entry
/// (the validator guarantees a single entry per case). Entries are skipped
/// when a soft gate failed; exits always apply.
#[allow(clippy::too_many_arguments)]
fn apply_actions(
    actions: &[&ActionDef],
    vp: &ValidatedPlay,
    exchange: &mut SimExchange,
    symbol: &str,
    snapshot: &crate::snapshot::Snapshot,
    bar: &Bar,
    bar_idx: usize,
    entries_allowed: bool,
) -> BarObservation {
    let mut observation = BarObservation::NoSignal;
    for action in actions {
        match action {
            ActionDef::Exit => {
                let closed_long =
                    exchange.close_signal(symbol, Side::Long, bar.close, bar.ts_close, bar_idx);
                let closed_short =
                    exchange.close_signal(symbol, Side::Short, bar.close, bar.ts_close, bar_idx);
                if closed_long || closed_short {
                    observation = BarObservation::SignalFilled;
                } else if observation == BarObservation::NoSignal {
                    observation = BarObservation::SignalDropped;
                }
            }
            ActionDef::Enter {
                side,
                size_pct,
                stop,
                take_profit,
            } => {
                let direction = match side {
                    Side::Long => Direction::Long,
                    Side::Short => Direction::Short,
                };
                let allowed = match side {
                    Side::Long => vp.play.position_policy.allow_long,
                    Side::Short => vp.play.position_policy.allow_short,
                };
                if !entries_allowed || !allowed {
                    observation = BarObservation::SignalDropped;
                    continue;
                }
                let signal = Signal {
                    direction,
                    symbol: symbol.to_string(),
                    size_pct: *size_pct,
                    stop: stop.clone(),
                    take_profit: take_profit.clone(),
                };
                let balance = exchange.balance();
                let sized = match size_order(
                    &signal,
                    &vp.play.risk_model,
                    &vp.play.account,
                    &balance,
                    bar.close,
                    snapshot,
                ) {
                    Ok(sized) => sized,
                    Err(e) => {
                        tracing::debug!(error = %e, "order sizing rejected");
                        observation = BarObservation::SignalRejected { code: e.code() };
                        continue;
                    }
                };
                let order = Order {
                    symbol: symbol.to_string(),
                    side: *side,
                    notional_usdt: sized.notional_usdt,
                    kind: OrderKind::Market,
                    limit_price: None,
                    trigger_price: None,
                    time_in_force: TimeInForce::GoodTillCancel,
                    reduce_only: false,
                    stop_price: sized.stop_price,
                    take_profit_price: sized.take_profit_price,
                };
                observation = match exchange.submit_order(order, bar.close, bar.ts_close, bar_idx) {
                    Ok(_) => BarObservation::SignalFilled,
                    Err(e) => {
                        tracing::debug!(error = %e, "order rejected");
                        BarObservation::SignalRejected { code: e.code() }
                    }
                };
            }
        }
    }
    observation
}
