//! Performance metrics from the equity curve and trade log. Annualization
//! is TF-strict: the factor comes from the exec timeframe's bars-per-year;
//! the closed `Timeframe` enum means no unknown TF survives parsing.

use serde::Serialize;

use crate::types::{EquityPoint, Timeframe, TradeRecord};

/// Finite stand-in when there are no losing trades (infinity is not valid
/// JSON).
const MAX_PROFIT_FACTOR: f64 = 999.99;

const MS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0 * 1000.0;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Metrics {
    pub total_return_pct: f64,
    pub cagr: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    /// Max drawdown in percent terms, with its own peak/trough pair.
    pub max_drawdown_pct: f64,
    pub max_drawdown_pct_peak_ts_ms: i64,
    pub max_drawdown_pct_trough_ts_ms: i64,
    /// Max drawdown in absolute USDT, tracked independently; its trough is
    /// not necessarily the percent drawdown's trough.
    pub max_drawdown_usdt: f64,
    pub max_drawdown_usdt_trough_ts_ms: i64,
    pub trade_count: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub avg_win_usdt: f64,
    pub avg_loss_usdt: f64,
    pub avg_bars_held: f64,
    pub expectancy_usdt: f64,
    pub max_consecutive_losses: usize,
    pub total_fees_usdt: f64,
}

struct TradeStats {
    win_rate: f64,
    profit_factor: f64,
    avg_win: f64,
    avg_loss: f64,
    avg_bars_held: f64,
    expectancy: f64,
    max_consecutive_losses: usize,
    total_fees: f64,
}

pub fn compute_metrics(
    equity: &[EquityPoint],
    trades: &[TradeRecord],
    initial_capital: f64,
    exec_tf: Timeframe,
) -> Metrics {
    let ts = trade_stats(trades);
    let (dd_pct, dd_pct_peak_ts, dd_pct_trough_ts, dd_abs, dd_abs_trough_ts) =
        drawdowns(equity, initial_capital);

    let final_equity = equity.last().map_or(initial_capital, |e| e.equity_usdt);
    let total_return_pct = if initial_capital > 0.0 {
        (final_equity - initial_capital) / initial_capital * 100.0
    } else {
        0.0
    };

    let (sharpe, sortino) = risk_adjusted(equity, initial_capital, exec_tf);

    let years = match (equity.first(), equity.last()) {
        (Some(first), Some(last)) if last.ts_close_ms > first.ts_close_ms => {
            (last.ts_close_ms - first.ts_close_ms) as f64 / MS_PER_YEAR
        }
        _ => 0.0,
    };
    let cagr = if years > 0.0 && final_equity > 0.0 && initial_capital > 0.0 {
        // Geometric annualized growth.
        (final_equity / initial_capital).powf(1.0 / years) - 1.0
    } else {
        0.0
    };
    let calmar = if dd_pct > 0.0 { cagr / (dd_pct / 100.0) } else { 0.0 };

    Metrics {
        total_return_pct,
        cagr,
        sharpe,
        sortino,
        calmar,
        max_drawdown_pct: dd_pct,
        max_drawdown_pct_peak_ts_ms: dd_pct_peak_ts,
        max_drawdown_pct_trough_ts_ms: dd_pct_trough_ts,
        max_drawdown_usdt: dd_abs,
        max_drawdown_usdt_trough_ts_ms: dd_abs_trough_ts,
        trade_count: trades.len(),
        win_rate: ts.win_rate,
        profit_factor: ts.profit_factor,
        avg_win_usdt: ts.avg_win,
        avg_loss_usdt: ts.avg_loss,
        avg_bars_held: ts.avg_bars_held,
        expectancy_usdt: ts.expectancy,
        max_consecutive_losses: ts.max_consecutive_losses,
        total_fees_usdt: ts.total_fees,
    }
}

/// Percent and absolute drawdowns with independent (peak, trough) tracking.
fn drawdowns(equity: &[EquityPoint], initial: f64) -> (f64, i64, i64, f64, i64) {
    let mut peak = initial;
    let mut peak_ts = equity.first().map_or(0, |e| e.ts_close_ms);
    let mut max_pct = 0.0;
    let mut max_pct_peak_ts = peak_ts;
    let mut max_pct_trough_ts = peak_ts;
    let mut max_abs = 0.0;
    let mut max_abs_trough_ts = peak_ts;

    for point in equity {
        if point.equity_usdt > peak {
            peak = point.equity_usdt;
            peak_ts = point.ts_close_ms;
        }
        let abs_dd = peak - point.equity_usdt;
        if abs_dd > max_abs {
            max_abs = abs_dd;
            max_abs_trough_ts = point.ts_close_ms;
        }
        if peak > 0.0 {
            let pct_dd = abs_dd / peak * 100.0;
            if pct_dd > max_pct {
                max_pct = pct_dd;
                max_pct_peak_ts = peak_ts;
                max_pct_trough_ts = point.ts_close_ms;
            }
        }
    }
    (max_pct, max_pct_peak_ts, max_pct_trough_ts, max_abs, max_abs_trough_ts)
}

fn risk_adjusted(equity: &[EquityPoint], initial: f64, exec_tf: Timeframe) -> (f64, f64) {
    if equity.len() < 2 {
        return (0.0, 0.0);
    }
    let mut returns = Vec::with_capacity(equity.len());
    let mut prev = initial;
    for point in equity {
        if prev > 0.0 {
            returns.push((point.equity_usdt - prev) / prev);
        }
        prev = point.equity_usdt;
    }
    if returns.len() < 2 {
        return (0.0, 0.0);
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = variance.sqrt();
    let downside: Vec<f64> = returns.iter().filter(|r| **r < 0.0).copied().collect();
    let downside_std = if downside.is_empty() {
        0.0
    } else {
        (downside.iter().map(|r| r.powi(2)).sum::<f64>() / n).sqrt()
    };

    let annualization = exec_tf.bars_per_year().sqrt();
    let sharpe = if std > 0.0 { mean / std * annualization } else { 0.0 };
    let sortino = if downside_std > 0.0 {
        mean / downside_std * annualization
    } else {
        0.0
    };
    (sharpe, sortino)
}

fn trade_stats(trades: &[TradeRecord]) -> TradeStats {
    if trades.is_empty() {
        return TradeStats {
            win_rate: 0.0,
            profit_factor: 0.0,
            avg_win: 0.0,
            avg_loss: 0.0,
            avg_bars_held: 0.0,
            expectancy: 0.0,
            max_consecutive_losses: 0,
            total_fees: 0.0,
        };
    }
    let total = trades.len() as f64;
    let mut wins = 0usize;
    let mut losses = 0usize;
    let mut win_sum = 0.0;
    let mut loss_sum = 0.0;
    let mut bars_sum = 0usize;
    let mut fees = 0.0;
    let mut streak = 0usize;
    let mut max_streak = 0usize;

    for t in trades {
        bars_sum += t.bars_held;
        fees += t.fees_usdt;
        if t.pnl_usdt > 0.0 {
            wins += 1;
            win_sum += t.pnl_usdt;
            streak = 0;
        } else if t.pnl_usdt < 0.0 {
            losses += 1;
            loss_sum += t.pnl_usdt;
            streak += 1;
            max_streak = max_streak.max(streak);
        } else {
            // Scratch trades break loss streaks but count as neither.
            streak = 0;
        }
    }

    let win_rate = wins as f64 / total;
    let loss_rate = losses as f64 / total;
    let profit_factor = if loss_sum < 0.0 {
        win_sum / loss_sum.abs()
    } else if win_sum > 0.0 {
        MAX_PROFIT_FACTOR
    } else {
        0.0
    };
    let avg_win = if wins > 0 { win_sum / wins as f64 } else { 0.0 };
    let avg_loss = if losses > 0 { loss_sum / losses as f64 } else { 0.0 };

    TradeStats {
        win_rate,
        profit_factor,
        avg_win,
        avg_loss,
        avg_bars_held: bars_sum as f64 / total,
        expectancy: win_rate * avg_win + loss_rate * avg_loss,
        max_consecutive_losses: max_streak,
        total_fees: fees,
    }
}
