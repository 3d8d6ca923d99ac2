//! Pre-trade gate evaluator: runs before strategy evaluation on every ready
//! bar; the first failing gate wins.

use crate::exchange::SimExchange;
use crate::play::PositionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateResult {
    Pass,
    WarmupRemaining,
    HistoryNotReady,
    InsufficientMargin,
    PositionLimit,
    ExposureLimit,
    CooldownActive,
    RiskBlock,
}

impl GateResult {
    pub fn code(self) -> &'static str {
        match self {
            Self::Pass => "G_PASS",
            Self::WarmupRemaining => "G_WARMUP_REMAINING",
            Self::HistoryNotReady => "G_HISTORY_NOT_READY",
            Self::InsufficientMargin => "G_INSUFFICIENT_MARGIN",
            Self::PositionLimit => "G_POSITION_LIMIT",
            Self::ExposureLimit => "G_EXPOSURE_LIMIT",
            Self::CooldownActive => "G_COOLDOWN_ACTIVE",
            Self::RiskBlock => "G_RISK_BLOCK",
        }
    }

    pub fn passed(self) -> bool {
        self == Self::Pass
    }
}

pub fn evaluate_gates(
    bar_idx: usize,
    sim_start_idx: usize,
    symbol: &str,
    policy: &PositionPolicy,
    exchange: &SimExchange,
) -> GateResult {
    if bar_idx < sim_start_idx {
        return GateResult::WarmupRemaining;
    }
    // Crossovers need one closed bar of history beyond the current one.
    if bar_idx == 0 {
        return GateResult::HistoryNotReady;
    }
    let balance = exchange.balance();
    if balance.free_margin < policy.min_free_margin_usdt || balance.free_margin <= 0.0 {
        return GateResult::InsufficientMargin;
    }
    let open_on_symbol = exchange
        .positions()
        .iter()
        .filter(|p| p.symbol == symbol)
        .count();
    if open_on_symbol >= policy.max_positions_per_symbol {
        return GateResult::PositionLimit;
    }
    if let Some(cap) = policy.max_total_exposure_usdt {
        if exchange.total_exposure() >= cap {
            return GateResult::ExposureLimit;
        }
    }
    if policy.cooldown_bars > 0 {
        if let Some(last_close) = exchange.last_close_bar {
            if bar_idx.saturating_sub(last_close) <= policy.cooldown_bars {
                return GateResult::CooldownActive;
            }
        }
    }
    if let Some(max_dd) = policy.max_drawdown_pct {
        let peak = exchange.peak_equity();
        if peak > 0.0 {
            let dd = (peak - balance.equity) / peak * 100.0;
            if dd >= max_dd {
                return GateResult::RiskBlock;
            }
        }
    }
    GateResult::Pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::play::{AccountCfg, MarginMode};
    use crate::types::{Order, OrderKind, Side, TimeInForce};

    fn account() -> AccountCfg {
        AccountCfg {
            starting_equity_usdt: 10_000.0,
            max_leverage: 3.0,
            margin_mode: MarginMode::Isolated,
            min_trade_notional_usdt: 10.0,
            taker_fee_bps: 5.5,
            maker_fee_bps: 2.0,
            slippage_bps: 2.0,
            maintenance_margin_rate: 0.005,
        }
    }

    fn open_long(ex: &mut SimExchange, notional: f64) {
        ex.submit_order(
            Order {
                symbol: "BTCUSDT".into(),
                side: Side::Long,
                notional_usdt: notional,
                kind: OrderKind::Market,
                limit_price: None,
                trigger_price: None,
                time_in_force: TimeInForce::GoodTillCancel,
                reduce_only: false,
                stop_price: None,
                take_profit_price: None,
            },
            100.0,
            900_000,
            0,
        )
        .unwrap();
    }

    #[test]
    fn warmup_gate_first() {
        let policy = PositionPolicy::default();
        let ex = SimExchange::new(account(), policy.clone(), vec![]);
        assert_eq!(
            evaluate_gates(5, 10, "BTCUSDT", &policy, &ex),
            GateResult::WarmupRemaining
        );
        assert_eq!(
            evaluate_gates(10, 10, "BTCUSDT", &policy, &ex),
            GateResult::Pass
        );
    }

    #[test]
    fn position_limit_gate() {
        let policy = PositionPolicy::default();
        let mut ex = SimExchange::new(account(), policy.clone(), vec![]);
        open_long(&mut ex, 1000.0);
        assert_eq!(
            evaluate_gates(10, 5, "BTCUSDT", &policy, &ex),
            GateResult::PositionLimit
        );
        // A different symbol is unaffected.
        assert_eq!(
            evaluate_gates(10, 5, "ETHUSDT", &policy, &ex),
            GateResult::Pass
        );
    }

    #[test]
    fn exposure_gate() {
        let mut policy = PositionPolicy::default();
        policy.max_positions_per_symbol = 4;
        policy.max_total_exposure_usdt = Some(500.0);
        let mut ex = SimExchange::new(account(), policy.clone(), vec![]);
        open_long(&mut ex, 1000.0);
        assert_eq!(
            evaluate_gates(10, 5, "ETHUSDT", &policy, &ex),
            GateResult::ExposureLimit
        );
    }

    #[test]
    fn cooldown_gate() {
        let mut policy = PositionPolicy::default();
        policy.cooldown_bars = 3;
        let mut ex = SimExchange::new(account(), policy.clone(), vec![]);
        ex.last_close_bar = Some(10);
        assert_eq!(
            evaluate_gates(12, 5, "BTCUSDT", &policy, &ex),
            GateResult::CooldownActive
        );
        assert_eq!(
            evaluate_gates(14, 5, "BTCUSDT", &policy, &ex),
            GateResult::Pass
        );
    }

    #[test]
    fn risk_block_on_drawdown() {
        let mut policy = PositionPolicy::default();
        policy.max_drawdown_pct = Some(5.0);
        let mut ex = SimExchange::new(account(), policy.clone(), vec![]);
        open_long(&mut ex, 9000.0);
        // Crash the mark without hitting liquidation.
        let bar = crate::types::Bar {
            ts_open: 900_000,
            ts_close: 1_800_000,
            open: 100.0,
            high: 100.0,
            low: 90.0,
            close: 90.0,
            volume: 1.0,
        };
        ex.step(&bar, None, 1);
        // Another symbol passes the position-limit gate and hits the
        // drawdown block.
        assert_eq!(
            evaluate_gates(2, 1, "ETHUSDT", &policy, &ex),
            GateResult::RiskBlock
        );
    }

    #[test]
    fn gate_codes_are_stable() {
        assert_eq!(GateResult::Pass.code(), "G_PASS");
        assert_eq!(GateResult::CooldownActive.code(), "G_COOLDOWN_ACTIVE");
        assert_eq!(GateResult::WarmupRemaining.code(), "G_WARMUP_REMAINING");
    }
}
