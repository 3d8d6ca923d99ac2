//! Simulated USDT-linear exchange with isolated margin. One instance per
//! run; mutated exclusively by the engine, in a fixed per-bar order:
//! mark-to-market, intrabar TP/SL, liquidation, resting orders, funding.

pub mod sizing;

use crate::error::{PlaybackError, Result};
use crate::play::{AccountCfg, PositionPolicy};
use crate::types::{
    Bar, EquityPoint, ExitReason, FundingEvent, Order, OrderKind, Position, Side, TradeRecord,
};

pub use sizing::{size_order, SizedOrder};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Balance {
    pub cash: f64,
    pub equity: f64,
    pub used_margin: f64,
    pub free_margin: f64,
}

#[derive(Debug, Clone)]
struct RestingOrder {
    id: u64,
    order: Order,
}

pub struct SimExchange {
    account: AccountCfg,
    policy: PositionPolicy,
    cash: f64,
    positions: Vec<Position>,
    resting: Vec<RestingOrder>,
    trades: Vec<TradeRecord>,
    funding: Vec<FundingEvent>,
    funding_cursor: usize,
    peak_equity: f64,
    next_order_id: u64,
    next_trade_id: usize,
    /// Exec bar index of the most recent position close, for cooldown.
    pub last_close_bar: Option<usize>,
}

impl SimExchange {
    pub fn new(account: AccountCfg, policy: PositionPolicy, mut funding: Vec<FundingEvent>) -> Self {
        funding.sort_by_key(|f| f.ts_ms);
        let starting = account.starting_equity_usdt;
        Self {
            account,
            policy,
            cash: starting,
            positions: Vec::new(),
            resting: Vec::new(),
            trades: Vec::new(),
            funding,
            funding_cursor: 0,
            peak_equity: starting,
            next_order_id: 1,
            next_trade_id: 0,
            last_close_bar: None,
        }
    }

    fn slip(&self) -> f64 {
        self.account.slippage_bps / 10_000.0
    }

    fn taker_fee(&self, notional: f64) -> f64 {
        notional * self.account.taker_fee_bps / 10_000.0
    }

    fn maker_fee(&self, notional: f64) -> f64 {
        notional * self.account.maker_fee_bps / 10_000.0
    }

    /// Market fill price with adverse slippage: buying pays up, selling
    /// receives less.
    fn market_fill_price(&self, reference: f64, buying: bool) -> f64 {
        if buying {
            reference * (1.0 + self.slip())
        } else {
            reference * (1.0 - self.slip())
        }
    }

    pub fn balance(&self) -> Balance {
        let unrealized: f64 = self.positions.iter().map(|p| p.unrealized_pnl).sum();
        let used_margin: f64 = self.positions.iter().map(|p| p.margin_held_usdt).sum();
        let equity = self.cash + unrealized;
        Balance {
            cash: self.cash,
            equity,
            used_margin,
            free_margin: equity - used_margin,
        }
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn position(&self, symbol: &str, side: Side) -> Option<&Position> {
        self.positions
            .iter()
            .find(|p| p.symbol == symbol && p.side == side)
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn total_exposure(&self) -> f64 {
        self.positions
            .iter()
            .map(|p| p.quantity * p.entry_price)
            .sum()
    }

    /// Per-bar exchange step, run before strategy evaluation.
    pub fn step(&mut self, bar: &Bar, prev_bar: Option<&Bar>, bar_idx: usize) {
        // 1. Mark-to-market at the bar close (the single mark source).
        for p in &mut self.positions {
            p.unrealized_pnl = p.pnl_at(bar.close);
        }

        // 2. Intrabar TP/SL. Same-bar ambiguity resolves stop-first for both
        // sides, independent of trade age. Doji point bars only fill on
        // exact trigger equality, at the trigger itself.
        self.resolve_intrabar(bar, bar_idx);

        // 3. Liquidation at the precomputed isolated-margin price.
        self.check_liquidation(bar, bar_idx);

        // 4. Resting orders (limit fills at the limit price, stop orders
        // convert to market with slippage).
        self.fill_resting(bar, bar_idx);

        // 5. Funding events in (prev.ts_close, bar.ts_close].
        let window_start = prev_bar.map_or(i64::MIN, |b| b.ts_close);
        self.apply_funding(window_start, bar.ts_close, bar.close);

        // 6. Refresh marks and the equity peak.
        for p in &mut self.positions {
            p.unrealized_pnl = p.pnl_at(bar.close);
        }
        let equity = self.balance().equity;
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
    }

    fn resolve_intrabar(&mut self, bar: &Bar, bar_idx: usize) {
        let mut to_close: Vec<(usize, f64, ExitReason)> = Vec::new();
        for (i, p) in self.positions.iter().enumerate() {
            if p.entry_bar_idx >= bar_idx {
                // Entered on this bar's close; triggers are live next bar.
                continue;
            }
            let doji = bar.is_doji_point();
            let stop_hit = p.stop_price.is_some_and(|stop| {
                if doji {
                    bar.close == stop
                } else {
                    match p.side {
                        Side::Long => bar.low <= stop,
                        Side::Short => bar.high >= stop,
                    }
                }
            });
            if stop_hit {
                let stop = p.stop_price.unwrap();
                let price = if doji {
                    stop
                } else {
                    // Exit side is opposite the position side.
                    self.market_fill_price(stop, p.side == Side::Short)
                };
                to_close.push((i, price, ExitReason::StopLoss));
                continue;
            }
            let tp_hit = p.take_profit_price.is_some_and(|tp| {
                if doji {
                    bar.close == tp
                } else {
                    match p.side {
                        Side::Long => bar.high >= tp,
                        Side::Short => bar.low <= tp,
                    }
                }
            });
            if tp_hit {
                let tp = p.take_profit_price.unwrap();
                let price = if doji {
                    tp
                } else {
                    self.market_fill_price(tp, p.side == Side::Short)
                };
                to_close.push((i, price, ExitReason::TakeProfit));
            }
        }
        for (i, price, reason) in to_close.into_iter().rev() {
            self.close_at(i, price, bar.ts_close, bar_idx, reason, true);
        }
    }

    fn check_liquidation(&mut self, bar: &Bar, bar_idx: usize) {
        let mut to_close: Vec<(usize, f64)> = Vec::new();
        for (i, p) in self.positions.iter().enumerate() {
            let hit = match p.side {
                Side::Long => bar.low <= p.liquidation_price,
                Side::Short => bar.high >= p.liquidation_price,
            };
            if hit {
                to_close.push((i, p.liquidation_price));
            }
        }
        for (i, price) in to_close.into_iter().rev() {
            tracing::warn!(price, "position liquidated");
            self.close_at(i, price, bar.ts_close, bar_idx, ExitReason::Liquidation, true);
        }
    }

    fn fill_resting(&mut self, bar: &Bar, bar_idx: usize) {
        let pending = std::mem::take(&mut self.resting);
        for resting in pending {
            let order = &resting.order;
            let fill = match order.kind {
                OrderKind::Market => Some((bar.close, true)),
                OrderKind::Limit => {
                    let limit = order.limit_price.unwrap_or(bar.close);
                    let crossed = match order.side {
                        Side::Long => bar.low <= limit,
                        Side::Short => bar.high >= limit,
                    };
                    // Limit fills never suffer adverse slippage.
                    crossed.then_some((limit, false))
                }
                OrderKind::StopMarket | OrderKind::StopLimit => {
                    let trigger = order.trigger_price.unwrap_or(bar.close);
                    let triggered = match order.side {
                        Side::Long => bar.high >= trigger,
                        Side::Short => bar.low <= trigger,
                    };
                    triggered.then_some((
                        self.market_fill_price(trigger, order.side == Side::Long),
                        true,
                    ))
                }
            };
            match fill {
                Some((price, taker)) => {
                    if let Err(e) =
                        self.open_position_from(order, price, taker, bar.ts_close, bar_idx)
                    {
                        tracing::debug!(error = %e, "resting order rejected at fill");
                    }
                }
                None => self.resting.push(resting),
            }
        }
    }

    fn apply_funding(&mut self, after_ts: i64, until_ts: i64, mark: f64) {
        while self.funding_cursor < self.funding.len() {
            let event = self.funding[self.funding_cursor];
            if event.ts_ms <= after_ts {
                self.funding_cursor += 1;
                continue;
            }
            if event.ts_ms > until_ts {
                break;
            }
            for p in &self.positions {
                // Longs pay a positive rate, shorts receive it.
                let cost = event.rate * p.notional_at(mark) * p.side.multiplier();
                self.cash -= cost;
            }
            self.funding_cursor += 1;
        }
    }

    /// Submit an order at a bar close. Market orders fill immediately at the
    /// close with adverse slippage; others rest until their price condition.
    pub fn submit_order(&mut self, order: Order, close_price: f64, ts: i64, bar_idx: usize) -> Result<u64> {
        let opposite_idx = self
            .positions
            .iter()
            .position(|p| p.symbol == order.symbol && p.side == order.side.opposite());
        if order.reduce_only {
            // A reduce-only order may only close the opposite-side position.
            let Some(idx) = opposite_idx else {
                return Err(PlaybackError::NoOppositePositionToClose);
            };
            let price = self.market_fill_price(close_price, order.side == Side::Long);
            self.close_at(idx, price, ts, bar_idx, ExitReason::Signal, true);
            return Ok(0);
        }
        if let Some(idx) = opposite_idx {
            if !self.policy.allow_flip {
                return Err(PlaybackError::NoOppositePositionToClose);
            }
            let price = self.market_fill_price(close_price, order.side == Side::Long);
            self.close_at(idx, price, ts, bar_idx, ExitReason::Flip, true);
        }

        match order.kind {
            OrderKind::Market => {
                let price = self.market_fill_price(close_price, order.side == Side::Long);
                self.open_position_from(&order, price, true, ts, bar_idx)?;
                Ok(0)
            }
            _ => {
                let id = self.next_order_id;
                self.next_order_id += 1;
                self.resting.push(RestingOrder { id, order });
                Ok(id)
            }
        }
    }

    pub fn cancel_order(&mut self, id: u64) -> bool {
        let before = self.resting.len();
        self.resting.retain(|r| r.id != id);
        before != self.resting.len()
    }

    fn open_position_from(
        &mut self,
        order: &Order,
        price: f64,
        taker: bool,
        ts: i64,
        bar_idx: usize,
    ) -> Result<()> {
        debug_assert!(
            self.position(&order.symbol, order.side).is_none(),
            "position limit is enforced by the pre-trade gates"
        );
        let notional = order.notional_usdt;
        if notional < self.account.min_trade_notional_usdt {
            return Err(PlaybackError::BelowMinNotional {
                notional,
                min: self.account.min_trade_notional_usdt,
            });
        }
        let margin = notional / self.account.max_leverage;
        let fee = if taker {
            self.taker_fee(notional)
        } else {
            self.maker_fee(notional)
        };
        let free = self.balance().free_margin;
        if margin + fee > free {
            return Err(PlaybackError::InsufficientMargin {
                required: margin + fee,
                free,
            });
        }

        let quantity = notional / price;
        let maint = self.account.maintenance_margin_rate;
        let liq_offset = margin * (1.0 - maint) / quantity;
        let liquidation_price = match order.side {
            Side::Long => price - liq_offset,
            Side::Short => price + liq_offset,
        };

        self.cash -= fee;
        self.positions.push(Position {
            symbol: order.symbol.clone(),
            side: order.side,
            entry_price: price,
            quantity,
            stop_price: order.stop_price,
            take_profit_price: order.take_profit_price,
            unrealized_pnl: 0.0,
            margin_held_usdt: margin,
            liquidation_price,
            entry_ts_ms: ts,
            entry_bar_idx: bar_idx,
            entry_fees: fee,
        });
        tracing::debug!(side = %order.side, notional, price, "position opened");
        Ok(())
    }

    /// Close a position requested by the strategy (signal exit) at the bar
    /// close with adverse slippage.
    pub fn close_signal(&mut self, symbol: &str, side: Side, close_price: f64, ts: i64, bar_idx: usize) -> bool {
        let Some(idx) = self
            .positions
            .iter()
            .position(|p| p.symbol == symbol && p.side == side)
        else {
            return false;
        };
        let price = self.market_fill_price(close_price, side == Side::Short);
        self.close_at(idx, price, ts, bar_idx, ExitReason::Signal, true);
        true
    }

    /// Close every open position at the last mark (run stop / cancel).
    pub fn close_all(&mut self, mark: f64, ts: i64, bar_idx: usize) {
        while !self.positions.is_empty() {
            self.close_at(0, mark, ts, bar_idx, ExitReason::RunStop, true);
        }
        self.resting.clear();
    }

    fn close_at(
        &mut self,
        idx: usize,
        price: f64,
        ts: i64,
        bar_idx: usize,
        reason: ExitReason,
        taker: bool,
    ) {
        let p = self.positions.remove(idx);
        let pnl = p.pnl_at(price);
        let exit_notional = p.quantity * price;
        let fee = if taker {
            self.taker_fee(exit_notional)
        } else {
            self.maker_fee(exit_notional)
        };
        self.cash += pnl;
        self.cash -= fee;
        self.next_trade_id += 1;
        self.trades.push(TradeRecord {
            trade_id: self.next_trade_id,
            symbol: p.symbol.clone(),
            side: p.side,
            entry_ts_ms: p.entry_ts_ms,
            exit_ts_ms: ts,
            entry_price: p.entry_price,
            exit_price: price,
            quantity: p.quantity,
            notional_usdt: p.quantity * p.entry_price,
            fees_usdt: p.entry_fees + fee,
            pnl_usdt: pnl,
            bars_held: bar_idx.saturating_sub(p.entry_bar_idx),
            stop_hit: reason == ExitReason::StopLoss,
            tp_hit: reason == ExitReason::TakeProfit,
            exit_reason: reason,
        });
        self.last_close_bar = Some(bar_idx);
        tracing::debug!(side = %p.side, pnl, ?reason, "position closed");
    }

    pub fn equity_point(&self, ts_close_ms: i64) -> EquityPoint {
        let balance = self.balance();
        let drawdown_pct = if self.peak_equity > 0.0 {
            ((self.peak_equity - balance.equity) / self.peak_equity * 100.0).max(0.0)
        } else {
            0.0
        };
        EquityPoint {
            ts_close_ms,
            equity_usdt: balance.equity,
            cash_usdt: balance.cash,
            unrealized_pnl_usdt: balance.equity - balance.cash,
            drawdown_pct,
        }
    }

    pub fn peak_equity(&self) -> f64 {
        self.peak_equity
    }
}
