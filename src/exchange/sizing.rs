//! Risk sizing: turn a strategy signal into an order notional under the
//! account's leverage and margin constraints. Sizing down to the leverage
//! cap is allowed; falling below the minimum notional is a rejection.

use crate::error::{PlaybackError, Result};
use crate::play::{AccountCfg, RiskModel, SizingMode};
use crate::snapshot::{FeaturePath, Snapshot};
use crate::types::{PriceRef, Side, Signal};

use super::Balance;

/// A fully sized order: notional plus resolved stop/take-profit prices.
#[derive(Debug, Clone, PartialEq)]
pub struct SizedOrder {
    pub notional_usdt: f64,
    pub stop_price: Option<f64>,
    pub take_profit_price: Option<f64>,
}

/// Resolve a price reference against the entry price and the decision
/// snapshot. `is_stop` selects which side of the entry a percent distance
/// lands on.
fn resolve_price_ref(
    price_ref: &PriceRef,
    side: Side,
    entry_price: f64,
    snapshot: &Snapshot,
    is_stop: bool,
) -> Result<f64> {
    match price_ref {
        PriceRef::Abs(p) => Ok(*p),
        PriceRef::Pct(pct) => {
            let frac = pct / 100.0;
            // Stops sit against the position, targets with it.
            let adverse = is_stop;
            let below = matches!(side, Side::Long) == adverse;
            Ok(if below {
                entry_price * (1.0 - frac)
            } else {
                entry_price * (1.0 + frac)
            })
        }
        PriceRef::Path(path) => {
            let parsed = FeaturePath::parse(path)?;
            snapshot.get(&parsed, 0)
        }
    }
}

/// Size a signal into an order. The sizing mode sets the desired notional;
/// the leverage cap and free margin shrink it; the minimum notional floor
/// rejects what remains, if too small.
pub fn size_order(
    signal: &Signal,
    risk: &RiskModel,
    account: &AccountCfg,
    balance: &Balance,
    entry_price: f64,
    snapshot: &Snapshot,
) -> Result<SizedOrder> {
    let side = match signal.direction {
        crate::types::Direction::Long => Side::Long,
        crate::types::Direction::Short => Side::Short,
        crate::types::Direction::Flat => {
            return Err(PlaybackError::BelowMinNotional {
                notional: 0.0,
                min: account.min_trade_notional_usdt,
            })
        }
    };

    let stop_ref = signal.stop.as_ref().or(risk.stop_loss.as_ref());
    let tp_ref = signal.take_profit.as_ref().or(risk.take_profit.as_ref());
    let stop_price = stop_ref
        .map(|r| resolve_price_ref(r, side, entry_price, snapshot, true))
        .transpose()?;
    let take_profit_price = tp_ref
        .map(|r| resolve_price_ref(r, side, entry_price, snapshot, false))
        .transpose()?;

    // Sanity: a stop on the wrong side of entry would fill instantly.
    if let Some(stop) = stop_price {
        let inverted = match side {
            Side::Long => stop >= entry_price,
            Side::Short => stop <= entry_price,
        };
        if inverted {
            return Err(PlaybackError::InvalidPlay(format!(
                "stop {stop} on the wrong side of entry {entry_price}"
            )));
        }
    }

    let equity = balance.equity;
    let desired = match (&risk.sizing, signal.size_pct) {
        (_, Some(pct)) => equity * pct / 100.0,
        (SizingMode::PercentEquity { pct }, None) => equity * pct / 100.0,
        (SizingMode::FixedUsdt { usdt }, None) => *usdt,
        (SizingMode::RiskPerTradePct { pct }, None) => {
            let stop = stop_price.ok_or_else(|| {
                PlaybackError::InvalidPlay("risk_per_trade_pct sizing requires a stop".into())
            })?;
            let per_unit_loss = (entry_price - stop).abs();
            if per_unit_loss <= 0.0 {
                return Err(PlaybackError::InvalidPlay(
                    "risk_per_trade_pct sizing requires a nonzero stop distance".into(),
                ));
            }
            let risk_usdt = equity * pct / 100.0;
            risk_usdt / per_unit_loss * entry_price
        }
    };

    // Cap at what free margin supports at max leverage, fees included:
    // margin + fee <= free  =>  notional <= free / (1/lev + fee_rate).
    // The shave keeps the capped order inside the margin check under
    // floating-point round-off.
    let fee_rate = account.taker_fee_bps / 10_000.0;
    let cap = balance.free_margin / (1.0 / account.max_leverage + fee_rate) * (1.0 - 1e-9);
    let notional = desired.min(cap.max(0.0));

    if notional < account.min_trade_notional_usdt {
        return Err(PlaybackError::BelowMinNotional {
            notional,
            min: account.min_trade_notional_usdt,
        });
    }

    Ok(SizedOrder {
        notional_usdt: notional,
        stop_price,
        take_profit_price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::store::bars_from_closes;
    use crate::feed::FeedStore;
    use crate::snapshot::FeedSet;
    use crate::types::{Direction, Timeframe};

    fn account() -> AccountCfg {
        AccountCfg {
            starting_equity_usdt: 10_000.0,
            max_leverage: 3.0,
            margin_mode: crate::play::MarginMode::Isolated,
            min_trade_notional_usdt: 10.0,
            taker_fee_bps: 5.5,
            maker_fee_bps: 2.0,
            slippage_bps: 2.0,
            maintenance_margin_rate: 0.005,
        }
    }

    fn balance(equity: f64) -> Balance {
        Balance {
            cash: equity,
            equity,
            used_margin: 0.0,
            free_margin: equity,
        }
    }

    fn risk(sizing: SizingMode) -> RiskModel {
        RiskModel {
            sizing,
            stop_loss: None,
            take_profit: None,
        }
    }

    fn signal(direction: Direction) -> Signal {
        Signal {
            direction,
            symbol: "BTCUSDT".into(),
            size_pct: None,
            stop: None,
            take_profit: None,
        }
    }

    fn feeds() -> FeedSet {
        let closes = vec![100.0; 8];
        let bars = bars_from_closes(&closes, Timeframe::M15, 0);
        FeedSet {
            exec: FeedStore::from_bars(&bars, Timeframe::M15).unwrap(),
            mid: None,
            high: None,
        }
    }

    #[test]
    fn percent_equity_sizing() {
        let feeds = feeds();
        let snap = feeds.snapshot_at(5).unwrap();
        let sized = size_order(
            &signal(Direction::Long),
            &risk(SizingMode::PercentEquity { pct: 2.0 }),
            &account(),
            &balance(10_000.0),
            100.0,
            &snap,
        )
        .unwrap();
        assert!((sized.notional_usdt - 200.0).abs() < 1e-9);
    }

    #[test]
    fn oversized_order_capped_at_leverage() {
        let feeds = feeds();
        let snap = feeds.snapshot_at(5).unwrap();
        let sized = size_order(
            &signal(Direction::Long),
            &risk(SizingMode::PercentEquity { pct: 200.0 }),
            &account(),
            &balance(10_000.0),
            100.0,
            &snap,
        )
        .unwrap();
        // Desired 20k capped to free / (1/3 + 0.00055) ~ 29.95k; desired wins.
        assert!((sized.notional_usdt - 20_000.0).abs() < 1e-9);

        let sized = size_order(
            &signal(Direction::Long),
            &risk(SizingMode::PercentEquity { pct: 400.0 }),
            &account(),
            &balance(10_000.0),
            100.0,
            &snap,
        )
        .unwrap();
        let cap = 10_000.0 / (1.0 / 3.0 + 0.00055);
        assert!((sized.notional_usdt - cap).abs() < 1e-3);
    }

    #[test]
    fn capped_below_min_notional_rejected() {
        let feeds = feeds();
        let snap = feeds.snapshot_at(5).unwrap();
        // Tiny account: cap lands under the minimum notional.
        let mut acct = account();
        acct.min_trade_notional_usdt = 100.0;
        let err = size_order(
            &signal(Direction::Long),
            &risk(SizingMode::PercentEquity { pct: 200.0 }),
            &acct,
            &balance(20.0),
            100.0,
            &snap,
        )
        .unwrap_err();
        assert!(matches!(err, PlaybackError::BelowMinNotional { .. }));
    }

    #[test]
    fn risk_per_trade_uses_stop_distance() {
        let feeds = feeds();
        let snap = feeds.snapshot_at(5).unwrap();
        let mut sig = signal(Direction::Long);
        sig.stop = Some(PriceRef::Abs(98.0));
        let sized = size_order(
            &sig,
            &risk(SizingMode::RiskPerTradePct { pct: 1.0 }),
            &account(),
            &balance(10_000.0),
            100.0,
            &snap,
        )
        .unwrap();
        // Risk 100 USDT over a 2.0 stop distance: 50 units = 5000 notional.
        assert!((sized.notional_usdt - 5_000.0).abs() < 1e-9);
        assert_eq!(sized.stop_price, Some(98.0));
    }

    #[test]
    fn risk_per_trade_without_stop_errors() {
        let feeds = feeds();
        let snap = feeds.snapshot_at(5).unwrap();
        let err = size_order(
            &signal(Direction::Long),
            &risk(SizingMode::RiskPerTradePct { pct: 1.0 }),
            &account(),
            &balance(10_000.0),
            100.0,
            &snap,
        )
        .unwrap_err();
        assert!(matches!(err, PlaybackError::InvalidPlay(_)));
    }

    #[test]
    fn pct_stop_sides() {
        let feeds = feeds();
        let snap = feeds.snapshot_at(5).unwrap();
        let mut sig = signal(Direction::Long);
        sig.stop = Some(PriceRef::Pct(1.0));
        sig.take_profit = Some(PriceRef::Pct(2.0));
        let sized = size_order(
            &sig,
            &risk(SizingMode::PercentEquity { pct: 2.0 }),
            &account(),
            &balance(10_000.0),
            100.0,
            &snap,
        )
        .unwrap();
        assert!((sized.stop_price.unwrap() - 99.0).abs() < 1e-9);
        assert!((sized.take_profit_price.unwrap() - 102.0).abs() < 1e-9);

        let mut sig = signal(Direction::Short);
        sig.stop = Some(PriceRef::Pct(1.0));
        sig.take_profit = Some(PriceRef::Pct(2.0));
        let sized = size_order(
            &sig,
            &risk(SizingMode::PercentEquity { pct: 2.0 }),
            &account(),
            &balance(10_000.0),
            100.0,
            &snap,
        )
        .unwrap();
        assert!((sized.stop_price.unwrap() - 101.0).abs() < 1e-9);
        assert!((sized.take_profit_price.unwrap() - 98.0).abs() < 1e-9);
    }

    #[test]
    fn stop_from_snapshot_path() {
        let closes = vec![100.0; 8];
        let bars = bars_from_closes(&closes, Timeframe::M15, 0);
        let mut exec = FeedStore::from_bars(&bars, Timeframe::M15).unwrap();
        exec.insert_column("support".into(), vec![97.5; 8]);
        let feeds = FeedSet {
            exec,
            mid: None,
            high: None,
        };
        let snap = feeds.snapshot_at(5).unwrap();
        let mut sig = signal(Direction::Long);
        sig.stop = Some(PriceRef::Path("indicator.exec.support".into()));
        let sized = size_order(
            &sig,
            &risk(SizingMode::PercentEquity { pct: 2.0 }),
            &account(),
            &balance(10_000.0),
            100.0,
            &snap,
        )
        .unwrap();
        assert_eq!(sized.stop_price, Some(97.5));
    }

    #[test]
    fn inverted_stop_rejected() {
        let feeds = feeds();
        let snap = feeds.snapshot_at(5).unwrap();
        let mut sig = signal(Direction::Long);
        sig.stop = Some(PriceRef::Abs(105.0)); // above a long entry
        let err = size_order(
            &sig,
            &risk(SizingMode::PercentEquity { pct: 2.0 }),
            &account(),
            &balance(10_000.0),
            100.0,
            &snap,
        )
        .unwrap_err();
        assert!(matches!(err, PlaybackError::InvalidPlay(_)));
    }

    #[test]
    fn signal_size_override_wins() {
        let feeds = feeds();
        let snap = feeds.snapshot_at(5).unwrap();
        let mut sig = signal(Direction::Long);
        sig.size_pct = Some(5.0);
        let sized = size_order(
            &sig,
            &risk(SizingMode::PercentEquity { pct: 2.0 }),
            &account(),
            &balance(10_000.0),
            100.0,
            &snap,
        )
        .unwrap();
        assert!((sized.notional_usdt - 500.0).abs() < 1e-9);
    }
}
