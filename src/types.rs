use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::PlaybackError;

/// Canonical timeframe set. Durations are fixed; there is no "unknown" TF at
/// runtime, anything else is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn minutes(self) -> i64 {
        match self {
            Self::M1 => 1,
            Self::M3 => 3,
            Self::M5 => 5,
            Self::M15 => 15,
            Self::M30 => 30,
            Self::H1 => 60,
            Self::H2 => 120,
            Self::H4 => 240,
            Self::H6 => 360,
            Self::H8 => 480,
            Self::H12 => 720,
            Self::D1 => 1440,
        }
    }

    pub fn duration_ms(self) -> i64 {
        self.minutes() * 60_000
    }

    /// Bars per (365-day) year. Perpetual futures trade continuously, so the
    /// annualization basis is calendar minutes, not exchange sessions.
    pub fn bars_per_year(self) -> f64 {
        525_600.0 / self.minutes() as f64
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Timeframe {
    type Err = PlaybackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "1m" => Self::M1,
            "3m" => Self::M3,
            "5m" => Self::M5,
            "15m" => Self::M15,
            "30m" => Self::M30,
            "1h" => Self::H1,
            "2h" => Self::H2,
            "4h" => Self::H4,
            "6h" => Self::H6,
            "8h" => Self::H8,
            "12h" => Self::H12,
            "1d" => Self::D1,
            other => {
                return Err(PlaybackError::InvalidPlay(format!(
                    "unknown timeframe: {other}"
                )))
            }
        })
    }
}

/// Role a timeframe plays for a strategy: exec is the decision resolution,
/// mid/high are optional confluence and context feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TfRole {
    Exec,
    Mid,
    High,
}

impl std::fmt::Display for TfRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Exec => "exec",
            Self::Mid => "mid",
            Self::High => "high",
        })
    }
}

/// One closed OHLCV candle. `ts_open`/`ts_close` are epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts_open: i64,
    pub ts_close: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn validate(&self, index: usize) -> Result<(), PlaybackError> {
        let ok = self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
            && self.high >= self.low
            && self.volume >= 0.0
            && self.ts_close > self.ts_open;
        if ok {
            Ok(())
        } else {
            Err(PlaybackError::MalformedBar { index })
        }
    }

    /// A bar with zero range: `high == low == open == close`.
    pub fn is_doji_point(&self) -> bool {
        self.high == self.low && self.open == self.close && self.high == self.close
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Long => "long",
            Self::Short => "short",
        })
    }
}

/// Strategy intent for the current bar. `Flat` closes; anything else opens
/// (or flips, when the policy allows it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
    Flat,
}

/// A price reference the risk sizer resolves at decision time: a percent
/// distance from entry, an absolute price, or a snapshot path (e.g. a fib
/// level on the high TF).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PriceRef {
    Pct(f64),
    Abs(f64),
    Path(String),
}

/// Strategy output for one bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Direction,
    pub symbol: String,
    /// Optional per-signal size override, percent of equity.
    pub size_pct: Option<f64>,
    pub stop: Option<PriceRef>,
    pub take_profit: Option<PriceRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
    StopMarket,
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    GoodTillCancel,
    ImmediateOrCancel,
}

/// An order as accepted by the simulated exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub symbol: String,
    pub side: Side,
    pub notional_usdt: f64,
    pub kind: OrderKind,
    pub limit_price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub stop_price: Option<f64>,
    pub take_profit_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub price: f64,
    pub quantity: f64,
    pub fees: f64,
    pub ts_close_ms: i64,
}

/// An open isolated-margin position. At most one per (symbol, side).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub margin_held_usdt: f64,
    pub liquidation_price: f64,
    pub entry_ts_ms: i64,
    pub entry_bar_idx: usize,
    pub entry_fees: f64,
}

impl Position {
    pub fn notional_at(&self, price: f64) -> f64 {
        self.quantity * price
    }

    pub fn pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity * self.side.multiplier()
    }
}

/// One row of the equity table, appended once per exec bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts_close_ms: i64,
    pub equity_usdt: f64,
    pub cash_usdt: f64,
    pub unrealized_pnl_usdt: f64,
    pub drawdown_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Signal,
    StopLoss,
    TakeProfit,
    Liquidation,
    Flip,
    RunStop,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signal => "signal",
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::Liquidation => "liquidation",
            Self::Flip => "flip",
            Self::RunStop => "run_stop",
        }
    }
}

/// One row of the trades table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: usize,
    pub symbol: String,
    pub side: Side,
    pub entry_ts_ms: i64,
    pub exit_ts_ms: i64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub notional_usdt: f64,
    pub fees_usdt: f64,
    pub pnl_usdt: f64,
    pub bars_held: usize,
    pub stop_hit: bool,
    pub tp_hit: bool,
    pub exit_reason: ExitReason,
}

/// Funding payment event. The upstream event stream is external; runs default
/// to an empty list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FundingEvent {
    pub ts_ms: i64,
    /// Signed rate applied to position notional at mark; longs pay positive.
    pub rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn timeframe_round_trips_via_str() {
        for tf in [
            Timeframe::M1,
            Timeframe::M15,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
        ] {
            assert_eq!(Timeframe::from_str(&tf.to_string()).unwrap(), tf);
        }
    }

    #[test]
    fn timeframe_unknown_rejected() {
        assert!(Timeframe::from_str("7m").is_err());
    }

    #[test]
    fn timeframe_durations() {
        assert_eq!(Timeframe::M15.duration_ms(), 900_000);
        assert_eq!(Timeframe::D1.minutes(), 1440);
        assert!((Timeframe::H1.bars_per_year() - 8760.0).abs() < f64::EPSILON);
    }

    #[test]
    fn timeframe_ordering_follows_duration() {
        assert!(Timeframe::M15.minutes() < Timeframe::H1.minutes());
        assert!(Timeframe::H1.minutes() < Timeframe::H4.minutes());
    }

    #[test]
    fn side_multiplier() {
        assert!((Side::Long.multiplier() - 1.0).abs() < f64::EPSILON);
        assert!((Side::Short.multiplier() + 1.0).abs() < f64::EPSILON);
        assert_eq!(Side::Long.opposite(), Side::Short);
    }

    #[test]
    fn bar_invariants() {
        let good = Bar {
            ts_open: 0,
            ts_close: 60_000,
            open: 10.0,
            high: 11.0,
            low: 9.5,
            close: 10.5,
            volume: 100.0,
        };
        assert!(good.validate(0).is_ok());

        let bad = Bar {
            high: 10.2, // below close
            ..good
        };
        assert!(bad.validate(0).is_err());
    }

    #[test]
    fn doji_point_detection() {
        let doji = Bar {
            ts_open: 0,
            ts_close: 60_000,
            open: 10.0,
            high: 10.0,
            low: 10.0,
            close: 10.0,
            volume: 0.0,
        };
        assert!(doji.is_doji_point());
    }

    #[test]
    fn position_pnl_signs() {
        let p = Position {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_price: 100.0,
            quantity: 2.0,
            stop_price: None,
            take_profit_price: None,
            unrealized_pnl: 0.0,
            margin_held_usdt: 100.0,
            liquidation_price: 50.0,
            entry_ts_ms: 0,
            entry_bar_idx: 0,
            entry_fees: 0.0,
        };
        assert!((p.pnl_at(110.0) - 20.0).abs() < 1e-10);
        let mut s = p.clone();
        s.side = Side::Short;
        assert!((s.pnl_at(110.0) + 20.0).abs() < 1e-10);
    }
}
