pub mod validate;
pub mod warmup;

use std::collections::BTreeMap;

use garde::Validate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{PriceRef, Timeframe};

pub use validate::{validate_play, ValidatedPlay};
pub use warmup::{RoleNumbers, WarmupPlan};

/// The declarative strategy document. Unknown keys are errors everywhere;
/// the format is all-forward, no legacy aliases.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Play {
    pub id: String,
    pub version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub symbol_universe: Vec<String>,
    /// Exec timeframe: the bar resolution the strategy is evaluated on.
    pub tf: Timeframe,
    #[serde(default)]
    pub mid_tf: Option<Timeframe>,
    #[serde(default)]
    pub high_tf: Option<Timeframe>,
    pub features: Vec<FeatureDecl>,
    /// Named reusable conditions, referenced as `{"var": "<name>"}`.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Action blocks; parsed by the rule compiler.
    pub actions: Value,
    pub risk_model: RiskModel,
    #[serde(default)]
    pub position_policy: PositionPolicy,
    pub account: AccountCfg,
    /// Optional additional closed-candle delay, per TF role, before signal
    /// evaluation may begin.
    #[serde(default)]
    pub eval_delay_bars: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FeatureDecl {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
    /// Reroute the primary input: a price column or an earlier-declared
    /// single-output feature key.
    #[serde(default)]
    pub input_source: Option<String>,
    /// TF role the feature is computed on; defaults to exec.
    #[serde(default)]
    pub tf_role: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarginMode {
    #[default]
    Isolated,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct AccountCfg {
    #[garde(range(min = 0.01))]
    pub starting_equity_usdt: f64,
    #[garde(range(min = 1.0, max = 125.0))]
    pub max_leverage: f64,
    #[serde(default)]
    #[garde(skip)]
    pub margin_mode: MarginMode,
    #[garde(range(min = 0.0))]
    pub min_trade_notional_usdt: f64,
    #[garde(range(min = 0.0, max = 100.0))]
    pub taker_fee_bps: f64,
    #[garde(range(min = 0.0, max = 100.0))]
    pub maker_fee_bps: f64,
    #[garde(range(min = 0.0, max = 100.0))]
    pub slippage_bps: f64,
    #[serde(default = "default_maintenance_rate")]
    #[garde(range(min = 0.0, max = 0.5))]
    pub maintenance_margin_rate: f64,
}

fn default_maintenance_rate() -> f64 {
    0.005
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(tag = "mode", rename_all = "snake_case", deny_unknown_fields)]
pub enum SizingMode {
    PercentEquity {
        #[garde(range(min = 0.01, max = 1000.0))]
        pct: f64,
    },
    FixedUsdt {
        #[garde(range(min = 0.01))]
        usdt: f64,
    },
    RiskPerTradePct {
        #[garde(range(min = 0.01, max = 100.0))]
        pct: f64,
    },
}

impl Default for SizingMode {
    fn default() -> Self {
        Self::PercentEquity { pct: 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct RiskModel {
    #[serde(default)]
    #[garde(dive)]
    pub sizing: SizingMode,
    /// Default stop for entries that do not carry their own.
    #[serde(default)]
    #[garde(skip)]
    pub stop_loss: Option<PriceRef>,
    #[serde(default)]
    #[garde(skip)]
    pub take_profit: Option<PriceRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(deny_unknown_fields)]
pub struct PositionPolicy {
    #[serde(default = "default_true")]
    #[garde(skip)]
    pub allow_long: bool,
    #[serde(default = "default_true")]
    #[garde(skip)]
    pub allow_short: bool,
    #[serde(default)]
    #[garde(skip)]
    pub allow_flip: bool,
    #[serde(default = "default_one")]
    #[garde(range(min = 1, max = 16))]
    pub max_positions_per_symbol: usize,
    #[serde(default)]
    #[garde(range(max = 10_000))]
    pub cooldown_bars: usize,
    #[serde(default)]
    #[garde(inner(range(min = 0.0)))]
    pub max_total_exposure_usdt: Option<f64>,
    /// Hard risk block: no new entries once drawdown from peak exceeds this.
    #[serde(default)]
    #[garde(inner(range(min = 0.0, max = 100.0)))]
    pub max_drawdown_pct: Option<f64>,
    /// Run-stop: N consecutive bars with free margin below the floor.
    #[serde(default)]
    #[garde(inner(range(min = 1)))]
    pub insufficient_margin_stop_bars: Option<usize>,
    #[serde(default)]
    #[garde(range(min = 0.0))]
    pub min_free_margin_usdt: f64,
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

impl Default for PositionPolicy {
    fn default() -> Self {
        Self {
            allow_long: true,
            allow_short: true,
            allow_flip: false,
            max_positions_per_symbol: 1,
            cooldown_bars: 0,
            max_total_exposure_usdt: None,
            max_drawdown_pct: None,
            insufficient_margin_stop_bars: None,
            min_free_margin_usdt: 0.0,
        }
    }
}

impl Play {
    /// Timeframe for a role, if the Play declares it.
    pub fn tf_for_role(&self, role: crate::types::TfRole) -> Option<Timeframe> {
        match role {
            crate::types::TfRole::Exec => Some(self.tf),
            crate::types::TfRole::Mid => self.mid_tf,
            crate::types::TfRole::High => self.high_tf,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn minimal_play_json() -> Value {
        json!({
            "id": "ema_cross",
            "version": 1,
            "symbol_universe": ["BTCUSDT"],
            "tf": "15m",
            "features": [
                {"id": "ema_9", "type": "ema", "params": {"length": 9}},
                {"id": "ema_21", "type": "ema", "params": {"length": 21}},
            ],
            "actions": [
                {"id": "entry", "cases": [
                    {"when": ["ema_9", "cross_above", "ema_21"],
                     "emit": [{"action": "enter_long"}]},
                ]},
                {"id": "exit", "cases": [
                    {"when": ["ema_9", "cross_below", "ema_21"],
                     "emit": [{"action": "exit"}]},
                ]},
            ],
            "risk_model": {"sizing": {"mode": "percent_equity", "pct": 2.0}},
            "account": {
                "starting_equity_usdt": 10_000.0,
                "max_leverage": 3.0,
                "min_trade_notional_usdt": 10.0,
                "taker_fee_bps": 5.5,
                "maker_fee_bps": 2.0,
                "slippage_bps": 2.0,
            },
        })
    }

    #[test]
    fn parses_minimal_play() {
        let play: Play = serde_json::from_value(minimal_play_json()).unwrap();
        assert_eq!(play.id, "ema_cross");
        assert_eq!(play.tf, Timeframe::M15);
        assert_eq!(play.features.len(), 2);
        assert!(play.mid_tf.is_none());
    }

    #[test]
    fn unknown_top_level_key_rejected() {
        let mut doc = minimal_play_json();
        doc.as_object_mut()
            .unwrap()
            .insert("rules".into(), json!([])); // legacy alias, not accepted
        assert!(serde_json::from_value::<Play>(doc).is_err());
    }

    #[test]
    fn unknown_account_key_rejected() {
        let mut doc = minimal_play_json();
        doc["account"]
            .as_object_mut()
            .unwrap()
            .insert("leverage".into(), json!(5)); // legacy spelling
        assert!(serde_json::from_value::<Play>(doc).is_err());
    }

    #[test]
    fn account_ranges_validated() {
        let mut doc = minimal_play_json();
        doc["account"]["max_leverage"] = json!(500.0);
        let play: Play = serde_json::from_value(doc).unwrap();
        assert!(play.account.validate().is_err());
    }

    #[test]
    fn sizing_mode_tagged_form() {
        let sizing: SizingMode =
            serde_json::from_value(json!({"mode": "risk_per_trade_pct", "pct": 1.0})).unwrap();
        assert!(matches!(sizing, SizingMode::RiskPerTradePct { .. }));
    }

    #[test]
    fn position_policy_defaults() {
        let p = PositionPolicy::default();
        assert!(p.allow_long && p.allow_short && !p.allow_flip);
        assert_eq!(p.max_positions_per_symbol, 1);
    }
}
