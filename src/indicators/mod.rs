pub mod batch;
pub mod incremental;

use std::collections::BTreeMap;

use crate::error::{PlaybackError, Result};

/// Raw parameter map from a Play feature spec. All indicator parameters are
/// numeric; structure detectors parse their own spec shape.
pub type IndicatorParams = BTreeMap<String, f64>;

/// Input series an indicator requires from its feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputReq {
    /// A single price series; the primary slot may be rerouted by
    /// `input_source`.
    Close,
    /// High/low/close.
    Hlc,
    /// High/low/close/volume.
    Hlcv,
    /// Open/high/low/close.
    Ohlc,
}

/// A validated indicator instance. Each variant maps 1:1 to a batch kernel,
/// and to an incremental state when `supports_incremental` is true.
#[derive(Debug, Clone, PartialEq)]
pub enum Indicator {
    Sma { length: usize },
    Ema { length: usize },
    Wma { length: usize },
    Rma { length: usize },
    Dema { length: usize },
    Tema { length: usize },
    Vwma { length: usize },
    Hl2,
    Hlc3,
    Ohlc4,
    Rsi { length: usize },
    Macd { fast: usize, slow: usize, signal: usize },
    Stoch { k: usize, d: usize, smooth: usize },
    StochRsi { length: usize, k: usize, d: usize },
    Cci { length: usize },
    Willr { length: usize },
    Roc { length: usize },
    Mom { length: usize },
    Ppo { fast: usize, slow: usize, signal: usize },
    Trix { length: usize },
    Cmo { length: usize },
    Dpo { length: usize },
    Tr,
    Atr { length: usize },
    Natr { length: usize },
    Bbands { length: usize, mult: f64 },
    Kc { length: usize, mult: f64 },
    Donchian { length: usize },
    Stddev { length: usize },
    Zscore { length: usize },
    Obv,
    Mfi { length: usize },
    Cmf { length: usize },
    Adl,
    Vwap { length: usize },
    Adx { length: usize },
    Aroon { length: usize },
    Supertrend { length: usize, mult: f64 },
    Psar { af_start: f64, af_step: f64, af_max: f64 },
    Linreg { length: usize },
    Slope { length: usize },
    Midprice { length: usize },
}

impl Indicator {
    /// Resolve a catalog name plus raw params into a validated instance.
    pub fn resolve(name: &str, params: &IndicatorParams) -> Result<Self> {
        let p = ParamReader::new(name, params);
        let ind = match name {
            "sma" => Self::Sma { length: p.length()? },
            "ema" => Self::Ema { length: p.length()? },
            "wma" => Self::Wma { length: p.length()? },
            "rma" => Self::Rma { length: p.length()? },
            "dema" => Self::Dema { length: p.length()? },
            "tema" => Self::Tema { length: p.length()? },
            "vwma" => Self::Vwma { length: p.length()? },
            "hl2" => Self::Hl2,
            "hlc3" => Self::Hlc3,
            "ohlc4" => Self::Ohlc4,
            "rsi" => Self::Rsi { length: p.length()? },
            "macd" => Self::Macd {
                fast: p.usize_in("fast", 1, 500)?,
                slow: p.usize_in("slow", 1, 500)?,
                signal: p.usize_in("signal", 1, 500)?,
            },
            "stoch" => Self::Stoch {
                k: p.usize_in("k", 1, 500)?,
                d: p.usize_in("d", 1, 500)?,
                smooth: p.usize_or("smooth", 1, 1, 500)?,
            },
            "stochrsi" => Self::StochRsi {
                length: p.length()?,
                k: p.usize_or("k", 3, 1, 500)?,
                d: p.usize_or("d", 3, 1, 500)?,
            },
            "cci" => Self::Cci { length: p.length()? },
            "willr" => Self::Willr { length: p.length()? },
            "roc" => Self::Roc { length: p.length()? },
            "mom" => Self::Mom { length: p.length()? },
            "ppo" => Self::Ppo {
                fast: p.usize_in("fast", 1, 500)?,
                slow: p.usize_in("slow", 1, 500)?,
                signal: p.usize_in("signal", 1, 500)?,
            },
            "trix" => Self::Trix { length: p.length()? },
            "cmo" => Self::Cmo { length: p.length()? },
            "dpo" => Self::Dpo { length: p.length()? },
            "tr" => Self::Tr,
            "atr" => Self::Atr { length: p.length()? },
            "natr" => Self::Natr { length: p.length()? },
            "bbands" => Self::Bbands {
                length: p.length()?,
                mult: p.f64_or("mult", 2.0, 0.1, 10.0)?,
            },
            "kc" => Self::Kc {
                length: p.length()?,
                mult: p.f64_or("mult", 2.0, 0.1, 10.0)?,
            },
            "donchian" => Self::Donchian { length: p.length()? },
            "stddev" => Self::Stddev { length: p.length()? },
            "zscore" => Self::Zscore { length: p.length()? },
            "obv" => Self::Obv,
            "mfi" => Self::Mfi { length: p.length()? },
            "cmf" => Self::Cmf { length: p.length()? },
            "adl" => Self::Adl,
            "vwap" => Self::Vwap { length: p.length()? },
            "adx" => Self::Adx { length: p.length()? },
            "aroon" => Self::Aroon { length: p.length()? },
            "supertrend" => Self::Supertrend {
                length: p.length()?,
                mult: p.f64_or("mult", 3.0, 0.1, 10.0)?,
            },
            "psar" => Self::Psar {
                af_start: p.f64_or("af_start", 0.02, 0.001, 1.0)?,
                af_step: p.f64_or("af_step", 0.02, 0.001, 1.0)?,
                af_max: p.f64_or("af_max", 0.2, 0.01, 1.0)?,
            },
            "linreg" => Self::Linreg { length: p.length()? },
            "slope" => Self::Slope { length: p.length()? },
            "midprice" => Self::Midprice { length: p.length()? },
            other => return Err(PlaybackError::UnknownIndicator(other.to_string())),
        };
        if let Self::Macd { fast, slow, .. } | Self::Ppo { fast, slow, .. } = &ind {
            if fast >= slow {
                return Err(PlaybackError::InvalidParam {
                    indicator: name.to_string(),
                    param: "fast",
                    reason: format!("fast ({fast}) must be < slow ({slow})"),
                });
            }
        }
        Ok(ind)
    }

    /// Input series required from the feed.
    pub fn input_req(&self) -> InputReq {
        match self {
            Self::Sma { .. }
            | Self::Ema { .. }
            | Self::Wma { .. }
            | Self::Rma { .. }
            | Self::Dema { .. }
            | Self::Tema { .. }
            | Self::Rsi { .. }
            | Self::Macd { .. }
            | Self::StochRsi { .. }
            | Self::Roc { .. }
            | Self::Mom { .. }
            | Self::Ppo { .. }
            | Self::Trix { .. }
            | Self::Cmo { .. }
            | Self::Dpo { .. }
            | Self::Bbands { .. }
            | Self::Stddev { .. }
            | Self::Zscore { .. }
            | Self::Linreg { .. }
            | Self::Slope { .. } => InputReq::Close,
            Self::Hl2
            | Self::Hlc3
            | Self::Stoch { .. }
            | Self::Cci { .. }
            | Self::Willr { .. }
            | Self::Tr
            | Self::Atr { .. }
            | Self::Natr { .. }
            | Self::Kc { .. }
            | Self::Donchian { .. }
            | Self::Adx { .. }
            | Self::Aroon { .. }
            | Self::Supertrend { .. }
            | Self::Psar { .. }
            | Self::Midprice { .. } => InputReq::Hlc,
            Self::Ohlc4 => InputReq::Ohlc,
            Self::Vwma { .. }
            | Self::Obv
            | Self::Mfi { .. }
            | Self::Cmf { .. }
            | Self::Adl
            | Self::Vwap { .. } => InputReq::Hlcv,
        }
    }

    /// Whether the primary input series may be rerouted (e.g. to `volume`).
    /// Only single-series indicators qualify.
    pub fn supports_flexible_input(&self) -> bool {
        self.input_req() == InputReq::Close
    }

    /// Whether an O(1)-per-bar streaming implementation exists.
    pub fn supports_incremental(&self) -> bool {
        !matches!(
            self,
            Self::Dema { .. }
                | Self::Tema { .. }
                | Self::Stoch { .. }
                | Self::StochRsi { .. }
                | Self::Ppo { .. }
                | Self::Trix { .. }
                | Self::Dpo { .. }
                | Self::Kc { .. }
                | Self::Adx { .. }
                | Self::Aroon { .. }
                | Self::Linreg { .. }
                | Self::Slope { .. }
                | Self::Psar { .. }
        )
    }

    /// Bars required before the output can be trusted. Recursive indicators
    /// get a burn-in multiple of their length.
    pub fn warmup_bars(&self) -> usize {
        match *self {
            Self::Sma { length }
            | Self::Wma { length }
            | Self::Vwma { length }
            | Self::Donchian { length }
            | Self::Stddev { length }
            | Self::Zscore { length }
            | Self::Bbands { length, .. }
            | Self::Cci { length }
            | Self::Willr { length }
            | Self::Vwap { length }
            | Self::Linreg { length }
            | Self::Slope { length }
            | Self::Midprice { length } => length,
            Self::Ema { length } | Self::Rma { length } => 3 * length,
            Self::Dema { length } => 6 * length,
            Self::Tema { length } => 9 * length,
            Self::Hl2 | Self::Hlc3 | Self::Ohlc4 | Self::Adl => 1,
            Self::Tr | Self::Obv | Self::Psar { .. } => 2,
            Self::Rsi { length }
            | Self::Roc { length }
            | Self::Mom { length }
            | Self::Cmo { length }
            | Self::Mfi { length }
            | Self::Aroon { length } => length + 1,
            Self::Cmf { length } => length,
            // Displaced SMA: the window plus the backward shift.
            Self::Dpo { length } => length + length / 2 + 1,
            Self::Macd { slow, signal, .. } | Self::Ppo { slow, signal, .. } => 3 * slow + signal,
            Self::Stoch { k, d, smooth } => k + smooth + d,
            Self::StochRsi { length, k, d } => 2 * length + k + d,
            Self::Trix { length } => 9 * length + 1,
            Self::Atr { length }
            | Self::Natr { length }
            | Self::Kc { length, .. }
            | Self::Adx { length }
            | Self::Supertrend { length, .. } => 3 * length + 1,
        }
    }

    /// Output key suffixes. Empty means a single output keyed by the bare
    /// feature id. This list is the single source of truth for key expansion.
    pub fn output_suffixes(&self) -> &'static [&'static str] {
        match self {
            Self::Macd { .. } => &["macd", "signal", "histogram"],
            Self::Ppo { .. } => &["ppo", "signal", "histogram"],
            Self::Stoch { .. } | Self::StochRsi { .. } => &["k", "d"],
            Self::Bbands { .. } => &["upper", "middle", "lower", "bandwidth", "percent_b"],
            Self::Kc { .. } | Self::Donchian { .. } => &["upper", "middle", "lower"],
            Self::Adx { .. } => &["adx", "plus_di", "minus_di"],
            Self::Aroon { .. } => &["up", "down", "osc"],
            Self::Supertrend { .. } => &["line", "direction"],
            Self::Psar { .. } => &["value", "direction"],
            _ => &[],
        }
    }

    /// Expand a feature id into its per-run column keys.
    pub fn expand_keys(&self, feature_id: &str) -> Vec<String> {
        let suffixes = self.output_suffixes();
        if suffixes.is_empty() {
            vec![feature_id.to_string()]
        } else {
            suffixes
                .iter()
                .map(|s| format!("{feature_id}_{s}"))
                .collect()
        }
    }
}

/// Catalog entry metadata, one per indicator kind.
pub struct IndicatorInfo {
    pub name: &'static str,
    pub category: &'static str,
    pub params: &'static str,
}

pub const INDICATOR_CATALOG: &[IndicatorInfo] = &[
    IndicatorInfo { name: "sma", category: "overlap", params: "length" },
    IndicatorInfo { name: "ema", category: "overlap", params: "length" },
    IndicatorInfo { name: "wma", category: "overlap", params: "length" },
    IndicatorInfo { name: "rma", category: "overlap", params: "length" },
    IndicatorInfo { name: "dema", category: "overlap", params: "length" },
    IndicatorInfo { name: "tema", category: "overlap", params: "length" },
    IndicatorInfo { name: "vwma", category: "overlap", params: "length" },
    IndicatorInfo { name: "hl2", category: "overlap", params: "" },
    IndicatorInfo { name: "hlc3", category: "overlap", params: "" },
    IndicatorInfo { name: "ohlc4", category: "overlap", params: "" },
    IndicatorInfo { name: "midprice", category: "overlap", params: "length" },
    IndicatorInfo { name: "linreg", category: "overlap", params: "length" },
    IndicatorInfo { name: "slope", category: "overlap", params: "length" },
    IndicatorInfo { name: "rsi", category: "momentum", params: "length" },
    IndicatorInfo { name: "macd", category: "momentum", params: "fast, slow, signal" },
    IndicatorInfo { name: "stoch", category: "momentum", params: "k, d, smooth" },
    IndicatorInfo { name: "stochrsi", category: "momentum", params: "length, k, d" },
    IndicatorInfo { name: "cci", category: "momentum", params: "length" },
    IndicatorInfo { name: "willr", category: "momentum", params: "length" },
    IndicatorInfo { name: "roc", category: "momentum", params: "length" },
    IndicatorInfo { name: "mom", category: "momentum", params: "length" },
    IndicatorInfo { name: "ppo", category: "momentum", params: "fast, slow, signal" },
    IndicatorInfo { name: "trix", category: "momentum", params: "length" },
    IndicatorInfo { name: "cmo", category: "momentum", params: "length" },
    IndicatorInfo { name: "dpo", category: "momentum", params: "length" },
    IndicatorInfo { name: "tr", category: "volatility", params: "" },
    IndicatorInfo { name: "atr", category: "volatility", params: "length" },
    IndicatorInfo { name: "natr", category: "volatility", params: "length" },
    IndicatorInfo { name: "bbands", category: "volatility", params: "length, mult" },
    IndicatorInfo { name: "kc", category: "volatility", params: "length, mult" },
    IndicatorInfo { name: "donchian", category: "volatility", params: "length" },
    IndicatorInfo { name: "stddev", category: "volatility", params: "length" },
    IndicatorInfo { name: "zscore", category: "volatility", params: "length" },
    IndicatorInfo { name: "obv", category: "volume", params: "" },
    IndicatorInfo { name: "mfi", category: "volume", params: "length" },
    IndicatorInfo { name: "cmf", category: "volume", params: "length" },
    IndicatorInfo { name: "adl", category: "volume", params: "" },
    IndicatorInfo { name: "vwap", category: "volume", params: "length" },
    IndicatorInfo { name: "adx", category: "trend", params: "length" },
    IndicatorInfo { name: "aroon", category: "trend", params: "length" },
    IndicatorInfo { name: "supertrend", category: "trend", params: "length, mult" },
    IndicatorInfo { name: "psar", category: "trend", params: "af_start, af_step, af_max" },
];

struct ParamReader<'a> {
    indicator: &'a str,
    params: &'a IndicatorParams,
}

impl<'a> ParamReader<'a> {
    fn new(indicator: &'a str, params: &'a IndicatorParams) -> Self {
        Self { indicator, params }
    }

    fn length(&self) -> Result<usize> {
        self.usize_in("length", 1, 5000)
    }

    fn usize_in(&self, name: &'static str, min: usize, max: usize) -> Result<usize> {
        let raw = self.params.get(name).copied().ok_or_else(|| {
            PlaybackError::InvalidParam {
                indicator: self.indicator.to_string(),
                param: name,
                reason: "missing".to_string(),
            }
        })?;
        self.check_usize(name, raw, min, max)
    }

    fn usize_or(&self, name: &'static str, default: usize, min: usize, max: usize) -> Result<usize> {
        match self.params.get(name).copied() {
            None => Ok(default),
            Some(raw) => self.check_usize(name, raw, min, max),
        }
    }

    fn check_usize(&self, name: &'static str, raw: f64, min: usize, max: usize) -> Result<usize> {
        if raw.fract() != 0.0 || raw < min as f64 || raw > max as f64 {
            return Err(PlaybackError::InvalidParam {
                indicator: self.indicator.to_string(),
                param: name,
                reason: format!("{raw} not an integer in [{min}, {max}]"),
            });
        }
        Ok(raw as usize)
    }

    fn f64_or(&self, name: &'static str, default: f64, min: f64, max: f64) -> Result<f64> {
        let raw = self.params.get(name).copied().unwrap_or(default);
        if !(min..=max).contains(&raw) {
            return Err(PlaybackError::InvalidParam {
                indicator: self.indicator.to_string(),
                param: name,
                reason: format!("{raw} not in [{min}, {max}]"),
            });
        }
        Ok(raw)
    }
}
