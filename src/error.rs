use thiserror::Error;

/// Broad failure classes surfaced at the run boundary. Each maps to a fixed
/// propagation policy: `DataCoverage` and `Schema` fail a run before the hot
/// loop, `Exchange` errors reject a single order, `Invariant` aborts the run
/// with no artifacts, `Fatal` stop conditions terminate gracefully with full
/// artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DataCoverage,
    Schema,
    Numeric,
    Exchange,
    Invariant,
    Fatal,
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    // -- Data coverage --
    #[error("missing bars for {symbol} {tf} in ranges {ranges:?}")]
    InsufficientCoverage {
        symbol: String,
        tf: String,
        ranges: Vec<(i64, i64)>,
    },
    #[error("bars for {tf} are not strictly increasing at index {index}")]
    UnorderedBars { tf: String, index: usize },
    #[error("bar at index {index} is not aligned to the {tf} boundary")]
    MisalignedBar { tf: String, index: usize },
    #[error("bar at index {index} violates OHLC invariants")]
    MalformedBar { index: usize },

    // -- Schema --
    #[error("missing required field: {0}")]
    MissingRequiredField(&'static str),
    #[error("rule parse error: {0}")]
    DslParse(String),
    #[error("unknown operator: {0}")]
    UnknownOperator(String),
    #[error("operator {op} expects {expected} operands, got {got}")]
    ArityMismatch {
        op: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("undeclared feature: {0}")]
    UndeclaredFeature(String),
    #[error("invalid tolerance {tol} for {op}")]
    InvalidTolerance { op: &'static str, tol: f64 },
    #[error("window of {bars} bars exceeds the cap of {cap}")]
    InvalidWindowBars { bars: usize, cap: usize },
    #[error("unknown indicator: {0}")]
    UnknownIndicator(String),
    #[error("invalid parameter {param} for indicator {indicator}: {reason}")]
    InvalidParam {
        indicator: String,
        param: &'static str,
        reason: String,
    },
    #[error("indicator {0} is missing a required input series")]
    MissingInput(String),
    #[error("indicator {0} does not support a flexible input source")]
    InputSourceUnsupported(String),
    #[error("invalid play: {0}")]
    InvalidPlay(String),
    #[error("eval delay of {delay} bars exceeds the cap of {cap}")]
    WarmupCapExceeded { delay: usize, cap: usize },

    // -- Numeric --
    #[error("feature {key} is NaN at bar {index}, after warmup")]
    NanAfterWarmup { key: String, index: usize },

    // -- Exchange (order-level; recorded, never fatal to the run) --
    #[error("insufficient margin: need {required:.2} USDT, free {free:.2} USDT")]
    InsufficientMargin { required: f64, free: f64 },
    #[error("order notional {notional:.2} below minimum {min:.2}")]
    BelowMinNotional { notional: f64, min: f64 },
    #[error("order would exceed max leverage {max:.1}x")]
    LeverageExceeded { max: f64 },
    #[error("no opposite position to close and flips are disallowed")]
    NoOppositePositionToClose,
    #[error("position liquidated at {price:.8}")]
    Liquidated { price: f64 },

    // -- Invariant --
    #[error("lookahead guard: snapshot ts {snapshot_ts} != bar ts {bar_ts}")]
    LookaheadViolation { snapshot_ts: i64, bar_ts: i64 },
    #[error("timestamp {ts} not found in {tf} feed")]
    TsNotFound { tf: String, ts: i64 },
    #[error("index {index} out of range for feed of {len} bars")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("feature missing from snapshot: {0}")]
    FeatureMissing(String),

    // -- Fatal (graceful run stops) --
    #[error("account blown: equity {equity:.2} USDT")]
    AccountBlown { equity: f64 },
}

impl PlaybackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientCoverage { .. }
            | Self::UnorderedBars { .. }
            | Self::MisalignedBar { .. }
            | Self::MalformedBar { .. } => ErrorKind::DataCoverage,
            Self::MissingRequiredField(_)
            | Self::DslParse(_)
            | Self::UnknownOperator(_)
            | Self::ArityMismatch { .. }
            | Self::UndeclaredFeature(_)
            | Self::InvalidTolerance { .. }
            | Self::InvalidWindowBars { .. }
            | Self::UnknownIndicator(_)
            | Self::InvalidParam { .. }
            | Self::MissingInput(_)
            | Self::InputSourceUnsupported(_)
            | Self::InvalidPlay(_)
            | Self::WarmupCapExceeded { .. } => ErrorKind::Schema,
            Self::NanAfterWarmup { .. } => ErrorKind::Numeric,
            Self::InsufficientMargin { .. }
            | Self::BelowMinNotional { .. }
            | Self::LeverageExceeded { .. }
            | Self::NoOppositePositionToClose
            | Self::Liquidated { .. } => ErrorKind::Exchange,
            Self::LookaheadViolation { .. }
            | Self::TsNotFound { .. }
            | Self::IndexOutOfRange { .. }
            | Self::FeatureMissing(_) => ErrorKind::Invariant,
            Self::AccountBlown { .. } => ErrorKind::Fatal,
        }
    }

    /// Stable machine-readable code for the result object.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsufficientCoverage { .. } => "insufficient_coverage",
            Self::UnorderedBars { .. } => "unordered_bars",
            Self::MisalignedBar { .. } => "misaligned_bar",
            Self::MalformedBar { .. } => "malformed_bar",
            Self::MissingRequiredField(_) => "missing_required_field",
            Self::DslParse(_) => "dsl_parse_error",
            Self::UnknownOperator(_) => "unknown_operator",
            Self::ArityMismatch { .. } => "arity_mismatch",
            Self::UndeclaredFeature(_) => "undeclared_feature",
            Self::InvalidTolerance { .. } => "invalid_tolerance",
            Self::InvalidWindowBars { .. } => "invalid_window_bars",
            Self::UnknownIndicator(_) => "unknown_indicator",
            Self::InvalidParam { .. } => "invalid_param",
            Self::MissingInput(_) => "missing_input",
            Self::InputSourceUnsupported(_) => "input_source_unsupported",
            Self::InvalidPlay(_) => "invalid_play",
            Self::WarmupCapExceeded { .. } => "warmup_cap_exceeded",
            Self::NanAfterWarmup { .. } => "nan_after_warmup",
            Self::InsufficientMargin { .. } => "insufficient_margin",
            Self::BelowMinNotional { .. } => "below_min_notional",
            Self::LeverageExceeded { .. } => "leverage_exceeded",
            Self::NoOppositePositionToClose => "no_opposite_position",
            Self::Liquidated { .. } => "liquidated",
            Self::LookaheadViolation { .. } => "lookahead_violation",
            Self::TsNotFound { .. } => "ts_not_found",
            Self::IndexOutOfRange { .. } => "index_out_of_range",
            Self::FeatureMissing(_) => "feature_missing",
            Self::AccountBlown { .. } => "account_blown",
        }
    }
}

pub type Result<T, E = PlaybackError> = std::result::Result<T, E>;
