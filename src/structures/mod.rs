pub mod derived_zone;
pub mod fibonacci;
pub mod rolling;
pub mod swing;
pub mod trend;
pub mod zone;

use serde_json::Value;

use crate::error::{PlaybackError, Result};

/// Per-bar inputs shared by all detectors. Detectors only read indices
/// `<= idx`; the window they scan is bounded by their own parameters.
pub struct StructCtx<'a> {
    pub idx: usize,
    pub open: &'a [f64],
    pub high: &'a [f64],
    pub low: &'a [f64],
    pub close: &'a [f64],
    pub volume: &'a [f64],
}

/// A market-structure detector: updated once per bar on its timeframe,
/// emitting one value per declared field.
pub trait Detector {
    fn fields(&self) -> Vec<String>;
    fn update(&mut self, ctx: &StructCtx) -> Vec<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneKind {
    Demand,
    Supply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FibMode {
    Retracement,
    Extension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollOp {
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCol {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl SourceCol {
    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "open" => Self::Open,
            "high" => Self::High,
            "low" => Self::Low,
            "close" => Self::Close,
            "volume" => Self::Volume,
            other => {
                return Err(PlaybackError::InvalidPlay(format!(
                    "unknown source column: {other}"
                )))
            }
        })
    }

    pub fn select<'a>(self, ctx: &StructCtx<'a>) -> &'a [f64] {
        match self {
            Self::Open => ctx.open,
            Self::High => ctx.high,
            Self::Low => ctx.low,
            Self::Close => ctx.close,
            Self::Volume => ctx.volume,
        }
    }
}

/// Validated structure feature spec. Detectors that derive from a swing
/// embed their own swing instance, resolved from the referenced feature's
/// parameters at build time (use-before-declare is a schema error).
#[derive(Debug, Clone, PartialEq)]
pub enum StructureSpec {
    Swing {
        left: usize,
        right: usize,
    },
    Trend {
        swing_left: usize,
        swing_right: usize,
    },
    Zone {
        swing_left: usize,
        swing_right: usize,
        kind: ZoneKind,
        max_age_bars: usize,
    },
    Fibonacci {
        swing_left: usize,
        swing_right: usize,
        mode: FibMode,
    },
    RollingWindow {
        source: SourceCol,
        op: RollOp,
        length: usize,
    },
    DerivedZone {
        swing_left: usize,
        swing_right: usize,
        max_active: usize,
        max_age_bars: usize,
    },
}

/// Names of the structure detector types, as they appear in a Play.
pub const STRUCTURE_TYPES: &[&str] = &[
    "swing",
    "trend",
    "zone",
    "fibonacci",
    "rolling_window",
    "derived_zone",
];

pub fn is_structure_type(name: &str) -> bool {
    STRUCTURE_TYPES.contains(&name)
}

impl StructureSpec {
    /// Resolve a structure feature. `swing_lookup` maps previously declared
    /// swing feature ids to their (left, right) parameters.
    pub fn resolve(
        name: &str,
        params: &serde_json::Map<String, Value>,
        swing_lookup: &dyn Fn(&str) -> Option<(usize, usize)>,
    ) -> Result<Self> {
        let swing_of = |params: &serde_json::Map<String, Value>| -> Result<(usize, usize)> {
            let id = str_param(params, "swing", name)?;
            swing_lookup(&id).ok_or_else(|| PlaybackError::UndeclaredFeature(id))
        };
        Ok(match name {
            "swing" => Self::Swing {
                left: usize_param(params, "left", name)?,
                right: usize_param(params, "right", name)?,
            },
            "trend" => {
                let (swing_left, swing_right) = swing_of(params)?;
                Self::Trend {
                    swing_left,
                    swing_right,
                }
            }
            "zone" => {
                let (swing_left, swing_right) = swing_of(params)?;
                let kind = match str_param(params, "kind", name)?.as_str() {
                    "demand" => ZoneKind::Demand,
                    "supply" => ZoneKind::Supply,
                    other => {
                        return Err(PlaybackError::InvalidPlay(format!(
                            "unknown zone kind: {other}"
                        )))
                    }
                };
                Self::Zone {
                    swing_left,
                    swing_right,
                    kind,
                    max_age_bars: usize_param_or(params, "max_age_bars", 500, name)?,
                }
            }
            "fibonacci" => {
                let (swing_left, swing_right) = swing_of(params)?;
                let mode = match str_param_or(params, "mode", "retracement")?.as_str() {
                    "retracement" => FibMode::Retracement,
                    "extension" => FibMode::Extension,
                    other => {
                        return Err(PlaybackError::InvalidPlay(format!(
                            "unknown fibonacci mode: {other}"
                        )))
                    }
                };
                Self::Fibonacci {
                    swing_left,
                    swing_right,
                    mode,
                }
            }
            "rolling_window" => Self::RollingWindow {
                source: SourceCol::parse(&str_param(params, "source", name)?)?,
                op: match str_param(params, "op", name)?.as_str() {
                    "min" => RollOp::Min,
                    "max" => RollOp::Max,
                    other => {
                        return Err(PlaybackError::InvalidPlay(format!(
                            "unknown rolling op: {other}"
                        )))
                    }
                },
                length: usize_param(params, "length", name)?,
            },
            "derived_zone" => {
                let (swing_left, swing_right) = swing_of(params)?;
                Self::DerivedZone {
                    swing_left,
                    swing_right,
                    max_active: usize_param_or(params, "max_active", 3, name)?,
                    max_age_bars: usize_param_or(params, "max_age_bars", 500, name)?,
                }
            }
            other => return Err(PlaybackError::UnknownIndicator(other.to_string())),
        })
    }

    /// Swing parameters, when this spec is or embeds a swing.
    pub fn swing_params(&self) -> Option<(usize, usize)> {
        match *self {
            Self::Swing { left, right } => Some((left, right)),
            Self::Trend {
                swing_left,
                swing_right,
            }
            | Self::Zone {
                swing_left,
                swing_right,
                ..
            }
            | Self::Fibonacci {
                swing_left,
                swing_right,
                ..
            }
            | Self::DerivedZone {
                swing_left,
                swing_right,
                ..
            } => Some((swing_left, swing_right)),
            Self::RollingWindow { .. } => None,
        }
    }

    /// Bars of lookback this detector needs before its fields stabilize.
    pub fn warmup_bars(&self) -> usize {
        match *self {
            Self::Swing { left, right } => left + right + 1,
            // Dependents need at least two confirmed swing pairs.
            Self::Trend {
                swing_left,
                swing_right,
            }
            | Self::Fibonacci {
                swing_left,
                swing_right,
                ..
            } => 4 * (swing_left + swing_right + 1),
            Self::Zone {
                swing_left,
                swing_right,
                ..
            }
            | Self::DerivedZone {
                swing_left,
                swing_right,
                ..
            } => 2 * (swing_left + swing_right + 1),
            Self::RollingWindow { length, .. } => length,
        }
    }

    pub fn build(&self) -> Box<dyn Detector> {
        match *self {
            Self::Swing { left, right } => Box::new(swing::SwingDetector::new(left, right)),
            Self::Trend {
                swing_left,
                swing_right,
            } => Box::new(trend::TrendDetector::new(swing_left, swing_right)),
            Self::Zone {
                swing_left,
                swing_right,
                kind,
                max_age_bars,
            } => Box::new(zone::ZoneDetector::new(
                swing_left,
                swing_right,
                kind,
                max_age_bars,
            )),
            Self::Fibonacci {
                swing_left,
                swing_right,
                mode,
            } => Box::new(fibonacci::FibDetector::new(swing_left, swing_right, mode)),
            Self::RollingWindow { source, op, length } => {
                Box::new(rolling::RollingDetector::new(source, op, length))
            }
            Self::DerivedZone {
                swing_left,
                swing_right,
                max_active,
                max_age_bars,
            } => Box::new(derived_zone::DerivedZoneDetector::new(
                swing_left,
                swing_right,
                max_active,
                max_age_bars,
            )),
        }
    }
}

fn str_param(params: &serde_json::Map<String, Value>, key: &str, ind: &str) -> Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| PlaybackError::InvalidPlay(format!("{ind}: missing string param {key}")))
}

fn str_param_or(
    params: &serde_json::Map<String, Value>,
    key: &str,
    default: &str,
) -> Result<String> {
    match params.get(key) {
        None => Ok(default.to_string()),
        Some(v) => v
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| PlaybackError::InvalidPlay(format!("param {key} must be a string"))),
    }
}

fn usize_param(params: &serde_json::Map<String, Value>, key: &str, ind: &str) -> Result<usize> {
    let v = params
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| PlaybackError::InvalidPlay(format!("{ind}: missing integer param {key}")))?;
    if v == 0 || v > 5000 {
        return Err(PlaybackError::InvalidPlay(format!(
            "{ind}: param {key} out of range"
        )));
    }
    Ok(v as usize)
}

fn usize_param_or(
    params: &serde_json::Map<String, Value>,
    key: &str,
    default: usize,
    ind: &str,
) -> Result<usize> {
    if params.contains_key(key) {
        usize_param(params, key, ind)
    } else {
        Ok(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> serde_json::Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn resolve_swing() {
        let spec = StructureSpec::resolve(
            "swing",
            &obj(json!({"left": 5, "right": 5})),
            &|_| None,
        )
        .unwrap();
        assert_eq!(spec, StructureSpec::Swing { left: 5, right: 5 });
        assert_eq!(spec.warmup_bars(), 11);
    }

    #[test]
    fn resolve_trend_requires_declared_swing() {
        let err = StructureSpec::resolve(
            "trend",
            &obj(json!({"swing": "swing_a"})),
            &|_| None,
        )
        .unwrap_err();
        assert!(matches!(err, PlaybackError::UndeclaredFeature(_)));

        let ok = StructureSpec::resolve(
            "trend",
            &obj(json!({"swing": "swing_a"})),
            &|id| (id == "swing_a").then_some((5, 5)),
        )
        .unwrap();
        assert_eq!(
            ok,
            StructureSpec::Trend {
                swing_left: 5,
                swing_right: 5
            }
        );
    }

    #[test]
    fn resolve_zone_kinds() {
        let spec = StructureSpec::resolve(
            "zone",
            &obj(json!({"swing": "s", "kind": "supply", "max_age_bars": 100})),
            &|_| Some((3, 3)),
        )
        .unwrap();
        assert!(matches!(
            spec,
            StructureSpec::Zone {
                kind: ZoneKind::Supply,
                max_age_bars: 100,
                ..
            }
        ));
    }

    #[test]
    fn resolve_rolling_window() {
        let spec = StructureSpec::resolve(
            "rolling_window",
            &obj(json!({"source": "high", "op": "max", "length": 50})),
            &|_| None,
        )
        .unwrap();
        assert_eq!(
            spec,
            StructureSpec::RollingWindow {
                source: SourceCol::High,
                op: RollOp::Max,
                length: 50
            }
        );
    }

    #[test]
    fn resolve_unknown_structure() {
        let err =
            StructureSpec::resolve("order_block", &serde_json::Map::new(), &|_| None).unwrap_err();
        assert!(matches!(err, PlaybackError::UnknownIndicator(_)));
    }

    #[test]
    fn rejects_zero_length() {
        let err = StructureSpec::resolve(
            "rolling_window",
            &obj(json!({"source": "close", "op": "min", "length": 0})),
            &|_| None,
        )
        .unwrap_err();
        assert!(matches!(err, PlaybackError::InvalidPlay(_)));
    }
}
