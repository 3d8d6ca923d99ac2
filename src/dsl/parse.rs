//! Rule compiler: canonicalizes the declarative JSON condition forms
//! (shorthand lists included) and resolves every operand against the
//! declared feature set. All schema failures surface here, before the hot
//! loop ever runs.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::error::{PlaybackError, Result};
use crate::feed::PriceField;
use crate::snapshot::{Builtin, FeaturePath};
use crate::types::{PriceRef, Side, TfRole};

use super::ast::{
    ActionBlock, ActionDef, CmpOp, CompiledRules, Cond, CrossDir, Operand, RuleCase, WindowKind,
    MAX_WINDOW_BARS,
};

/// Everything the parser needs to resolve names: expanded indicator keys,
/// structure ids with their field sets, which TF roles exist, and the
/// named reusable conditions.
#[derive(Debug, Clone, Default)]
pub struct FeatureIndex {
    pub indicator_keys: BTreeMap<String, TfRole>,
    pub structures: BTreeMap<String, (TfRole, BTreeSet<String>)>,
    pub has_mid: bool,
    pub has_high: bool,
    pub variables: BTreeMap<String, Value>,
}

impl FeatureIndex {
    pub fn has_role(&self, role: TfRole) -> bool {
        match role {
            TfRole::Exec => true,
            TfRole::Mid => self.has_mid,
            TfRole::High => self.has_high,
        }
    }

    /// Validate a fully-qualified path against the declarations.
    pub fn validate_path(&self, path: &FeaturePath) -> Result<()> {
        if !self.has_role(path.role()) {
            return Err(PlaybackError::UndeclaredFeature(format!("{path:?}")));
        }
        match path {
            FeaturePath::Indicator { role, key } => match self.indicator_keys.get(key) {
                Some(r) if r == role => Ok(()),
                _ => Err(PlaybackError::UndeclaredFeature(key.clone())),
            },
            FeaturePath::Structure { role, id, field } => match self.structures.get(id) {
                Some((r, fields)) if r == role && fields.contains(field) => Ok(()),
                _ => Err(PlaybackError::UndeclaredFeature(format!("{id}.{field}"))),
            },
            FeaturePath::Price { .. } | FeaturePath::Builtin(_) => Ok(()),
        }
    }

    /// Resolve a bare name: a builtin, a price column (exec), an expanded
    /// indicator key, or `structure_id.field`.
    fn resolve_bare(&self, name: &str) -> Result<FeaturePath> {
        match name {
            "close" | "last_price" | "ts_close_ms" => {
                return FeaturePath::parse(&format!("builtin.{name}"));
            }
            "open" | "high" | "low" | "volume" => {
                return Ok(FeaturePath::Price {
                    role: TfRole::Exec,
                    field: PriceField::parse(name)?,
                });
            }
            _ => {}
        }
        if let Some(role) = self.indicator_keys.get(name) {
            return Ok(FeaturePath::Indicator {
                role: *role,
                key: name.to_string(),
            });
        }
        if let Some((id, field)) = name.split_once('.') {
            if let Some((role, fields)) = self.structures.get(id) {
                if fields.contains(field) {
                    return Ok(FeaturePath::Structure {
                        role: *role,
                        id: id.to_string(),
                        field: field.to_string(),
                    });
                }
            }
        }
        Err(PlaybackError::UndeclaredFeature(name.to_string()))
    }

    /// Resolve a possibly role-prefixed name ("mid.rsi_14",
    /// "high.trend_a.direction", "price.mid.close", bare keys, …).
    fn resolve_name(&self, name: &str) -> Result<FeaturePath> {
        for prefix in ["indicator.", "structure.", "price.", "builtin."] {
            if name.starts_with(prefix) {
                let path = FeaturePath::parse(name)?;
                self.validate_path(&path)?;
                return Ok(path);
            }
        }
        if let Some((head, rest)) = name.split_once('.') {
            let role = match head {
                "exec" => Some(TfRole::Exec),
                "mid" => Some(TfRole::Mid),
                "high" => Some(TfRole::High),
                _ => None,
            };
            if let Some(role) = role {
                let path = self.resolve_in_role(rest, role)?;
                self.validate_path(&path)?;
                return Ok(path);
            }
        }
        let path = self.resolve_bare(name)?;
        self.validate_path(&path)?;
        Ok(path)
    }

    fn resolve_in_role(&self, name: &str, role: TfRole) -> Result<FeaturePath> {
        if matches!(name, "open" | "high" | "low" | "close" | "volume") {
            return Ok(FeaturePath::Price {
                role,
                field: PriceField::parse(name)?,
            });
        }
        if self.indicator_keys.contains_key(name) {
            return Ok(FeaturePath::Indicator {
                role,
                key: name.to_string(),
            });
        }
        if let Some((id, field)) = name.split_once('.') {
            if self.structures.contains_key(id) {
                return Ok(FeaturePath::Structure {
                    role,
                    id: id.to_string(),
                    field: field.to_string(),
                });
            }
        }
        Err(PlaybackError::UndeclaredFeature(name.to_string()))
    }
}

const OPERATOR_NAMES: &[&str] = &[
    "gt",
    "lt",
    "gte",
    "lte",
    "eq",
    "cross_above",
    "cross_below",
    "between",
    "near_abs",
    "near_pct",
    "in",
];

/// Canonicalize the shorthand list form `[lhs, op, rhs(, extra)]` into the
/// dict form, recursively. Idempotent: dict forms pass through untouched.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            if let Some(Value::String(op)) = items.get(1) {
                if OPERATOR_NAMES.contains(&op.as_str())
                    && (items.len() == 3 || items.len() == 4)
                {
                    let mut map = serde_json::Map::new();
                    map.insert("op".into(), Value::String(op.clone()));
                    map.insert("lhs".into(), items[0].clone());
                    map.insert("rhs".into(), items[2].clone());
                    if let Some(extra) = items.get(3) {
                        map.insert("tol".into(), extra.clone());
                    }
                    return Value::Object(map);
                }
            }
            Value::Array(items.iter().map(canonicalize).collect())
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let canon = match k.as_str() {
                    "all" | "any" => canonicalize(v),
                    "not" | "expr" | "when" => canonicalize(v),
                    _ => v.clone(),
                };
                out.insert(k.clone(), canon);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

pub fn parse_cond(value: &Value, index: &FeatureIndex) -> Result<Cond> {
    parse_cond_inner(&canonicalize(value), index, 0)
}

fn parse_cond_inner(value: &Value, index: &FeatureIndex, depth: usize) -> Result<Cond> {
    if depth > 32 {
        return Err(PlaybackError::DslParse("condition nesting too deep".into()));
    }
    match value {
        Value::Bool(b) => Ok(Cond::Literal(*b)),
        Value::Object(map) => parse_cond_object(map, index, depth),
        other => Err(PlaybackError::DslParse(format!(
            "expected condition object, got {other}"
        ))),
    }
}

fn parse_cond_object(
    map: &serde_json::Map<String, Value>,
    index: &FeatureIndex,
    depth: usize,
) -> Result<Cond> {
    if let Some(items) = map.get("all") {
        return Ok(Cond::All(parse_cond_list(items, index, depth)?));
    }
    if let Some(items) = map.get("any") {
        return Ok(Cond::Any(parse_cond_list(items, index, depth)?));
    }
    if let Some(inner) = map.get("not") {
        return Ok(Cond::Not(Box::new(parse_cond_inner(
            inner,
            index,
            depth + 1,
        )?)));
    }
    if let Some(name) = map.get("var") {
        let name = name
            .as_str()
            .ok_or_else(|| PlaybackError::DslParse("var must be a string".into()))?;
        let body = index
            .variables
            .get(name)
            .cloned()
            .ok_or_else(|| PlaybackError::UndeclaredFeature(format!("${name}")))?;
        return parse_cond_inner(&canonicalize(&body), index, depth + 1);
    }

    let Some(op) = map.get("op").and_then(Value::as_str) else {
        return Err(PlaybackError::DslParse(format!(
            "condition object without operator: {}",
            Value::Object(map.clone())
        )));
    };

    match op {
        "gt" | "lt" | "gte" | "lte" | "eq" => {
            let cmp = match op {
                "gt" => CmpOp::Gt,
                "lt" => CmpOp::Lt,
                "gte" => CmpOp::Gte,
                "lte" => CmpOp::Lte,
                _ => CmpOp::Eq,
            };
            Ok(Cond::Cmp {
                op: cmp,
                lhs: operand(map, "lhs", index)?,
                rhs: operand(map, "rhs", index)?,
            })
        }
        "cross_above" | "cross_below" => Ok(Cond::Cross {
            dir: if op == "cross_above" {
                CrossDir::Above
            } else {
                CrossDir::Below
            },
            lhs: operand(map, "lhs", index)?,
            rhs: operand(map, "rhs", index)?,
        }),
        "between" => {
            let value = operand(map, "lhs", index)?;
            let bounds = map
                .get("rhs")
                .and_then(Value::as_array)
                .ok_or(PlaybackError::ArityMismatch {
                    op: "between",
                    expected: 2,
                    got: 0,
                })?;
            if bounds.len() != 2 {
                return Err(PlaybackError::ArityMismatch {
                    op: "between",
                    expected: 2,
                    got: bounds.len(),
                });
            }
            let low = number(&bounds[0], "between.low")?;
            let high = number(&bounds[1], "between.high")?;
            if low > high {
                return Err(PlaybackError::DslParse(format!(
                    "between bounds inverted: [{low}, {high}]"
                )));
            }
            Ok(Cond::Between { value, low, high })
        }
        "near_abs" | "near_pct" => {
            let tol = map
                .get("tol")
                .and_then(Value::as_f64)
                .ok_or(PlaybackError::ArityMismatch {
                    op: "near",
                    expected: 4,
                    got: 3,
                })?;
            if tol <= 0.0 || !tol.is_finite() {
                return Err(PlaybackError::InvalidTolerance { op: "near", tol });
            }
            let lhs = operand(map, "lhs", index)?;
            let rhs = operand(map, "rhs", index)?;
            if op == "near_abs" {
                Ok(Cond::NearAbs { lhs, rhs, tol })
            } else {
                // Percent -> fraction, exactly once.
                Ok(Cond::NearPct {
                    lhs,
                    rhs,
                    tol_frac: tol / 100.0,
                })
            }
        }
        "in" => {
            let value = operand(map, "lhs", index)?;
            let set = map
                .get("rhs")
                .and_then(Value::as_array)
                .ok_or(PlaybackError::ArityMismatch {
                    op: "in",
                    expected: 1,
                    got: 0,
                })?
                .iter()
                .map(|v| number(v, "in.set"))
                .collect::<Result<Vec<f64>>>()?;
            Ok(Cond::In { value, set })
        }
        "holds_for" | "occurred_within" | "count_true" => {
            let kind = window_kind(op);
            let bars = map
                .get("bars")
                .and_then(Value::as_u64)
                .ok_or(PlaybackError::ArityMismatch {
                    op: "window",
                    expected: 1,
                    got: 0,
                })? as usize;
            if bars == 0 || bars > MAX_WINDOW_BARS {
                return Err(PlaybackError::InvalidWindowBars {
                    bars,
                    cap: MAX_WINDOW_BARS,
                });
            }
            let anchor = anchor_tf(map, index)?;
            let min_true = if kind == WindowKind::CountTrue {
                map.get("min_true")
                    .and_then(Value::as_u64)
                    .ok_or(PlaybackError::ArityMismatch {
                        op: "count_true",
                        expected: 1,
                        got: 0,
                    })? as usize
            } else {
                0
            };
            let expr = map.get("expr").ok_or(PlaybackError::ArityMismatch {
                op: "window",
                expected: 1,
                got: 0,
            })?;
            Ok(Cond::WindowBars {
                kind,
                bars,
                anchor,
                min_true,
                expr: Box::new(parse_cond_inner(expr, index, depth + 1)?),
            })
        }
        "holds_for_duration" | "occurred_within_duration" | "count_true_duration" => {
            let kind = window_kind(op.trim_end_matches("_duration"));
            let minutes = duration_minutes(map.get("duration"), "duration")?;
            let min_true_minutes = if kind == WindowKind::CountTrue {
                duration_minutes(map.get("min_true"), "min_true")?
            } else {
                0
            };
            let expr = map.get("expr").ok_or(PlaybackError::ArityMismatch {
                op: "window",
                expected: 1,
                got: 0,
            })?;
            Ok(Cond::WindowDuration {
                kind,
                minutes,
                min_true_minutes,
                expr: Box::new(parse_cond_inner(expr, index, depth + 1)?),
            })
        }
        other => Err(PlaybackError::UnknownOperator(other.to_string())),
    }
}

fn window_kind(op: &str) -> WindowKind {
    match op {
        "holds_for" => WindowKind::HoldsFor,
        "occurred_within" => WindowKind::OccurredWithin,
        _ => WindowKind::CountTrue,
    }
}

fn anchor_tf(map: &serde_json::Map<String, Value>, index: &FeatureIndex) -> Result<TfRole> {
    let name = map
        .get("anchor_tf")
        .and_then(Value::as_str)
        .unwrap_or("exec");
    let role = match name {
        "exec" => TfRole::Exec,
        "mid" => TfRole::Mid,
        "high" => TfRole::High,
        other => {
            // Unknown anchor TF is a schema error at compile time.
            return Err(PlaybackError::DslParse(format!("unknown anchor tf: {other}")));
        }
    };
    if !index.has_role(role) {
        return Err(PlaybackError::UndeclaredFeature(format!(
            "anchor tf {name} not declared"
        )));
    }
    Ok(role)
}

fn parse_cond_list(value: &Value, index: &FeatureIndex, depth: usize) -> Result<Vec<Cond>> {
    let items = value
        .as_array()
        .ok_or_else(|| PlaybackError::DslParse("all/any expects a list".into()))?;
    if items.is_empty() {
        return Err(PlaybackError::DslParse("all/any must not be empty".into()));
    }
    items
        .iter()
        .map(|v| parse_cond_inner(v, index, depth + 1))
        .collect()
}

fn operand(map: &serde_json::Map<String, Value>, key: &str, index: &FeatureIndex) -> Result<Operand> {
    let value = map.get(key).ok_or(PlaybackError::ArityMismatch {
        op: "operator",
        expected: 2,
        got: 1,
    })?;
    parse_operand(value, index)
}

pub fn parse_operand(value: &Value, index: &FeatureIndex) -> Result<Operand> {
    match value {
        Value::Number(n) => Ok(Operand::Number(n.as_f64().ok_or_else(|| {
            PlaybackError::DslParse(format!("non-finite number: {n}"))
        })?)),
        Value::Bool(b) => Ok(Operand::Bool(*b)),
        Value::String(name) => Ok(Operand::Path {
            path: index.resolve_name(name)?,
            offset: 0,
        }),
        Value::Object(map) => {
            let offset = map.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
            let name = map
                .get("feature")
                .or_else(|| map.get("path"))
                .or_else(|| map.get("builtin"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    PlaybackError::DslParse(format!("bad operand: {}", Value::Object(map.clone())))
                })?;
            let name = if map.contains_key("builtin") {
                format!("builtin.{name}")
            } else {
                name.to_string()
            };
            Ok(Operand::Path {
                path: index.resolve_name(&name)?,
                offset,
            })
        }
        other => Err(PlaybackError::DslParse(format!("bad operand: {other}"))),
    }
}

fn number(value: &Value, what: &str) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| PlaybackError::DslParse(format!("{what} must be a number")))
}

fn duration_minutes(value: Option<&Value>, what: &str) -> Result<i64> {
    let s = value
        .and_then(Value::as_str)
        .ok_or_else(|| PlaybackError::DslParse(format!("{what} must be a duration string")))?;
    let (digits, unit) = s.split_at(s.len().saturating_sub(1));
    let quantity: i64 = digits
        .parse()
        .map_err(|_| PlaybackError::DslParse(format!("bad duration: {s}")))?;
    if quantity <= 0 {
        return Err(PlaybackError::DslParse(format!("bad duration: {s}")));
    }
    let minutes = match unit {
        "m" => quantity,
        "h" => quantity * 60,
        "d" => quantity * 1440,
        _ => return Err(PlaybackError::DslParse(format!("bad duration unit: {s}"))),
    };
    Ok(minutes)
}

/// Parse the `actions` document: a list of blocks, each with ordered cases.
pub fn parse_action_blocks(value: &Value, index: &FeatureIndex) -> Result<CompiledRules> {
    let blocks = value
        .as_array()
        .ok_or_else(|| PlaybackError::DslParse("actions must be a list".into()))?;
    let mut out = Vec::with_capacity(blocks.len());
    for (i, block) in blocks.iter().enumerate() {
        let map = block
            .as_object()
            .ok_or_else(|| PlaybackError::DslParse("action block must be an object".into()))?;
        let id = map
            .get("id")
            .and_then(Value::as_str)
            .map_or_else(|| format!("block_{i}"), ToString::to_string);
        let cases = map
            .get("cases")
            .and_then(Value::as_array)
            .ok_or_else(|| PlaybackError::DslParse(format!("block {id} has no cases")))?;
        let mut parsed_cases = Vec::with_capacity(cases.len());
        for case in cases {
            let case_map = case
                .as_object()
                .ok_or_else(|| PlaybackError::DslParse("case must be an object".into()))?;
            let when = case_map
                .get("when")
                .ok_or_else(|| PlaybackError::DslParse(format!("case in {id} missing when")))?;
            let emit = case_map
                .get("emit")
                .ok_or_else(|| PlaybackError::DslParse(format!("case in {id} missing emit")))?;
            parsed_cases.push(RuleCase {
                when: parse_cond(when, index)?,
                emit: parse_emit(emit)?,
            });
        }
        out.push(ActionBlock {
            id,
            cases: parsed_cases,
        });
    }
    Ok(CompiledRules { blocks: out })
}

fn parse_emit(value: &Value) -> Result<Vec<ActionDef>> {
    let items = value
        .as_array()
        .ok_or_else(|| PlaybackError::DslParse("emit must be a list".into()))?;
    let mut out = Vec::with_capacity(items.len());
    let mut enters = 0;
    for item in items {
        let map = item
            .as_object()
            .ok_or_else(|| PlaybackError::DslParse("action must be an object".into()))?;
        let action = map
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| PlaybackError::DslParse("action missing 'action' key".into()))?;
        match action {
            "enter_long" | "enter_short" => {
                enters += 1;
                let side = if action == "enter_long" {
                    Side::Long
                } else {
                    Side::Short
                };
                out.push(ActionDef::Enter {
                    side,
                    size_pct: map.get("size_pct").and_then(Value::as_f64),
                    stop: price_ref(map.get("stop"))?,
                    take_profit: price_ref(map.get("take_profit"))?,
                });
            }
            "exit" => out.push(ActionDef::Exit),
            other => {
                return Err(PlaybackError::UnknownOperator(format!("action {other}")));
            }
        }
    }
    if enters > 1 {
        return Err(PlaybackError::DslParse(
            "a case may emit at most one entry action".into(),
        ));
    }
    Ok(out)
}

fn price_ref(value: Option<&Value>) -> Result<Option<PriceRef>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed: PriceRef = serde_json::from_value(value.clone())
        .map_err(|e| PlaybackError::DslParse(format!("bad price ref: {e}")))?;
    Ok(Some(parsed))
}
