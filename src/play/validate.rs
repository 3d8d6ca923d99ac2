//! Play validation: parse, normalize, resolve every feature and rule
//! operand, and compile the action blocks. Everything that can fail for
//! schema reasons fails here, before any data is touched.

use std::collections::BTreeMap;

use garde::Validate;
use serde_json::Value;

use crate::dsl::parse::{canonicalize, parse_action_blocks, FeatureIndex};
use crate::dsl::CompiledRules;
use crate::error::{PlaybackError, Result};
use crate::feed::{FeatureKind, PriceField, ResolvedFeature};
use crate::indicators::{Indicator, IndicatorParams};
use crate::structures::{is_structure_type, StructureSpec};
use crate::types::TfRole;

use super::Play;

/// A Play after full validation: resolved features, the feature index the
/// rule compiler used, the compiled rules, and the normalized document the
/// play hash is computed from.
#[derive(Debug)]
pub struct ValidatedPlay {
    pub play: Play,
    pub features: Vec<ResolvedFeature>,
    pub index: FeatureIndex,
    pub rules: CompiledRules,
    pub normalized_doc: Value,
}

/// Normalize a raw Play document: canonicalize every condition (shorthand
/// lists -> dict form). Idempotent.
pub fn normalize_play_doc(doc: &Value) -> Value {
    let mut out = doc.clone();
    if let Some(obj) = out.as_object_mut() {
        if let Some(actions) = obj.get("actions") {
            let canon = canonicalize(actions);
            obj.insert("actions".into(), canon);
        }
        if let Some(Value::Object(vars)) = obj.get("variables") {
            let canon: serde_json::Map<String, Value> = vars
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            obj.insert("variables".into(), Value::Object(canon));
        }
    }
    out
}

pub fn validate_play(doc: &Value) -> Result<ValidatedPlay> {
    let normalized_doc = normalize_play_doc(doc);
    let play: Play = serde_json::from_value(normalized_doc.clone())
        .map_err(|e| PlaybackError::InvalidPlay(e.to_string()))?;

    play.account
        .validate()
        .map_err(|e| PlaybackError::InvalidPlay(format!("account: {e}")))?;
    play.risk_model
        .validate()
        .map_err(|e| PlaybackError::InvalidPlay(format!("risk_model: {e}")))?;
    play.position_policy
        .validate()
        .map_err(|e| PlaybackError::InvalidPlay(format!("position_policy: {e}")))?;

    if play.symbol_universe.is_empty() {
        return Err(PlaybackError::MissingRequiredField("symbol_universe"));
    }
    for symbol in &play.symbol_universe {
        if !symbol.ends_with("USDT") {
            return Err(PlaybackError::InvalidPlay(format!(
                "symbol {symbol} is not USDT-quoted"
            )));
        }
    }
    if play.actions.as_array().is_none_or(Vec::is_empty) {
        return Err(PlaybackError::MissingRequiredField("actions"));
    }

    // TF hierarchy: exec <= mid <= high by duration.
    if let Some(mid) = play.mid_tf {
        if mid.minutes() < play.tf.minutes() {
            return Err(PlaybackError::InvalidPlay(format!(
                "mid tf {mid} shorter than exec tf {}",
                play.tf
            )));
        }
    }
    if let Some(high) = play.high_tf {
        let floor = play.mid_tf.unwrap_or(play.tf);
        if high.minutes() < floor.minutes() {
            return Err(PlaybackError::InvalidPlay(format!(
                "high tf {high} shorter than {floor}"
            )));
        }
    }

    let features = resolve_features(&play)?;
    let index = build_index(&play, &features)?;
    let rules = parse_action_blocks(&play.actions, &index)?;

    // Risk-per-trade sizing needs a stop distance on every possible entry.
    if matches!(play.risk_model.sizing, crate::play::SizingMode::RiskPerTradePct { .. })
        && play.risk_model.stop_loss.is_none()
    {
        let all_entries_stopped = rules.blocks.iter().all(|b| {
            b.cases.iter().all(|c| {
                c.emit.iter().all(|a| match a {
                    crate::dsl::ActionDef::Enter { stop, .. } => stop.is_some(),
                    crate::dsl::ActionDef::Exit => true,
                })
            })
        });
        if !all_entries_stopped {
            return Err(PlaybackError::InvalidPlay(
                "risk_per_trade_pct sizing requires a stop on the risk model or every entry".into(),
            ));
        }
    }

    tracing::debug!(
        play_id = %play.id,
        features = features.len(),
        blocks = rules.blocks.len(),
        "play validated"
    );

    Ok(ValidatedPlay {
        play,
        features,
        index,
        rules,
        normalized_doc,
    })
}

fn parse_role(decl_role: Option<&str>, play: &Play, feature_id: &str) -> Result<TfRole> {
    let role = match decl_role {
        None | Some("exec") => TfRole::Exec,
        Some("mid") => TfRole::Mid,
        Some("high") => TfRole::High,
        Some(other) => {
            return Err(PlaybackError::InvalidPlay(format!(
                "feature {feature_id}: unknown tf_role {other}"
            )))
        }
    };
    if play.tf_for_role(role).is_none() {
        return Err(PlaybackError::InvalidPlay(format!(
            "feature {feature_id} targets undeclared {role} tf"
        )));
    }
    Ok(role)
}

fn resolve_features(play: &Play) -> Result<Vec<ResolvedFeature>> {
    let mut resolved: Vec<ResolvedFeature> = Vec::with_capacity(play.features.len());
    // Swing params by feature id, for structure detectors that embed one.
    let mut swings: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    // Effective warmup per single-output key, for chained input sources.
    let mut warmups: BTreeMap<String, usize> = BTreeMap::new();

    for decl in &play.features {
        if resolved.iter().any(|f| f.id == decl.id) {
            return Err(PlaybackError::InvalidPlay(format!(
                "duplicate feature id: {}",
                decl.id
            )));
        }
        if decl.id.is_empty()
            || !decl
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(PlaybackError::InvalidPlay(format!(
                "feature id {:?} is not a valid identifier",
                decl.id
            )));
        }
        let role = parse_role(decl.tf_role.as_deref(), play, &decl.id)?;

        let (kind, own_warmup) = if is_structure_type(&decl.kind) {
            if decl.input_source.is_some() {
                return Err(PlaybackError::InputSourceUnsupported(decl.id.clone()));
            }
            let spec = StructureSpec::resolve(&decl.kind, &decl.params, &|swing_id| {
                // Swings resolve only within the same TF role.
                swings.get(swing_id).copied().filter(|_| {
                    resolved
                        .iter()
                        .any(|f| f.id == swing_id && f.role == role)
                })
            })?;
            if let StructureSpec::Swing { left, right } = spec {
                swings.insert(decl.id.clone(), (left, right));
            }
            let warmup = spec.warmup_bars();
            (FeatureKind::Structure(spec), warmup)
        } else {
            let params = numeric_params(&decl.params, &decl.id)?;
            let ind = Indicator::resolve(&decl.kind, &params)?;
            let warmup = ind.warmup_bars();
            (FeatureKind::Indicator(ind), warmup)
        };

        // Chained input: the source must be a price column or a column key
        // of an earlier indicator on the same role (multi-output features
        // are addressed by their expanded keys).
        let mut effective_warmup = own_warmup;
        if let Some(source) = &decl.input_source {
            if PriceField::parse(source).is_err() {
                let upstream = resolved
                    .iter()
                    .find(|f| {
                        f.role == role
                            && match &f.kind {
                                FeatureKind::Indicator(ind) => {
                                    ind.expand_keys(&f.id).iter().any(|k| k == source)
                                }
                                FeatureKind::Structure(_) => false,
                            }
                    })
                    .ok_or_else(|| PlaybackError::UndeclaredFeature(source.clone()))?;
                effective_warmup += warmups.get(&upstream.id).copied().unwrap_or(0);
            }
        }
        warmups.insert(decl.id.clone(), effective_warmup);

        resolved.push(ResolvedFeature {
            id: decl.id.clone(),
            role,
            kind,
            input_source: decl.input_source.clone(),
            effective_warmup,
        });
    }
    Ok(resolved)
}

fn numeric_params(params: &serde_json::Map<String, Value>, id: &str) -> Result<IndicatorParams> {
    let mut out = IndicatorParams::new();
    for (k, v) in params {
        let n = v.as_f64().ok_or_else(|| {
            PlaybackError::InvalidPlay(format!("feature {id}: param {k} must be numeric"))
        })?;
        out.insert(k.clone(), n);
    }
    Ok(out)
}

fn build_index(play: &Play, features: &[ResolvedFeature]) -> Result<FeatureIndex> {
    let mut index = FeatureIndex {
        has_mid: play.mid_tf.is_some(),
        has_high: play.high_tf.is_some(),
        variables: play.variables.clone(),
        ..FeatureIndex::default()
    };
    for feature in features {
        match &feature.kind {
            FeatureKind::Indicator(ind) => {
                for key in ind.expand_keys(&feature.id) {
                    index.indicator_keys.insert(key, feature.role);
                }
            }
            FeatureKind::Structure(spec) => {
                let fields = spec.build().fields().into_iter().collect();
                index
                    .structures
                    .insert(feature.id.clone(), (feature.role, fields));
            }
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::play::tests::minimal_play_json;
    use serde_json::json;

    #[test]
    fn valid_play_passes() {
        let vp = validate_play(&minimal_play_json()).unwrap();
        assert_eq!(vp.features.len(), 2);
        assert_eq!(vp.rules.blocks.len(), 2);
        assert!(vp.index.indicator_keys.contains_key("ema_9"));
    }

    #[test]
    fn normalization_is_idempotent() {
        let doc = minimal_play_json();
        let once = normalize_play_doc(&doc);
        let twice = normalize_play_doc(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn normalized_doc_has_dict_conditions() {
        let vp = validate_play(&minimal_play_json()).unwrap();
        let when = &vp.normalized_doc["actions"][0]["cases"][0]["when"];
        assert!(when.is_object(), "shorthand list should be canonicalized");
        assert_eq!(when["op"], "cross_above");
    }

    #[test]
    fn undeclared_rule_feature_rejected() {
        let mut doc = minimal_play_json();
        doc["actions"][0]["cases"][0]["when"] = json!(["sma_50", "gt", 0]);
        let err = validate_play(&doc).unwrap_err();
        assert!(matches!(err, PlaybackError::UndeclaredFeature(_)));
    }

    #[test]
    fn non_usdt_symbol_rejected() {
        let mut doc = minimal_play_json();
        doc["symbol_universe"] = json!(["BTCEUR"]);
        let err = validate_play(&doc).unwrap_err();
        assert!(matches!(err, PlaybackError::InvalidPlay(_)));
    }

    #[test]
    fn tf_hierarchy_enforced() {
        let mut doc = minimal_play_json();
        doc.as_object_mut()
            .unwrap()
            .insert("mid_tf".into(), json!("5m")); // shorter than exec 15m
        let err = validate_play(&doc).unwrap_err();
        assert!(matches!(err, PlaybackError::InvalidPlay(_)));
    }

    #[test]
    fn duplicate_feature_id_rejected() {
        let mut doc = minimal_play_json();
        doc["features"][1]["id"] = json!("ema_9");
        let err = validate_play(&doc).unwrap_err();
        assert!(matches!(err, PlaybackError::InvalidPlay(_)));
    }

    #[test]
    fn feature_on_undeclared_role_rejected() {
        let mut doc = minimal_play_json();
        doc["features"][0]
            .as_object_mut()
            .unwrap()
            .insert("tf_role".into(), json!("mid"));
        let err = validate_play(&doc).unwrap_err();
        assert!(matches!(err, PlaybackError::InvalidPlay(_)));
    }

    #[test]
    fn structure_reference_resolves_in_order() {
        let mut doc = minimal_play_json();
        doc["features"] = json!([
            {"id": "swing_a", "type": "swing", "params": {"left": 5, "right": 5}},
            {"id": "trend_a", "type": "trend", "params": {"swing": "swing_a"}},
            {"id": "ema_9", "type": "ema", "params": {"length": 9}},
            {"id": "ema_21", "type": "ema", "params": {"length": 21}},
        ]);
        let vp = validate_play(&doc).unwrap();
        assert!(vp.index.structures.contains_key("trend_a"));
    }

    #[test]
    fn structure_use_before_declare_rejected() {
        let mut doc = minimal_play_json();
        doc["features"] = json!([
            {"id": "trend_a", "type": "trend", "params": {"swing": "swing_a"}},
            {"id": "swing_a", "type": "swing", "params": {"left": 5, "right": 5}},
            {"id": "ema_9", "type": "ema", "params": {"length": 9}},
            {"id": "ema_21", "type": "ema", "params": {"length": 21}},
        ]);
        let err = validate_play(&doc).unwrap_err();
        assert!(matches!(err, PlaybackError::UndeclaredFeature(_)));
    }

    #[test]
    fn chained_input_source_accumulates_warmup() {
        let mut doc = minimal_play_json();
        doc["features"] = json!([
            {"id": "ema_9", "type": "ema", "params": {"length": 9}},
            {"id": "ema_21", "type": "ema", "params": {"length": 21}},
            {"id": "smooth", "type": "sma", "params": {"length": 5}, "input_source": "ema_9"},
        ]);
        let vp = validate_play(&doc).unwrap();
        let smooth = vp.features.iter().find(|f| f.id == "smooth").unwrap();
        assert_eq!(smooth.effective_warmup, 5 + 27);
    }

    #[test]
    fn empty_actions_rejected() {
        let mut doc = minimal_play_json();
        doc["actions"] = json!([]);
        let err = validate_play(&doc).unwrap_err();
        assert!(matches!(err, PlaybackError::MissingRequiredField(_)));
    }
}
