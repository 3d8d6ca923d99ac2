//! Feature frame builder: turns an ordered feature spec list plus OHLCV
//! arrays into the per-timeframe column arrays of a [`FeedStore`].
//!
//! The Play validator enforces declare-before-use, so declaration order is a
//! valid topological order and the builder simply processes specs in
//! sequence. Indicator columns are audited for NaN after their effective
//! warmup; structure fields may stay NaN for as long as their state machine
//! has nothing to report.

use crate::error::{PlaybackError, Result};
use crate::indicators::{batch, Indicator};
use crate::structures::{StructCtx, StructureSpec};
use crate::types::{Bar, TfRole, Timeframe};

use super::store::FeedStore;

/// A feature spec after Play validation: concrete indicator or structure,
/// routed input, and the chained (effective) warmup in bars of its TF.
#[derive(Debug, Clone)]
pub struct ResolvedFeature {
    pub id: String,
    pub role: TfRole,
    pub kind: FeatureKind,
    /// `None` routes the primary input to `close`. `Some` may name a price
    /// column or a previously declared single-output feature key.
    pub input_source: Option<String>,
    pub effective_warmup: usize,
}

#[derive(Debug, Clone)]
pub enum FeatureKind {
    Indicator(Indicator),
    Structure(StructureSpec),
}

/// Build one TF's feed: OHLCV arena plus every feature column for specs
/// assigned to `role`.
pub fn build_feed(
    bars: &[Bar],
    tf: Timeframe,
    role: TfRole,
    specs: &[ResolvedFeature],
) -> Result<FeedStore> {
    let mut store = FeedStore::from_bars(bars, tf)?;

    for spec in specs.iter().filter(|s| s.role == role) {
        match &spec.kind {
            FeatureKind::Indicator(ind) => build_indicator(&mut store, spec, ind)?,
            FeatureKind::Structure(st) => build_structure(&mut store, spec, st),
        }
    }
    Ok(store)
}

fn build_indicator(store: &mut FeedStore, spec: &ResolvedFeature, ind: &Indicator) -> Result<()> {
    let primary: Vec<f64> = match &spec.input_source {
        None => store.price(super::store::PriceField::Close).to_vec(),
        Some(source) => {
            if !ind.supports_flexible_input() {
                return Err(PlaybackError::InputSourceUnsupported(spec.id.clone()));
            }
            resolve_source(store, source)?
        }
    };

    let inputs = batch::SeriesInputs {
        open: store.price(super::store::PriceField::Open),
        high: store.price(super::store::PriceField::High),
        low: store.price(super::store::PriceField::Low),
        close: store.price(super::store::PriceField::Close),
        volume: store.price(super::store::PriceField::Volume),
        primary: &primary,
    };
    let outputs = batch::compute(ind, &inputs);
    let keys = ind.expand_keys(&spec.id);
    debug_assert_eq!(outputs.len(), keys.len());

    for (key, values) in keys.into_iter().zip(outputs) {
        // NaN after the effective warmup is a data error, not a signal.
        for (i, v) in values.iter().enumerate().skip(spec.effective_warmup) {
            if v.is_nan() {
                return Err(PlaybackError::NanAfterWarmup { key, index: i });
            }
        }
        store.insert_column(key, values);
    }
    Ok(())
}

fn build_structure(store: &mut FeedStore, spec: &ResolvedFeature, st: &StructureSpec) {
    let mut detector = st.build();
    let fields = detector.fields();
    let n = store.len();
    let mut columns: Vec<Vec<f64>> = fields.iter().map(|_| Vec::with_capacity(n)).collect();

    for i in 0..n {
        let ctx = StructCtx {
            idx: i,
            open: store.price(super::store::PriceField::Open),
            high: store.price(super::store::PriceField::High),
            low: store.price(super::store::PriceField::Low),
            close: store.price(super::store::PriceField::Close),
            volume: store.price(super::store::PriceField::Volume),
        };
        let row = detector.update(&ctx);
        debug_assert_eq!(row.len(), fields.len());
        for (col, v) in columns.iter_mut().zip(row) {
            col.push(v);
        }
    }

    for (field, values) in fields.into_iter().zip(columns) {
        store.insert_structure_field(spec.id.clone(), field, values);
    }
}

fn resolve_source(store: &FeedStore, source: &str) -> Result<Vec<f64>> {
    if let Ok(field) = super::store::PriceField::parse(source) {
        return Ok(store.price(field).to_vec());
    }
    store
        .column(source)
        .map(<[f64]>::to_vec)
        .ok_or_else(|| PlaybackError::UndeclaredFeature(source.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::store::bars_from_closes;
    use crate::indicators::IndicatorParams;

    fn ind(name: &str, length: f64) -> Indicator {
        let p: IndicatorParams = [("length".to_string(), length)].into_iter().collect();
        Indicator::resolve(name, &p).unwrap()
    }

    fn closes(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + (i as f64 * 0.31).sin() * 4.0)
            .collect()
    }

    #[test]
    fn builds_single_output_column() {
        let bars = bars_from_closes(&closes(60), Timeframe::M15, 0);
        let specs = vec![ResolvedFeature {
            id: "ema_9".into(),
            role: TfRole::Exec,
            kind: FeatureKind::Indicator(ind("ema", 9.0)),
            input_source: None,
            effective_warmup: 27,
        }];
        let store = build_feed(&bars, Timeframe::M15, TfRole::Exec, &specs).unwrap();
        let col = store.column("ema_9").unwrap();
        assert_eq!(col.len(), 60);
        assert!(col[7].is_nan());
        assert!(!col[8].is_nan()); // seeded at length - 1
        assert!(!col[27].is_nan());
    }

    #[test]
    fn expands_multi_output_keys() {
        let bars = bars_from_closes(&closes(120), Timeframe::M15, 0);
        let p: IndicatorParams = [
            ("fast".to_string(), 12.0),
            ("slow".to_string(), 26.0),
            ("signal".to_string(), 9.0),
        ]
        .into_iter()
        .collect();
        let specs = vec![ResolvedFeature {
            id: "macd_a".into(),
            role: TfRole::Exec,
            kind: FeatureKind::Indicator(Indicator::resolve("macd", &p).unwrap()),
            input_source: None,
            effective_warmup: 87,
        }];
        let store = build_feed(&bars, Timeframe::M15, TfRole::Exec, &specs).unwrap();
        for key in ["macd_a_macd", "macd_a_signal", "macd_a_histogram"] {
            assert!(store.column(key).is_some(), "missing {key}");
        }
        assert!(store.column("macd_a").is_none());
    }

    #[test]
    fn routes_volume_input() {
        let mut bars = bars_from_closes(&closes(40), Timeframe::M15, 0);
        for (i, bar) in bars.iter_mut().enumerate() {
            bar.volume = 10.0 + i as f64;
        }
        let specs = vec![ResolvedFeature {
            id: "vol_sma".into(),
            role: TfRole::Exec,
            kind: FeatureKind::Indicator(ind("sma", 5.0)),
            input_source: Some("volume".into()),
            effective_warmup: 5,
        }];
        let store = build_feed(&bars, Timeframe::M15, TfRole::Exec, &specs).unwrap();
        let col = store.column("vol_sma").unwrap();
        // SMA of volumes 10..=14 at index 4 is 12.
        assert!((col[4] - 12.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_flexible_input_on_multi_series() {
        let bars = bars_from_closes(&closes(40), Timeframe::M15, 0);
        let specs = vec![ResolvedFeature {
            id: "atr_14".into(),
            role: TfRole::Exec,
            kind: FeatureKind::Indicator(ind("atr", 14.0)),
            input_source: Some("volume".into()),
            effective_warmup: 43,
        }];
        let err = build_feed(&bars, Timeframe::M15, TfRole::Exec, &specs).unwrap_err();
        assert!(matches!(err, PlaybackError::InputSourceUnsupported(_)));
    }

    #[test]
    fn chained_feature_input() {
        let bars = bars_from_closes(&closes(80), Timeframe::M15, 0);
        let specs = vec![
            ResolvedFeature {
                id: "ema_9".into(),
                role: TfRole::Exec,
                kind: FeatureKind::Indicator(ind("ema", 9.0)),
                input_source: None,
                effective_warmup: 27,
            },
            ResolvedFeature {
                id: "smooth".into(),
                role: TfRole::Exec,
                kind: FeatureKind::Indicator(ind("sma", 5.0)),
                input_source: Some("ema_9".into()),
                effective_warmup: 32,
            },
        ];
        let store = build_feed(&bars, Timeframe::M15, TfRole::Exec, &specs).unwrap();
        assert!(!store.column("smooth").unwrap()[32].is_nan());
    }

    #[test]
    fn structure_fields_attached() {
        let bars = bars_from_closes(&closes(80), Timeframe::M15, 0);
        let specs = vec![ResolvedFeature {
            id: "swing_a".into(),
            role: TfRole::Exec,
            kind: FeatureKind::Structure(StructureSpec::Swing { left: 3, right: 3 }),
            input_source: None,
            effective_warmup: 7,
        }];
        let store = build_feed(&bars, Timeframe::M15, TfRole::Exec, &specs).unwrap();
        assert!(store.structure_field("swing_a", "high_level").is_some());
        assert!(store.structure_field("swing_a", "version").is_some());
        assert!(store.structure_field("swing_a", "missing").is_none());
    }

    #[test]
    fn skips_other_roles() {
        let bars = bars_from_closes(&closes(40), Timeframe::H1, 0);
        let specs = vec![ResolvedFeature {
            id: "ema_9".into(),
            role: TfRole::Exec,
            kind: FeatureKind::Indicator(ind("ema", 9.0)),
            input_source: None,
            effective_warmup: 27,
        }];
        let store = build_feed(&bars, Timeframe::H1, TfRole::Mid, &specs).unwrap();
        assert!(store.column("ema_9").is_none());
    }
}
