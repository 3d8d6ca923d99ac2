//! Immutable per-timeframe arena: OHLCV arrays, indicator columns keyed by
//! expanded feature key, structure field arrays keyed by (feature id, field),
//! plus the `ts_close_ms -> index` map for exact and bisect lookups.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::error::{PlaybackError, Result};
use crate::types::{Bar, Timeframe};

/// Raw price/volume columns addressable from rules and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriceField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl PriceField {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "open" => Self::Open,
            "high" => Self::High,
            "low" => Self::Low,
            "close" => Self::Close,
            "volume" => Self::Volume,
            other => {
                return Err(PlaybackError::FeatureMissing(format!(
                    "price.{other}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct FeedStore {
    tf: Timeframe,
    open: Vec<f64>,
    high: Vec<f64>,
    low: Vec<f64>,
    close: Vec<f64>,
    volume: Vec<f64>,
    ts_open_ms: Vec<i64>,
    ts_close_ms: Vec<i64>,
    columns: BTreeMap<String, Vec<f64>>,
    structures: BTreeMap<(String, String), Vec<f64>>,
    ts_to_idx: FxHashMap<i64, usize>,
}

impl FeedStore {
    /// Build the OHLCV arena from closed bars. Bars must be strictly
    /// increasing in `ts_open` and aligned to the TF boundary; `ts_close` is
    /// taken from the bar when it carries one, else derived.
    pub fn from_bars(bars: &[Bar], tf: Timeframe) -> Result<Self> {
        let n = bars.len();
        let duration = tf.duration_ms();
        let mut store = Self {
            tf,
            open: Vec::with_capacity(n),
            high: Vec::with_capacity(n),
            low: Vec::with_capacity(n),
            close: Vec::with_capacity(n),
            volume: Vec::with_capacity(n),
            ts_open_ms: Vec::with_capacity(n),
            ts_close_ms: Vec::with_capacity(n),
            columns: BTreeMap::new(),
            structures: BTreeMap::new(),
            ts_to_idx: FxHashMap::default(),
        };

        let mut prev_open = i64::MIN;
        for (i, bar) in bars.iter().enumerate() {
            if bar.ts_open <= prev_open {
                return Err(PlaybackError::UnorderedBars {
                    tf: tf.to_string(),
                    index: i,
                });
            }
            if bar.ts_open % duration != 0 {
                return Err(PlaybackError::MisalignedBar {
                    tf: tf.to_string(),
                    index: i,
                });
            }
            let ts_close = if bar.ts_close > bar.ts_open {
                bar.ts_close
            } else {
                bar.ts_open + duration
            };
            let normalized = Bar { ts_close, ..*bar };
            normalized.validate(i)?;

            store.open.push(bar.open);
            store.high.push(bar.high);
            store.low.push(bar.low);
            store.close.push(bar.close);
            store.volume.push(bar.volume);
            store.ts_open_ms.push(bar.ts_open);
            store.ts_close_ms.push(ts_close);
            store.ts_to_idx.insert(ts_close, i);
            prev_open = bar.ts_open;
        }
        Ok(store)
    }

    pub fn tf(&self) -> Timeframe {
        self.tf
    }

    pub fn len(&self) -> usize {
        self.close.len()
    }

    pub fn is_empty(&self) -> bool {
        self.close.is_empty()
    }

    pub fn bar_at(&self, i: usize) -> Result<Bar> {
        if i >= self.len() {
            return Err(PlaybackError::IndexOutOfRange {
                index: i,
                len: self.len(),
            });
        }
        Ok(Bar {
            ts_open: self.ts_open_ms[i],
            ts_close: self.ts_close_ms[i],
            open: self.open[i],
            high: self.high[i],
            low: self.low[i],
            close: self.close[i],
            volume: self.volume[i],
        })
    }

    pub fn ts_close_at(&self, i: usize) -> i64 {
        self.ts_close_ms[i]
    }

    /// O(1) exact lookup by bar close timestamp.
    pub fn index_at_ts_close(&self, ts: i64) -> Result<usize> {
        self.ts_to_idx
            .get(&ts)
            .copied()
            .ok_or(PlaybackError::TsNotFound {
                tf: self.tf.to_string(),
                ts,
            })
    }

    /// Last index whose `ts_close` is at or before `ts`; None if every bar
    /// closes after `ts`.
    pub fn index_at_or_before(&self, ts: i64) -> Option<usize> {
        match self.ts_close_ms.partition_point(|&t| t <= ts) {
            0 => None,
            p => Some(p - 1),
        }
    }

    pub fn price(&self, field: PriceField) -> &[f64] {
        match field {
            PriceField::Open => &self.open,
            PriceField::High => &self.high,
            PriceField::Low => &self.low,
            PriceField::Close => &self.close,
            PriceField::Volume => &self.volume,
        }
    }

    pub fn column(&self, key: &str) -> Option<&[f64]> {
        self.columns.get(key).map(Vec::as_slice)
    }

    pub fn structure_field(&self, feature_id: &str, field: &str) -> Option<&[f64]> {
        self.structures
            .get(&(feature_id.to_string(), field.to_string()))
            .map(Vec::as_slice)
    }

    pub fn column_keys(&self) -> impl Iterator<Item = &String> {
        self.columns.keys()
    }

    pub(crate) fn insert_column(&mut self, key: String, values: Vec<f64>) {
        debug_assert_eq!(values.len(), self.len());
        self.columns.insert(key, values);
    }

    pub(crate) fn insert_structure_field(
        &mut self,
        feature_id: String,
        field: String,
        values: Vec<f64>,
    ) {
        debug_assert_eq!(values.len(), self.len());
        self.structures.insert((feature_id, field), values);
    }
}

/// Test helper: synthesize aligned bars from a close series.
#[cfg(test)]
pub(crate) fn bars_from_closes(closes: &[f64], tf: Timeframe, start_ms: i64) -> Vec<Bar> {
    let d = tf.duration_ms();
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let ts_open = start_ms + i as i64 * d;
            let prev = if i == 0 { c } else { closes[i - 1] };
            Bar {
                ts_open,
                ts_close: ts_open + d,
                open: prev,
                high: c.max(prev) + 0.5,
                low: c.min(prev) - 0.5,
                close: c,
                volume: 100.0,
            }
        })
        .collect()
}
