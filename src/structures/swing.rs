//! Swing pivot detector. A pivot high at bar `p` is a high strictly above
//! the `left` highs before it and at or above the `right` highs after it;
//! it confirms at bar `p + right` (closed candles only, no lookahead).

use super::{Detector, StructCtx};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SwingEvent {
    High { idx: usize, level: f64 },
    Low { idx: usize, level: f64 },
}

#[derive(Debug, Clone)]
pub struct SwingDetector {
    left: usize,
    right: usize,
    high_level: f64,
    low_level: f64,
    high_idx: f64,
    low_idx: f64,
    version: f64,
    pair_high: f64,
    pair_low: f64,
    pair_version: f64,
}

impl SwingDetector {
    pub fn new(left: usize, right: usize) -> Self {
        Self {
            left,
            right,
            high_level: f64::NAN,
            low_level: f64::NAN,
            high_idx: f64::NAN,
            low_idx: f64::NAN,
            version: 0.0,
            pair_high: f64::NAN,
            pair_low: f64::NAN,
            pair_version: 0.0,
        }
    }

    /// Check the candidate pivot that becomes confirmable at `ctx.idx` and
    /// fold any confirmation into the detector state. Returns the
    /// confirmation event, if one fired. Both a high and a low can confirm
    /// on the same bar; the high event is reported (both update state).
    pub fn step(&mut self, ctx: &StructCtx) -> Option<SwingEvent> {
        let i = ctx.idx;
        if i < self.left + self.right {
            return None;
        }
        let p = i - self.right;
        let mut event = None;

        if self.is_pivot_high(ctx, p) {
            self.high_level = ctx.high[p];
            self.high_idx = p as f64;
            self.version += 1.0;
            self.refresh_pair();
            event = Some(SwingEvent::High {
                idx: p,
                level: ctx.high[p],
            });
        }
        if self.is_pivot_low(ctx, p) {
            self.low_level = ctx.low[p];
            self.low_idx = p as f64;
            self.version += 1.0;
            self.refresh_pair();
            if event.is_none() {
                event = Some(SwingEvent::Low {
                    idx: p,
                    level: ctx.low[p],
                });
            }
        }
        event
    }

    fn is_pivot_high(&self, ctx: &StructCtx, p: usize) -> bool {
        let v = ctx.high[p];
        for j in (p - self.left)..p {
            if ctx.high[j] >= v {
                return false;
            }
        }
        for j in (p + 1)..=(p + self.right) {
            if ctx.high[j] > v {
                return false;
            }
        }
        true
    }

    fn is_pivot_low(&self, ctx: &StructCtx, p: usize) -> bool {
        let v = ctx.low[p];
        for j in (p - self.left)..p {
            if ctx.low[j] <= v {
                return false;
            }
        }
        for j in (p + 1)..=(p + self.right) {
            if ctx.low[j] < v {
                return false;
            }
        }
        true
    }

    fn refresh_pair(&mut self) {
        if !self.high_level.is_nan() && !self.low_level.is_nan() {
            self.pair_high = self.high_level;
            self.pair_low = self.low_level;
            self.pair_version += 1.0;
        }
    }

    pub fn pair(&self) -> Option<(f64, f64)> {
        if self.pair_high.is_nan() {
            None
        } else {
            Some((self.pair_high, self.pair_low))
        }
    }

    fn emit(&self) -> Vec<f64> {
        vec![
            self.high_level,
            self.low_level,
            self.high_idx,
            self.low_idx,
            self.version,
            self.pair_high,
            self.pair_low,
            self.pair_version,
        ]
    }
}

impl Detector for SwingDetector {
    fn fields(&self) -> Vec<String> {
        [
            "high_level",
            "low_level",
            "high_idx",
            "low_idx",
            "version",
            "pair_high",
            "pair_low",
            "pair_version",
        ]
        .iter()
        .map(ToString::to_string)
        .collect()
    }

    fn update(&mut self, ctx: &StructCtx) -> Vec<f64> {
        self.step(ctx);
        self.emit()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Run a detector over full arrays, returning one row per bar.
    pub(crate) fn run_detector(det: &mut dyn Detector, high: &[f64], low: &[f64]) -> Vec<Vec<f64>> {
        let close: Vec<f64> = high.iter().zip(low).map(|(h, l)| f64::midpoint(*h, *l)).collect();
        let volume = vec![1.0; high.len()];
        (0..high.len())
            .map(|i| {
                det.update(&StructCtx {
                    idx: i,
                    open: &close,
                    high,
                    low,
                    close: &close,
                    volume: &volume,
                })
            })
            .collect()
    }

    /// A tent: rises to a peak at index 5, falls after.
    fn tent() -> (Vec<f64>, Vec<f64>) {
        let high = vec![10.0, 11.0, 12.0, 13.0, 14.0, 15.0, 14.0, 13.0, 12.0, 11.0, 10.0];
        let low: Vec<f64> = high.iter().map(|h| h - 1.0).collect();
        (high, low)
    }

    #[test]
    fn pivot_high_confirms_after_right_bars() {
        let (high, low) = tent();
        let mut det = SwingDetector::new(2, 2);
        let rows = run_detector(&mut det, &high, &low);
        // Peak at idx 5 confirms at idx 7.
        assert!(rows[6][0].is_nan(), "no confirmation before right bars");
        assert!((rows[7][0] - 15.0).abs() < 1e-12);
        assert!((rows[7][2] - 5.0).abs() < 1e-12); // high_idx
    }

    #[test]
    fn confirmed_level_holds_until_replaced() {
        let (high, low) = tent();
        let mut det = SwingDetector::new(2, 2);
        let rows = run_detector(&mut det, &high, &low);
        for row in rows.iter().skip(7) {
            assert!((row[0] - 15.0).abs() < 1e-12);
        }
    }

    #[test]
    fn version_is_monotonic() {
        // Two alternating tents produce multiple confirmations.
        let mut high = Vec::new();
        for cycle in 0..3 {
            for i in 0..6 {
                high.push(10.0 + f64::from(i) + f64::from(cycle));
            }
            for i in 0..6 {
                high.push(15.0 + f64::from(cycle) - f64::from(i));
            }
        }
        let low: Vec<f64> = high.iter().map(|h| h - 1.0).collect();
        let mut det = SwingDetector::new(2, 2);
        let rows = run_detector(&mut det, &high, &low);
        let mut prev = 0.0;
        for row in &rows {
            assert!(row[4] >= prev, "version must never decrease");
            prev = row[4];
        }
        assert!(prev >= 2.0, "expected at least two confirmations");
    }

    #[test]
    fn pair_set_once_both_sides_confirmed() {
        // A valley then a peak: both a swing low and a swing high confirm.
        let high = vec![15.0, 13.0, 11.0, 13.0, 15.0, 17.0, 19.0, 17.0, 15.0, 13.0, 11.0];
        let low: Vec<f64> = high.iter().map(|h| h - 1.0).collect();
        let mut det = SwingDetector::new(2, 2);
        let rows = run_detector(&mut det, &high, &low);
        let last = rows.last().unwrap();
        assert!((last[5] - 19.0).abs() < 1e-12); // pair_high
        assert!((last[6] - 10.0).abs() < 1e-12); // pair_low = low at valley idx 2
        assert!(last[7] >= 1.0);
    }

    #[test]
    fn no_lookahead_before_window() {
        let (high, low) = tent();
        let mut det = SwingDetector::new(3, 3);
        let rows = run_detector(&mut det, &high, &low);
        for row in rows.iter().take(6) {
            assert!(row[0].is_nan());
        }
    }
}
