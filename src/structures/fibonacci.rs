//! Fibonacci levels from the last confirmed swing pair. Retracement levels
//! are measured down from the anchor high (`high - r * range`); extension
//! levels up from the anchor low (`low + r * range`), so `1.0` lands on the
//! opposite anchor and the ratios above it project beyond.

use super::swing::SwingDetector;
use super::{Detector, FibMode, StructCtx};

pub const FIB_RATIOS: &[f64] = &[0.236, 0.382, 0.5, 0.618, 0.786, 1.0, 1.272, 1.618, 2.0];

const FIB_FIELDS: &[&str] = &[
    "level_236",
    "level_382",
    "level_500",
    "level_618",
    "level_786",
    "level_1000",
    "level_1272",
    "level_1618",
    "level_2000",
];

#[derive(Debug, Clone)]
pub struct FibDetector {
    swing: SwingDetector,
    mode: FibMode,
}

impl FibDetector {
    pub fn new(swing_left: usize, swing_right: usize, mode: FibMode) -> Self {
        Self {
            swing: SwingDetector::new(swing_left, swing_right),
            mode,
        }
    }
}

impl Detector for FibDetector {
    fn fields(&self) -> Vec<String> {
        FIB_FIELDS
            .iter()
            .map(ToString::to_string)
            .chain(["anchor_high", "anchor_low", "range"].iter().map(ToString::to_string))
            .collect()
    }

    fn update(&mut self, ctx: &StructCtx) -> Vec<f64> {
        self.swing.step(ctx);
        let mut out = Vec::with_capacity(FIB_RATIOS.len() + 3);
        match self.swing.pair() {
            None => out.resize(FIB_RATIOS.len() + 3, f64::NAN),
            Some((high, low)) => {
                let range = high - low;
                for &r in FIB_RATIOS {
                    let level = match self.mode {
                        FibMode::Retracement => high - r * range,
                        FibMode::Extension => low + r * range,
                    };
                    out.push(level);
                }
                out.push(high);
                out.push(low);
                out.push(range);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::super::swing::tests::run_detector;
    use super::*;

    /// Valley then peak so a full swing pair confirms.
    fn pair_series() -> (Vec<f64>, Vec<f64>) {
        let high = vec![15.0, 13.0, 11.0, 13.0, 15.0, 17.0, 19.0, 17.0, 15.0, 14.0, 13.0];
        let low: Vec<f64> = high.iter().map(|h| h - 1.0).collect();
        (high, low)
    }

    #[test]
    fn nan_until_pair_confirms() {
        let (high, low) = pair_series();
        let mut det = FibDetector::new(2, 2, FibMode::Retracement);
        let rows = run_detector(&mut det, &high, &low);
        assert!(rows[7][0].is_nan());
        assert!(!rows[8][0].is_nan());
    }

    #[test]
    fn retracement_levels_measured_from_high() {
        let (high, low) = pair_series();
        let mut det = FibDetector::new(2, 2, FibMode::Retracement);
        let rows = run_detector(&mut det, &high, &low);
        let last = rows.last().unwrap();
        // Pair: high 19 (idx 6), low 10 (idx 2), range 9.
        assert!((last[9] - 19.0).abs() < 1e-12); // anchor_high
        assert!((last[10] - 10.0).abs() < 1e-12); // anchor_low
        assert!((last[11] - 9.0).abs() < 1e-12); // range
        assert!((last[2] - (19.0 - 0.5 * 9.0)).abs() < 1e-12); // level_500
        assert!((last[5] - 10.0).abs() < 1e-12); // level_1000 = anchor_low
    }

    #[test]
    fn extension_levels_measured_from_low() {
        let (high, low) = pair_series();
        let mut det = FibDetector::new(2, 2, FibMode::Extension);
        let rows = run_detector(&mut det, &high, &low);
        let last = rows.last().unwrap();
        // level_1000 = low + range = high; 1.618 projects beyond.
        assert!((last[5] - 19.0).abs() < 1e-12);
        assert!((last[7] - (10.0 + 1.618 * 9.0)).abs() < 1e-12);
    }

    #[test]
    fn levels_are_dense_and_ordered() {
        let (high, low) = pair_series();
        let mut det = FibDetector::new(2, 2, FibMode::Retracement);
        let rows = run_detector(&mut det, &high, &low);
        let last = rows.last().unwrap();
        for w in last[..FIB_RATIOS.len()].windows(2) {
            assert!(w[0] >= w[1], "retracement levels descend from the high");
        }
    }
}
