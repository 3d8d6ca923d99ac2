//! Trend detector derived from swing confirmations: higher highs plus
//! higher lows make an uptrend, lower highs plus lower lows a downtrend,
//! anything mixed is neutral.

use super::swing::{SwingDetector, SwingEvent};
use super::{Detector, StructCtx};

#[derive(Debug, Clone)]
pub struct TrendDetector {
    swing: SwingDetector,
    last_highs: [f64; 2],
    last_lows: [f64; 2],
    direction: f64,
    bars_in_trend: f64,
    version: f64,
}

impl TrendDetector {
    pub fn new(swing_left: usize, swing_right: usize) -> Self {
        Self {
            swing: SwingDetector::new(swing_left, swing_right),
            last_highs: [f64::NAN; 2],
            last_lows: [f64::NAN; 2],
            direction: 0.0,
            bars_in_trend: 0.0,
            version: 0.0,
        }
    }

    fn classify(&self) -> f64 {
        let [ph, h] = self.last_highs;
        let [pl, l] = self.last_lows;
        if ph.is_nan() || pl.is_nan() {
            return 0.0;
        }
        if h > ph && l > pl {
            1.0
        } else if h < ph && l < pl {
            -1.0
        } else {
            0.0
        }
    }

    fn strength(&self) -> f64 {
        match self.swing.pair() {
            Some((high, low)) if low > 0.0 => (high - low).abs() / low,
            _ => 0.0,
        }
    }
}

impl Detector for TrendDetector {
    fn fields(&self) -> Vec<String> {
        ["direction", "strength", "bars_in_trend", "version"]
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    fn update(&mut self, ctx: &StructCtx) -> Vec<f64> {
        let event = self.swing.step(ctx);
        match event {
            Some(SwingEvent::High { level, .. }) => {
                self.last_highs = [self.last_highs[1], level];
            }
            Some(SwingEvent::Low { level, .. }) => {
                self.last_lows = [self.last_lows[1], level];
            }
            None => {}
        }
        if event.is_some() {
            let next = self.classify();
            if next != self.direction {
                self.direction = next;
                self.bars_in_trend = 0.0;
                self.version += 1.0;
            }
        }
        self.bars_in_trend += 1.0;
        vec![
            self.direction,
            self.strength(),
            self.bars_in_trend,
            self.version,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::super::swing::tests::run_detector;
    use super::*;

    /// Rising staircase of tents: each peak and valley higher than the last.
    fn staircase_up(cycles: usize) -> (Vec<f64>, Vec<f64>) {
        let mut high = Vec::new();
        for c in 0..cycles {
            let base = 10.0 + 3.0 * c as f64;
            for i in 0..5 {
                high.push(base + f64::from(i));
            }
            for i in 0..5 {
                high.push(base + 4.0 - f64::from(i));
            }
        }
        let low: Vec<f64> = high.iter().map(|h| h - 1.0).collect();
        (high, low)
    }

    #[test]
    fn higher_highs_and_lows_make_uptrend() {
        let (high, low) = staircase_up(4);
        let mut det = TrendDetector::new(2, 2);
        let rows = run_detector(&mut det, &high, &low);
        let last = rows.last().unwrap();
        assert!((last[0] - 1.0).abs() < f64::EPSILON, "direction should be 1");
        assert!(last[1] > 0.0, "strength positive once a pair exists");
    }

    #[test]
    fn downtrend_detected() {
        let (mut high, _) = staircase_up(4);
        high.reverse();
        let low: Vec<f64> = high.iter().map(|h| h - 1.0).collect();
        let mut det = TrendDetector::new(2, 2);
        let rows = run_detector(&mut det, &high, &low);
        let last = rows.last().unwrap();
        assert!((last[0] + 1.0) < f64::EPSILON + 1e-9, "direction should be -1");
    }

    #[test]
    fn neutral_before_two_pairs() {
        let (high, low) = staircase_up(1);
        let mut det = TrendDetector::new(2, 2);
        let rows = run_detector(&mut det, &high, &low);
        for row in &rows {
            assert!((row[0] - 0.0).abs() < f64::EPSILON || row[0].abs() <= 1.0);
        }
        // With a single cycle there can be at most one high and one low.
        assert!((rows.last().unwrap()[0]).abs() < f64::EPSILON);
    }

    #[test]
    fn bars_in_trend_counts_up() {
        let (high, low) = staircase_up(4);
        let mut det = TrendDetector::new(2, 2);
        let rows = run_detector(&mut det, &high, &low);
        let mut prev = 0.0;
        let mut saw_reset = false;
        for row in &rows {
            if row[2] < prev {
                saw_reset = true;
            }
            prev = row[2];
        }
        // Direction flips from 0 to 1 at some point, resetting the counter.
        assert!(saw_reset);
    }
}
