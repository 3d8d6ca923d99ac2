//! Sliding min/max over a source column, with the index of the extreme.

use super::{Detector, RollOp, SourceCol, StructCtx};

#[derive(Debug, Clone)]
pub struct RollingDetector {
    source: SourceCol,
    op: RollOp,
    length: usize,
}

impl RollingDetector {
    pub fn new(source: SourceCol, op: RollOp, length: usize) -> Self {
        Self { source, op, length }
    }
}

impl Detector for RollingDetector {
    fn fields(&self) -> Vec<String> {
        ["value", "idx"].iter().map(ToString::to_string).collect()
    }

    fn update(&mut self, ctx: &StructCtx) -> Vec<f64> {
        let i = ctx.idx;
        if i + 1 < self.length {
            return vec![f64::NAN, f64::NAN];
        }
        let src = self.source.select(ctx);
        let start = i + 1 - self.length;
        let mut best = start;
        for j in start..=i {
            let better = match self.op {
                // Ties go to the most recent bar.
                RollOp::Max => src[j] >= src[best],
                RollOp::Min => src[j] <= src[best],
            };
            if better {
                best = j;
            }
        }
        vec![src[best], best as f64]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(det: &mut RollingDetector, close: &[f64]) -> Vec<Vec<f64>> {
        let volume = vec![1.0; close.len()];
        (0..close.len())
            .map(|i| {
                det.update(&StructCtx {
                    idx: i,
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: &volume,
                })
            })
            .collect()
    }

    #[test]
    fn rolling_max_tracks_window() {
        let close = [1.0, 5.0, 3.0, 2.0, 4.0, 1.0];
        let mut det = RollingDetector::new(SourceCol::Close, RollOp::Max, 3);
        let rows = run(&mut det, &close);
        assert!(rows[1][0].is_nan());
        assert!((rows[2][0] - 5.0).abs() < 1e-12);
        assert!((rows[2][1] - 1.0).abs() < 1e-12);
        assert!((rows[4][0] - 4.0).abs() < 1e-12);
        // Window [2,4,1] at idx 5: max is 4 at idx 4.
        assert!((rows[5][0] - 4.0).abs() < 1e-12);
        assert!((rows[5][1] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn rolling_min_ties_prefer_recent() {
        let close = [3.0, 1.0, 1.0, 2.0];
        let mut det = RollingDetector::new(SourceCol::Close, RollOp::Min, 3);
        let rows = run(&mut det, &close);
        assert!((rows[2][0] - 1.0).abs() < 1e-12);
        assert!((rows[2][1] - 2.0).abs() < 1e-12); // tie resolved to idx 2
    }
}
