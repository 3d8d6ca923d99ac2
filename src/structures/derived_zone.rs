//! Parallel zone slots derived from swing confirmations: every confirmed
//! swing low opens a demand band, every confirmed swing high a supply band,
//! up to `max_active` slots (oldest evicted first). Aggregate fields expose
//! the population to the rule DSL without addressing single slots.

use super::swing::{SwingDetector, SwingEvent};
use super::zone::{ZoneBand, STATE_TOUCHED};
use super::{Detector, StructCtx, ZoneKind};

#[derive(Debug, Clone)]
struct Slot {
    band: ZoneBand,
    kind: ZoneKind,
}

#[derive(Debug, Clone)]
pub struct DerivedZoneDetector {
    swing: SwingDetector,
    max_active: usize,
    max_age_bars: usize,
    slots: Vec<Slot>,
    touch_total: f64,
}

impl DerivedZoneDetector {
    pub fn new(
        swing_left: usize,
        swing_right: usize,
        max_active: usize,
        max_age_bars: usize,
    ) -> Self {
        Self {
            swing: SwingDetector::new(swing_left, swing_right),
            max_active,
            max_age_bars,
            slots: Vec::with_capacity(max_active),
            touch_total: 0.0,
        }
    }
}

impl Detector for DerivedZoneDetector {
    fn fields(&self) -> Vec<String> {
        let mut fields = Vec::with_capacity(self.max_active * 3 + 8);
        for i in 0..self.max_active {
            fields.push(format!("slot{i}_state"));
            fields.push(format!("slot{i}_upper"));
            fields.push(format!("slot{i}_lower"));
        }
        for name in [
            "active_count",
            "any_active",
            "any_touched",
            "closest_active_upper",
            "closest_active_lower",
            "closest_active_idx",
            "oldest_age",
            "touch_total",
        ] {
            fields.push(name.to_string());
        }
        fields
    }

    fn update(&mut self, ctx: &StructCtx) -> Vec<f64> {
        let event = self.swing.step(ctx);

        // Step live slots first so a new anchor is not immediately broken by
        // its own confirmation bar.
        for slot in &mut self.slots {
            let before = slot.band.touches;
            slot.band.step(ctx, slot.kind);
            self.touch_total += slot.band.touches - before;
        }
        self.slots.retain(|s| {
            s.band.is_alive() && ctx.idx.saturating_sub(s.band.anchor_idx) <= self.max_age_bars
        });

        if let Some(event) = event {
            let (pivot, kind) = match event {
                SwingEvent::Low { idx, .. } => (idx, ZoneKind::Demand),
                SwingEvent::High { idx, .. } => (idx, ZoneKind::Supply),
            };
            if self.slots.len() == self.max_active {
                self.slots.remove(0);
            }
            self.slots.push(Slot {
                band: ZoneBand::anchor(ctx, pivot, kind),
                kind,
            });
        }

        let mut out = Vec::with_capacity(self.max_active * 3 + 8);
        for i in 0..self.max_active {
            match self.slots.get(i) {
                Some(s) => {
                    out.push(s.band.state);
                    out.push(s.band.upper);
                    out.push(s.band.lower);
                }
                None => out.extend([f64::NAN, f64::NAN, f64::NAN]),
            }
        }

        let active_count = self.slots.len() as f64;
        let any_active = if self.slots.is_empty() { 0.0 } else { 1.0 };
        let any_touched = if self.slots.iter().any(|s| s.band.state == STATE_TOUCHED) {
            1.0
        } else {
            0.0
        };
        let close = ctx.close[ctx.idx];
        let closest = self.slots.iter().min_by(|a, b| {
            let da = (f64::midpoint(a.band.upper, a.band.lower) - close).abs();
            let db = (f64::midpoint(b.band.upper, b.band.lower) - close).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });
        let (cu, cl, ci) = match closest {
            Some(s) => (s.band.upper, s.band.lower, s.band.anchor_idx as f64),
            None => (f64::NAN, f64::NAN, f64::NAN),
        };
        let oldest_age = self
            .slots
            .iter()
            .map(|s| ctx.idx - s.band.anchor_idx)
            .max()
            .map_or(0.0, |a| a as f64);

        out.push(active_count);
        out.push(any_active);
        out.push(any_touched);
        out.push(cu);
        out.push(cl);
        out.push(ci);
        out.push(oldest_age);
        out.push(self.touch_total);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::super::swing::tests::run_detector;
    use super::*;

    /// Alternating tents: peaks and valleys confirm repeatedly.
    fn waves(cycles: usize) -> (Vec<f64>, Vec<f64>) {
        let mut high = Vec::new();
        for c in 0..cycles {
            let base = 100.0 + f64::from(c as u32);
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
    fn slots_populate_up_to_max_active() {
        let (high, low) = waves(4);
        let mut det = DerivedZoneDetector::new(2, 2, 2, 500);
        let n_fields = det.fields().len();
        let rows = run_detector(&mut det, &high, &low);
        for row in &rows {
            assert_eq!(row.len(), n_fields);
        }
        let last = rows.last().unwrap();
        let active_count = last[6]; // 2 slots * 3 fields, then aggregates
        assert!(active_count <= 2.0);
        assert!(active_count >= 1.0, "waves should keep zones alive");
    }

    #[test]
    fn aggregates_consistent_with_slots() {
        let (high, low) = waves(4);
        let mut det = DerivedZoneDetector::new(2, 2, 3, 500);
        let rows = run_detector(&mut det, &high, &low);
        let agg_base = 3 * 3;
        for row in &rows {
            let active_count = row[agg_base];
            let any_active = row[agg_base + 1];
            assert_eq!(any_active == 1.0, active_count > 0.0);
            if active_count > 0.0 {
                assert!(!row[agg_base + 3].is_nan(), "closest upper set when active");
                assert!(row[agg_base + 3] >= row[agg_base + 4], "upper >= lower");
            }
        }
    }

    #[test]
    fn empty_before_first_confirmation() {
        let (high, low) = waves(1);
        let mut det = DerivedZoneDetector::new(2, 2, 2, 500);
        let rows = run_detector(&mut det, &high, &low);
        assert!(rows[0][0].is_nan());
        assert!((rows[0][6] - 0.0).abs() < f64::EPSILON); // active_count
    }
}
