//! Demand/supply zone detector. A demand zone anchors at a confirmed swing
//! low (band between the pivot bar's low and its body), a supply zone at a
//! confirmed swing high. State walks active -> touched -> broken; an aged-out
//! zone clears until the next anchor.

use super::swing::{SwingDetector, SwingEvent};
use super::{Detector, StructCtx, ZoneKind};

pub const STATE_ACTIVE: f64 = 0.0;
pub const STATE_TOUCHED: f64 = 1.0;
pub const STATE_BROKEN: f64 = 2.0;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ZoneBand {
    pub upper: f64,
    pub lower: f64,
    pub anchor_idx: usize,
    pub state: f64,
    pub touches: f64,
}

impl ZoneBand {
    /// Band for a confirmed pivot bar. Demand spans low..body-low, supply
    /// spans body-high..high.
    pub(crate) fn anchor(ctx: &StructCtx, pivot: usize, kind: ZoneKind) -> Self {
        let body_low = ctx.open[pivot].min(ctx.close[pivot]);
        let body_high = ctx.open[pivot].max(ctx.close[pivot]);
        let (upper, lower) = match kind {
            ZoneKind::Demand => (body_low, ctx.low[pivot]),
            ZoneKind::Supply => (ctx.high[pivot], body_high),
        };
        Self {
            upper,
            lower,
            anchor_idx: pivot,
            state: STATE_ACTIVE,
            touches: 0.0,
        }
    }

    /// Walk the state machine for one bar. Break beats touch when both
    /// happen on the same bar.
    pub(crate) fn step(&mut self, ctx: &StructCtx, kind: ZoneKind) {
        if self.state == STATE_BROKEN {
            return;
        }
        let i = ctx.idx;
        let broken = match kind {
            ZoneKind::Demand => ctx.close[i] < self.lower,
            ZoneKind::Supply => ctx.close[i] > self.upper,
        };
        if broken {
            self.state = STATE_BROKEN;
            return;
        }
        let touched = ctx.low[i] <= self.upper && ctx.high[i] >= self.lower;
        if touched {
            self.touches += 1.0;
            self.state = STATE_TOUCHED;
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.state != STATE_BROKEN
    }
}

#[derive(Debug, Clone)]
pub struct ZoneDetector {
    swing: SwingDetector,
    kind: ZoneKind,
    max_age_bars: usize,
    zone: Option<ZoneBand>,
    version: f64,
}

impl ZoneDetector {
    pub fn new(swing_left: usize, swing_right: usize, kind: ZoneKind, max_age_bars: usize) -> Self {
        Self {
            swing: SwingDetector::new(swing_left, swing_right),
            kind,
            max_age_bars,
            zone: None,
            version: 0.0,
        }
    }
}

impl Detector for ZoneDetector {
    fn fields(&self) -> Vec<String> {
        ["state", "upper", "lower", "anchor_idx", "version"]
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    fn update(&mut self, ctx: &StructCtx) -> Vec<f64> {
        let event = self.swing.step(ctx);
        let anchor = match (self.kind, event) {
            (ZoneKind::Demand, Some(SwingEvent::Low { idx, .. }))
            | (ZoneKind::Supply, Some(SwingEvent::High { idx, .. })) => Some(idx),
            _ => None,
        };
        if let Some(pivot) = anchor {
            self.zone = Some(ZoneBand::anchor(ctx, pivot, self.kind));
            self.version += 1.0;
        } else if let Some(zone) = &mut self.zone {
            zone.step(ctx, self.kind);
            if ctx.idx.saturating_sub(zone.anchor_idx) > self.max_age_bars {
                self.zone = None;
            }
        }
        match &self.zone {
            None => vec![f64::NAN, f64::NAN, f64::NAN, f64::NAN, self.version],
            Some(z) => vec![
                z.state,
                z.upper,
                z.lower,
                z.anchor_idx as f64,
                self.version,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_at<'a>(
        idx: usize,
        open: &'a [f64],
        high: &'a [f64],
        low: &'a [f64],
        close: &'a [f64],
        volume: &'a [f64],
    ) -> StructCtx<'a> {
        StructCtx {
            idx,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Valley at idx 3, then rally, then a dip back into the valley's range,
    /// then a hard break below it.
    fn demand_scenario() -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
        let close = vec![
            14.0, 12.0, 10.5, 10.2, 11.5, 13.0, 14.5, 15.0, // valley then rally
            11.0, // dip into zone (low reaches 10.4)
            14.0, 14.5, // recover
            9.0,  // hard break below the zone
            9.5,
        ];
        let open: Vec<f64> = {
            let mut v = vec![close[0]];
            v.extend(close.iter().take(close.len() - 1).copied());
            v
        };
        let high: Vec<f64> = close.iter().zip(&open).map(|(c, o)| c.max(*o) + 0.3).collect();
        let mut low: Vec<f64> = close.iter().zip(&open).map(|(c, o)| c.min(*o) - 0.3).collect();
        low[8] = 10.1; // the dip touches the band (band is 9.9..10.2)
        (open, high, low, close)
    }

    #[test]
    fn demand_zone_lifecycle() {
        let (open, high, low, close) = demand_scenario();
        let volume = vec![1.0; close.len()];
        let mut det = ZoneDetector::new(2, 2, ZoneKind::Demand, 500);

        let mut rows = Vec::new();
        for i in 0..close.len() {
            rows.push(det.update(&ctx_at(i, &open, &high, &low, &close, &volume)));
        }

        // Pivot low at idx 3 confirms at idx 5: zone appears active.
        assert!(rows[4][0].is_nan());
        assert!((rows[5][0] - STATE_ACTIVE).abs() < f64::EPSILON);
        assert!((rows[5][3] - 3.0).abs() < f64::EPSILON); // anchor_idx

        // The dip at idx 8 touches the band.
        assert!((rows[8][0] - STATE_TOUCHED).abs() < f64::EPSILON);

        // The close below the band at idx 11 breaks it.
        assert!((rows[11][0] - STATE_BROKEN).abs() < f64::EPSILON);
    }

    #[test]
    fn zone_band_orientation() {
        let (open, high, low, close) = demand_scenario();
        let volume = vec![1.0; close.len()];
        let mut det = ZoneDetector::new(2, 2, ZoneKind::Demand, 500);
        let mut last = Vec::new();
        for i in 0..=5 {
            last = det.update(&ctx_at(i, &open, &high, &low, &close, &volume));
        }
        assert!(last[1] >= last[2], "upper must be >= lower");
    }

    #[test]
    fn zone_expires_after_max_age() {
        let (open, high, low, close) = demand_scenario();
        let volume = vec![1.0; close.len()];
        let mut det = ZoneDetector::new(2, 2, ZoneKind::Demand, 2);
        let mut rows = Vec::new();
        for i in 0..close.len() {
            rows.push(det.update(&ctx_at(i, &open, &high, &low, &close, &volume)));
        }
        // Zone confirmed at idx 5 (anchor 3, age 2); aged out past idx 5.
        assert!(!rows[5][0].is_nan());
        assert!(rows[6][0].is_nan());
    }

    #[test]
    fn supply_zone_breaks_upward() {
        // Peak at idx 3, confirm at 5, then close above the peak's high.
        let close = vec![10.0, 12.0, 14.0, 15.0, 13.0, 12.0, 16.5, 17.0];
        let open: Vec<f64> = {
            let mut v = vec![close[0]];
            v.extend(close.iter().take(close.len() - 1).copied());
            v
        };
        let high: Vec<f64> = close.iter().zip(&open).map(|(c, o)| c.max(*o) + 0.3).collect();
        let low: Vec<f64> = close.iter().zip(&open).map(|(c, o)| c.min(*o) - 0.3).collect();
        let volume = vec![1.0; close.len()];
        let mut det = ZoneDetector::new(2, 2, ZoneKind::Supply, 500);
        let mut rows = Vec::new();
        for i in 0..close.len() {
            rows.push(det.update(&ctx_at(i, &open, &high, &low, &close, &volume)));
        }
        assert!((rows[5][0] - STATE_ACTIVE).abs() < f64::EPSILON);
        assert!((rows[6][0] - STATE_BROKEN).abs() < f64::EPSILON);
    }
}
