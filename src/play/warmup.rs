//! Warmup & delay preflight: the authoritative lookback/delay numbers per TF
//! role, the first evaluable exec index, and the data-coverage gate the
//! engine refuses to run without.

use crate::error::{PlaybackError, Result};
use crate::feed::ResolvedFeature;
use crate::types::{Bar, TfRole, Timeframe};

use super::Play;

/// Hard cap on declared evaluation delay, per role, in that role's bars.
pub const MAX_DELAY_BARS: usize = 1000;

/// One number per declared TF role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RoleNumbers {
    pub exec: usize,
    pub mid: Option<usize>,
    pub high: Option<usize>,
}

impl RoleNumbers {
    pub fn get(&self, role: TfRole) -> Option<usize> {
        match role {
            TfRole::Exec => Some(self.exec),
            TfRole::Mid => self.mid,
            TfRole::High => self.high,
        }
    }
}

/// The preflight output consumed by the engine and recorded in the run
/// manifest.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WarmupPlan {
    pub lookback_bars: RoleNumbers,
    pub delay_bars: RoleNumbers,
    /// First exec index at which evaluation may begin.
    pub sim_start_idx: usize,
}

/// Compute per-role lookback and delay from the resolved features and the
/// Play's declared evaluation delay.
pub fn compute_warmup_plan(play: &Play, features: &[ResolvedFeature]) -> Result<WarmupPlan> {
    let lookback_for = |role: TfRole| -> usize {
        features
            .iter()
            .filter(|f| f.role == role)
            .map(|f| f.effective_warmup)
            .max()
            .unwrap_or(0)
            .max(1)
    };
    let delay_for = |role: TfRole| -> Result<usize> {
        let delay = play
            .eval_delay_bars
            .get(&role.to_string())
            .copied()
            .unwrap_or(0);
        if delay > MAX_DELAY_BARS {
            return Err(PlaybackError::WarmupCapExceeded {
                delay,
                cap: MAX_DELAY_BARS,
            });
        }
        Ok(delay)
    };

    let lookback = RoleNumbers {
        exec: lookback_for(TfRole::Exec),
        mid: play.mid_tf.map(|_| lookback_for(TfRole::Mid)),
        high: play.high_tf.map(|_| lookback_for(TfRole::High)),
    };
    let delay = RoleNumbers {
        exec: delay_for(TfRole::Exec)?,
        mid: play.mid_tf.map(|_| delay_for(TfRole::Mid)).transpose()?,
        high: play.high_tf.map(|_| delay_for(TfRole::High)).transpose()?,
    };

    // Everything in exec bars: warmups and delays on slower roles stretch by
    // the duration ratio; multi-TF delay takes the max across roles.
    let exec_minutes = play.tf.minutes();
    let to_exec_bars = |bars: usize, tf: Timeframe| -> usize {
        let ratio = tf.minutes() / exec_minutes;
        bars * ratio as usize
    };
    let mut warmup_exec = lookback.exec;
    let mut delay_exec = delay.exec;
    if let (Some(mid), Some(lb), Some(d)) = (play.mid_tf, lookback.mid, delay.mid) {
        warmup_exec = warmup_exec.max(to_exec_bars(lb, mid));
        delay_exec = delay_exec.max(to_exec_bars(d, mid));
    }
    if let (Some(high), Some(lb), Some(d)) = (play.high_tf, lookback.high, delay.high) {
        warmup_exec = warmup_exec.max(to_exec_bars(lb, high));
        delay_exec = delay_exec.max(to_exec_bars(d, high));
    }

    let plan = WarmupPlan {
        lookback_bars: lookback,
        delay_bars: delay,
        sim_start_idx: warmup_exec + delay_exec,
    };
    tracing::info!(
        sim_start_idx = plan.sim_start_idx,
        exec_lookback = plan.lookback_bars.exec,
        "warmup preflight"
    );
    Ok(plan)
}

/// Verify that one role's bars cover `[eval_start - lookback, end]` without
/// gaps. Returns the missing ranges on failure.
pub fn verify_coverage(
    symbol: &str,
    tf: Timeframe,
    bars: &[Bar],
    lookback_bars: usize,
    eval_start_ts_ms: i64,
    end_ts_ms: i64,
) -> Result<()> {
    let duration = tf.duration_ms();
    let cover_start = align_down(eval_start_ts_ms - lookback_bars as i64 * duration, duration);
    // Open timestamp of the last bar needed: the one closing at or before
    // the end of the window.
    let cover_end = align_down(end_ts_ms - 1, duration);
    let mut missing: Vec<(i64, i64)> = Vec::new();

    if bars.is_empty() {
        missing.push((cover_start, cover_end + duration));
    } else {
        let first = bars[0].ts_open;
        let last = bars[bars.len() - 1].ts_open;
        if first > cover_start {
            missing.push((cover_start, first.min(cover_end + duration)));
        }
        // Interior gaps: consecutive bars must be one duration apart.
        for pair in bars.windows(2) {
            let expected = pair[0].ts_open + duration;
            if pair[1].ts_open > expected && expected <= cover_end && pair[1].ts_open > cover_start
            {
                missing.push((expected.max(cover_start), pair[1].ts_open.min(cover_end)));
            }
        }
        if last < cover_end {
            missing.push((last + duration, cover_end + duration));
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PlaybackError::InsufficientCoverage {
            symbol: symbol.to_string(),
            tf: tf.to_string(),
            ranges: missing,
        })
    }
}

fn align_down(ts: i64, duration: i64) -> i64 {
    ts.div_euclid(duration) * duration
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::store::bars_from_closes;
    use crate::play::validate::validate_play;
    use crate::play::tests::minimal_play_json;
    use serde_json::json;

    #[test]
    fn plan_uses_max_feature_warmup() {
        let vp = validate_play(&minimal_play_json()).unwrap();
        let plan = compute_warmup_plan(&vp.play, &vp.features).unwrap();
        // ema_21 warmup = 63 dominates ema_9's 27.
        assert_eq!(plan.lookback_bars.exec, 63);
        assert_eq!(plan.sim_start_idx, 63);
        assert_eq!(plan.delay_bars.exec, 0);
    }

    #[test]
    fn delay_extends_sim_start() {
        let mut doc = minimal_play_json();
        doc.as_object_mut()
            .unwrap()
            .insert("eval_delay_bars".into(), json!({"exec": 10}));
        let vp = validate_play(&doc).unwrap();
        let plan = compute_warmup_plan(&vp.play, &vp.features).unwrap();
        assert_eq!(plan.sim_start_idx, 73);
    }

    #[test]
    fn delay_cap_enforced() {
        let mut doc = minimal_play_json();
        doc.as_object_mut()
            .unwrap()
            .insert("eval_delay_bars".into(), json!({"exec": 5000}));
        let vp = validate_play(&doc).unwrap();
        let err = compute_warmup_plan(&vp.play, &vp.features).unwrap_err();
        assert!(matches!(err, PlaybackError::WarmupCapExceeded { .. }));
    }

    #[test]
    fn mid_warmup_stretches_to_exec_bars() {
        let mut doc = minimal_play_json();
        doc.as_object_mut()
            .unwrap()
            .insert("mid_tf".into(), json!("1h"));
        doc["features"]
            .as_array_mut()
            .unwrap()
            .push(json!({"id": "rsi_14", "type": "rsi", "params": {"length": 14}, "tf_role": "mid"}));
        let vp = validate_play(&doc).unwrap();
        let plan = compute_warmup_plan(&vp.play, &vp.features).unwrap();
        // rsi_14 needs 15 1h bars = 60 exec (15m) bars; ema_21 needs 63.
        assert_eq!(plan.lookback_bars.mid, Some(15));
        assert_eq!(plan.sim_start_idx, 63);
    }

    #[test]
    fn coverage_ok_for_contiguous_bars() {
        let closes: Vec<f64> = (0..100).map(|i| 100.0 + i as f64).collect();
        let bars = bars_from_closes(&closes, Timeframe::M15, 0);
        let eval_start = 70 * 900_000;
        let end = 99 * 900_000;
        verify_coverage("BTCUSDT", Timeframe::M15, &bars, 63, eval_start, end).unwrap();
    }

    #[test]
    fn coverage_reports_head_gap() {
        let closes: Vec<f64> = (0..50).map(|i| 100.0 + i as f64).collect();
        let mut bars = bars_from_closes(&closes, Timeframe::M15, 0);
        for bar in &mut bars {
            bar.ts_open += 20 * 900_000;
            bar.ts_close += 20 * 900_000;
        }
        let err = verify_coverage(
            "BTCUSDT",
            Timeframe::M15,
            &bars,
            30,
            30 * 900_000,
            60 * 900_000,
        )
        .unwrap_err();
        match err {
            PlaybackError::InsufficientCoverage { ranges, .. } => {
                assert_eq!(ranges[0].0, 0);
                assert_eq!(ranges[0].1, 20 * 900_000);
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn coverage_reports_interior_gap() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let mut bars = bars_from_closes(&closes, Timeframe::M15, 0);
        bars.remove(30);
        let err = verify_coverage(
            "BTCUSDT",
            Timeframe::M15,
            &bars,
            10,
            20 * 900_000,
            55 * 900_000,
        )
        .unwrap_err();
        match err {
            PlaybackError::InsufficientCoverage { ranges, .. } => {
                assert_eq!(ranges.len(), 1);
                assert_eq!(ranges[0], (30 * 900_000, 31 * 900_000));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn coverage_reports_tail_gap() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let bars = bars_from_closes(&closes, Timeframe::M15, 0);
        let err = verify_coverage(
            "BTCUSDT",
            Timeframe::M15,
            &bars,
            10,
            20 * 900_000,
            60 * 900_000,
        )
        .unwrap_err();
        assert!(matches!(err, PlaybackError::InsufficientCoverage { .. }));
    }
}
