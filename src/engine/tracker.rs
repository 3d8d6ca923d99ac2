//! Record-only state tracker. Observes the per-bar signal/action/gate
//! outcome and keeps a transition log; it never feeds back into trading.
//! Disabling it must leave every trade, fill and equity point bit-identical.

use serde::Serialize;

use super::gates::GateResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalState {
    None,
    Candidate,
    Confirming,
    Confirmed,
    Consumed,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Idle,
    Actionable,
    Sizing,
    Submitted,
    Filled,
    Rejected,
    Canceled,
}

/// What actually happened on a bar, as observed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarObservation {
    /// Gates failed or the strategy stayed quiet.
    NoSignal,
    /// A signal was emitted and the order filled.
    SignalFilled,
    /// A signal was emitted but the order was rejected.
    SignalRejected { code: &'static str },
    /// A signal was emitted but the policy filtered it (direction not
    /// allowed, nothing to exit).
    SignalDropped,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockState {
    pub ts_close_ms: i64,
    pub signal: SignalState,
    pub action: ActionState,
    pub gate: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reject_code: Option<&'static str>,
}

pub struct StateTracker {
    enabled: bool,
    states: Vec<BlockState>,
    prev_signal: SignalState,
}

impl StateTracker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            states: Vec::new(),
            prev_signal: SignalState::None,
        }
    }

    pub fn on_bar_end(&mut self, ts_close_ms: i64, gate: GateResult, observation: BarObservation) {
        if !self.enabled {
            return;
        }
        let (signal, action, reject_code) = match observation {
            BarObservation::NoSignal => {
                // A candidate that never confirmed expires.
                let signal = match self.prev_signal {
                    SignalState::Candidate | SignalState::Confirming => SignalState::Expired,
                    _ => SignalState::None,
                };
                (signal, ActionState::Idle, None)
            }
            BarObservation::SignalFilled => (SignalState::Consumed, ActionState::Filled, None),
            BarObservation::SignalRejected { code } => {
                (SignalState::Confirmed, ActionState::Rejected, Some(code))
            }
            BarObservation::SignalDropped => {
                (SignalState::Confirmed, ActionState::Canceled, None)
            }
        };
        self.prev_signal = signal;
        self.states.push(BlockState {
            ts_close_ms,
            signal,
            action,
            gate: gate.code(),
            reject_code,
        });
    }

    pub fn states(&self) -> &[BlockState] {
        &self.states
    }

    /// One JSON object per line, for `events.jsonl`.
    pub fn to_jsonl(&self) -> String {
        let mut out = String::new();
        for state in &self.states {
            // BlockState serialization cannot fail: plain fields only.
            out.push_str(&serde_json::to_string(state).unwrap_or_default());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tracker_records_nothing() {
        let mut tracker = StateTracker::new(false);
        tracker.on_bar_end(900_000, GateResult::Pass, BarObservation::SignalFilled);
        assert!(tracker.states().is_empty());
        assert!(tracker.to_jsonl().is_empty());
    }

    #[test]
    fn filled_signal_is_consumed() {
        let mut tracker = StateTracker::new(true);
        tracker.on_bar_end(900_000, GateResult::Pass, BarObservation::SignalFilled);
        let state = &tracker.states()[0];
        assert_eq!(state.signal, SignalState::Consumed);
        assert_eq!(state.action, ActionState::Filled);
        assert_eq!(state.gate, "G_PASS");
    }

    #[test]
    fn rejection_recorded_with_code() {
        let mut tracker = StateTracker::new(true);
        tracker.on_bar_end(
            900_000,
            GateResult::Pass,
            BarObservation::SignalRejected {
                code: "below_min_notional",
            },
        );
        let state = &tracker.states()[0];
        assert_eq!(state.action, ActionState::Rejected);
        assert_eq!(state.reject_code, Some("below_min_notional"));
    }

    #[test]
    fn jsonl_one_line_per_bar() {
        let mut tracker = StateTracker::new(true);
        tracker.on_bar_end(900_000, GateResult::WarmupRemaining, BarObservation::NoSignal);
        tracker.on_bar_end(1_800_000, GateResult::Pass, BarObservation::SignalFilled);
        let jsonl = tracker.to_jsonl();
        assert_eq!(jsonl.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(jsonl.lines().next().unwrap()).unwrap();
        assert_eq!(first["gate"], "G_WARMUP_REMAINING");
    }
}
