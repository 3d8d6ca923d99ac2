//! Condition tree: a closed set of node kinds evaluated against a snapshot.

use crate::snapshot::FeaturePath;
use crate::types::{PriceRef, Side, TfRole};

/// Hard cap on bar windows; anything larger is a schema error at parse time.
pub const MAX_WINDOW_BARS: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Number(f64),
    Bool(bool),
    Path { path: FeaturePath, offset: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossDir {
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    HoldsFor,
    OccurredWithin,
    CountTrue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cond {
    Literal(bool),
    Cmp {
        op: CmpOp,
        lhs: Operand,
        rhs: Operand,
    },
    Cross {
        dir: CrossDir,
        lhs: Operand,
        rhs: Operand,
    },
    Between {
        value: Operand,
        low: f64,
        high: f64,
    },
    NearAbs {
        lhs: Operand,
        rhs: Operand,
        tol: f64,
    },
    /// `tol_frac` is the tolerance already normalized from percent to a
    /// fraction, exactly once, at parse time.
    NearPct {
        lhs: Operand,
        rhs: Operand,
        tol_frac: f64,
    },
    In {
        value: Operand,
        set: Vec<f64>,
    },
    WindowBars {
        kind: WindowKind,
        bars: usize,
        anchor: TfRole,
        min_true: usize,
        expr: Box<Cond>,
    },
    WindowDuration {
        kind: WindowKind,
        minutes: i64,
        min_true_minutes: i64,
        expr: Box<Cond>,
    },
    All(Vec<Cond>),
    Any(Vec<Cond>),
    Not(Box<Cond>),
}

/// One emitted action. The validator guarantees at most one `Enter` per
/// case, so the engine can fold an emit list into a single signal.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionDef {
    Enter {
        side: Side,
        size_pct: Option<f64>,
        stop: Option<PriceRef>,
        take_profit: Option<PriceRef>,
    },
    Exit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleCase {
    pub when: Cond,
    pub emit: Vec<ActionDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionBlock {
    pub id: String,
    pub cases: Vec<RuleCase>,
}

/// The compiled strategy: ordered action blocks over a shared feature set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompiledRules {
    pub blocks: Vec<ActionBlock>,
}
