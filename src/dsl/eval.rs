//! Pure condition evaluator. Closed-candle values only; a missing feature or
//! NaN anywhere in an operand makes the enclosing condition false, never an
//! error (warmup bars are filtered out before evaluation ever starts).

use crate::snapshot::{FeedSet, Snapshot};
use crate::types::TfRole;

use super::ast::{ActionDef, CmpOp, CompiledRules, Cond, CrossDir, Operand, WindowKind};

/// Evaluation context for one exec bar: the current snapshot plus the feed
/// set (window operators rebuild snapshots at earlier bars).
pub struct EvalCtx<'a> {
    pub feeds: &'a FeedSet,
    pub snap: &'a Snapshot<'a>,
}

pub fn eval(cond: &Cond, ctx: &EvalCtx) -> bool {
    match cond {
        Cond::Literal(b) => *b,
        Cond::Cmp { op, lhs, rhs } => match (operand_at(lhs, ctx.snap, 0), operand_at(rhs, ctx.snap, 0)) {
            (Some(l), Some(r)) => match op {
                CmpOp::Gt => l > r,
                CmpOp::Lt => l < r,
                CmpOp::Gte => l >= r,
                CmpOp::Lte => l <= r,
                CmpOp::Eq => l == r,
            },
            _ => false,
        },
        Cond::Cross { dir, lhs, rhs } => {
            let curr_l = operand_at(lhs, ctx.snap, 0);
            let curr_r = operand_at(rhs, ctx.snap, 0);
            let prev_l = operand_at(lhs, ctx.snap, 1);
            let prev_r = operand_at(rhs, ctx.snap, 1);
            match (curr_l, curr_r, prev_l, prev_r) {
                (Some(cl), Some(cr), Some(pl), Some(pr)) => match dir {
                    CrossDir::Above => cl > cr && pl <= pr,
                    CrossDir::Below => cl < cr && pl >= pr,
                },
                // First bar of availability (no offset-1 history): false.
                _ => false,
            }
        }
        Cond::Between { value, low, high } => match operand_at(value, ctx.snap, 0) {
            Some(v) => v >= *low && v <= *high,
            None => false,
        },
        Cond::NearAbs { lhs, rhs, tol } => {
            match (operand_at(lhs, ctx.snap, 0), operand_at(rhs, ctx.snap, 0)) {
                (Some(l), Some(r)) => (l - r).abs() <= *tol,
                _ => false,
            }
        }
        Cond::NearPct { lhs, rhs, tol_frac } => {
            match (operand_at(lhs, ctx.snap, 0), operand_at(rhs, ctx.snap, 0)) {
                (Some(l), Some(r)) if r != 0.0 => ((l - r) / r).abs() <= *tol_frac,
                _ => false,
            }
        }
        Cond::In { value, set } => match operand_at(value, ctx.snap, 0) {
            Some(v) => set.iter().any(|s| *s == v),
            None => false,
        },
        Cond::WindowBars {
            kind,
            bars,
            anchor,
            min_true,
            expr,
        } => eval_window_bars(ctx, *kind, *bars, *anchor, *min_true, expr),
        Cond::WindowDuration {
            kind,
            minutes,
            min_true_minutes,
            expr,
        } => eval_window_duration(ctx, *kind, *minutes, *min_true_minutes, expr),
        Cond::All(conds) => conds.iter().all(|c| eval(c, ctx)),
        Cond::Any(conds) => conds.iter().any(|c| eval(c, ctx)),
        Cond::Not(inner) => !eval(inner, ctx),
    }
}

fn operand_at(op: &Operand, snap: &Snapshot, extra_offset: usize) -> Option<f64> {
    match op {
        Operand::Number(v) => Some(*v),
        Operand::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Operand::Path { path, offset } => snap.get(path, offset + extra_offset).ok(),
    }
}

/// Evaluate `expr` at the exec bars corresponding to the last `bars` closed
/// bars of the anchor TF.
fn eval_window_bars(
    ctx: &EvalCtx,
    kind: WindowKind,
    bars: usize,
    anchor: TfRole,
    min_true: usize,
    expr: &Cond,
) -> bool {
    let Some(points) = window_exec_points(ctx, anchor, bars) else {
        return false;
    };
    if kind == WindowKind::HoldsFor && points.len() < bars {
        return false;
    }
    let mut true_count = 0usize;
    for exec_idx in &points {
        if eval_at(ctx, *exec_idx, expr) {
            true_count += 1;
            if kind == WindowKind::OccurredWithin {
                return true;
            }
        } else if kind == WindowKind::HoldsFor {
            return false;
        }
    }
    match kind {
        WindowKind::HoldsFor => true,
        WindowKind::OccurredWithin => false,
        WindowKind::CountTrue => true_count >= min_true,
    }
}

/// Exec indices at which to sample `expr` for the trailing `bars` anchor
/// bars; newest last. Returns None when the anchor context is absent.
fn window_exec_points(ctx: &EvalCtx, anchor: TfRole, bars: usize) -> Option<Vec<usize>> {
    let exec_idx = ctx.snap.exec_idx();
    if anchor == TfRole::Exec {
        let start = exec_idx.saturating_sub(bars - 1);
        return Some((start..=exec_idx).collect());
    }
    let anchor_ctx = ctx.snap.context(anchor)?;
    let anchor_cur = anchor_ctx.current_idx;
    let start = anchor_cur.saturating_sub(bars - 1);
    let mut points = Vec::with_capacity(bars);
    for ai in start..=anchor_cur {
        let ts = anchor_ctx.feed.ts_close_at(ai);
        if let Some(ei) = ctx.feeds.exec.index_at_or_before(ts) {
            points.push(ei);
        }
    }
    Some(points)
}

/// Duration windows sample the trailing window at 1-minute granularity.
/// Features only change at bar closes, so each covered exec bar contributes
/// its whole minutes (clamped at the window edge), exactly equivalent to
/// literal per-minute sampling of the step function.
fn eval_window_duration(
    ctx: &EvalCtx,
    kind: WindowKind,
    minutes: i64,
    min_true_minutes: i64,
    expr: &Cond,
) -> bool {
    let exec = &ctx.feeds.exec;
    let cur = ctx.snap.exec_idx();
    let window_ms = minutes * 60_000;
    let start_ts = ctx.snap.ts_close_ms() - window_ms;
    let tf_ms = exec.tf().duration_ms();

    let mut covered_minutes = 0i64;
    let mut true_minutes = 0i64;
    let mut all_true = true;
    let mut j = cur as i64;
    while j >= 0 {
        let idx = j as usize;
        let ts = exec.ts_close_at(idx);
        if ts <= start_ts {
            break;
        }
        let covered = (ts - start_ts).min(tf_ms) / 60_000;
        covered_minutes += covered;
        let truth = eval_at(ctx, idx, expr);
        if truth {
            true_minutes += covered;
            if kind == WindowKind::OccurredWithin {
                return true;
            }
        } else {
            all_true = false;
            if kind == WindowKind::HoldsFor {
                return false;
            }
        }
        j -= 1;
    }

    match kind {
        // Holds only if the whole window is covered by data and true.
        WindowKind::HoldsFor => all_true && covered_minutes == minutes,
        WindowKind::OccurredWithin => false,
        WindowKind::CountTrue => true_minutes >= min_true_minutes,
    }
}

/// Evaluate a sub-expression at an earlier exec bar through a temporary
/// snapshot (mid/high indices recomputed as of that bar, so no lookahead).
fn eval_at(ctx: &EvalCtx, exec_idx: usize, expr: &Cond) -> bool {
    if exec_idx == ctx.snap.exec_idx() {
        return eval(expr, ctx);
    }
    match ctx.feeds.snapshot_at(exec_idx) {
        Ok(sub) => eval(
            expr,
            &EvalCtx {
                feeds: ctx.feeds,
                snap: &sub,
            },
        ),
        Err(_) => false,
    }
}

/// Evaluate the compiled action blocks for one bar: within each block the
/// first matching case wins; blocks run in declared order.
pub fn evaluate_actions<'r>(rules: &'r CompiledRules, ctx: &EvalCtx) -> Vec<&'r ActionDef> {
    let mut emitted = Vec::new();
    for block in &rules.blocks {
        for case in &block.cases {
            if eval(&case.when, ctx) {
                emitted.extend(case.emit.iter());
                break;
            }
        }
    }
    emitted
}
