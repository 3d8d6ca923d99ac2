pub mod ast;
pub mod eval;
pub mod parse;

pub use ast::{ActionDef, CompiledRules, Cond, Operand};
pub use eval::{eval, evaluate_actions, EvalCtx};
pub use parse::{canonicalize, parse_action_blocks, parse_cond, FeatureIndex};
