#![allow(
    clippy::float_cmp,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss
)]

pub mod artifacts;
pub mod dsl;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod feed;
pub mod indicators;
pub mod play;
pub mod snapshot;
pub mod structures;
pub mod types;

pub use engine::{run_backtest, RunConfig, RunData, RunOutcome, RunStatus};
pub use error::PlaybackError;
pub use play::Play;
pub use types::{Bar, Timeframe};
