//! End-of-run artifact emission: trades/equity tables (parquet), the result
//! and manifest JSON documents, optional state-tracker events, and the
//! canonical hash set.

pub mod hashes;
pub mod metrics;

use std::path::Path;

use anyhow::{Context, Result};
use polars::prelude::*;
use serde::Serialize;
use serde_json::Value;

use crate::play::warmup::RoleNumbers;
use crate::types::{EquityPoint, TradeRecord};

pub use hashes::{canonical_json, short_hash};
pub use metrics::{compute_metrics, Metrics};

/// Column name of the equity table timestamp, recorded in the manifest.
pub const EQUITY_TS_COL: &str = "ts_ms";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TfRoles {
    pub exec: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high: Option<String>,
}

/// Render an epoch-ms timestamp as UTC for the manifest's human-readable
/// companions to the canonical `*_ts_ms` columns.
pub fn iso_utc(ts_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map_or_else(|| "invalid".to_string(), |dt| dt.to_rfc3339())
}

#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub play_id: String,
    pub play_version: u32,
    pub symbol: String,
    pub tf_roles: TfRoles,
    pub start_ts_ms: i64,
    pub end_ts_ms: i64,
    pub eval_start_ts_ms: i64,
    pub eval_start_utc: String,
    pub lookback_bars: RoleNumbers,
    pub delay_bars: RoleNumbers,
    pub play_hash: String,
    pub input_hash: String,
    pub equity_timestamp_column: &'static str,
    pub stop_reason: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunHashes {
    pub play_hash: String,
    pub play_hash_short: String,
    pub input_hash: String,
    pub trades_hash: String,
    pub equity_hash: String,
    pub run_hash: String,
}

impl RunHashes {
    pub fn build(play_hash: String, input_hash: String, trades: &[TradeRecord], equity: &[EquityPoint]) -> Self {
        let trades_hash = hashes::trades_hash(trades);
        let equity_hash = hashes::equity_hash(equity);
        let run_hash = hashes::run_hash(&play_hash, &input_hash, &trades_hash, &equity_hash);
        let play_hash_short = short_hash(&play_hash).to_string();
        Self {
            play_hash,
            play_hash_short,
            input_hash,
            trades_hash,
            equity_hash,
            run_hash,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub trades: Vec<TradeRecord>,
    pub equity: Vec<EquityPoint>,
    pub metrics: Metrics,
    pub manifest: RunManifest,
    pub hashes: RunHashes,
    pub events_jsonl: Option<String>,
}

impl RunArtifacts {
    pub fn trades_frame(&self) -> Result<DataFrame> {
        let t = &self.trades;
        let df = df! {
            "trade_id" => t.iter().map(|x| x.trade_id as u64).collect::<Vec<_>>(),
            "symbol" => t.iter().map(|x| x.symbol.clone()).collect::<Vec<_>>(),
            "side" => t.iter().map(|x| x.side.to_string()).collect::<Vec<_>>(),
            "entry_ts_ms" => t.iter().map(|x| x.entry_ts_ms).collect::<Vec<_>>(),
            "exit_ts_ms" => t.iter().map(|x| x.exit_ts_ms).collect::<Vec<_>>(),
            "entry_price" => t.iter().map(|x| x.entry_price).collect::<Vec<_>>(),
            "exit_price" => t.iter().map(|x| x.exit_price).collect::<Vec<_>>(),
            "quantity" => t.iter().map(|x| x.quantity).collect::<Vec<_>>(),
            "notional_usdt" => t.iter().map(|x| x.notional_usdt).collect::<Vec<_>>(),
            "fees_usdt" => t.iter().map(|x| x.fees_usdt).collect::<Vec<_>>(),
            "pnl_usdt" => t.iter().map(|x| x.pnl_usdt).collect::<Vec<_>>(),
            "bars_held" => t.iter().map(|x| x.bars_held as u64).collect::<Vec<_>>(),
            "stop_hit" => t.iter().map(|x| x.stop_hit).collect::<Vec<_>>(),
            "tp_hit" => t.iter().map(|x| x.tp_hit).collect::<Vec<_>>(),
            "exit_reason" => t.iter().map(|x| x.exit_reason.as_str().to_string()).collect::<Vec<_>>(),
        }?;
        Ok(df)
    }

    pub fn equity_frame(&self) -> Result<DataFrame> {
        let e = &self.equity;
        let df = df! {
            EQUITY_TS_COL => e.iter().map(|x| x.ts_close_ms).collect::<Vec<_>>(),
            "equity_usdt" => e.iter().map(|x| x.equity_usdt).collect::<Vec<_>>(),
            "cash_usdt" => e.iter().map(|x| x.cash_usdt).collect::<Vec<_>>(),
            "unrealized_pnl_usdt" => e.iter().map(|x| x.unrealized_pnl_usdt).collect::<Vec<_>>(),
            "drawdown_pct" => e.iter().map(|x| x.drawdown_pct).collect::<Vec<_>>(),
        }?;
        Ok(df)
    }

    /// `result.json`: status, metrics and hashes, recomputable by a reader.
    pub fn result_json(&self) -> Value {
        serde_json::json!({
            "overall_status": "ok",
            "stop_reason": self.manifest.stop_reason,
            "trade_count": self.trades.len(),
            "metrics": serde_json::to_value(&self.metrics).expect("metrics serialize"),
            "hashes": serde_json::to_value(&self.hashes).expect("hashes serialize"),
        })
    }

    /// Write the artifact set into a directory: `trades.parquet`,
    /// `equity.parquet`, `result.json`, `run_manifest.json` and optionally
    /// `events.jsonl`.
    pub fn write_to_dir(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create artifact dir {}", dir.display()))?;

        let mut trades_df = self.trades_frame()?;
        write_parquet(&dir.join("trades.parquet"), &mut trades_df)?;
        let mut equity_df = self.equity_frame()?;
        write_parquet(&dir.join("equity.parquet"), &mut equity_df)?;

        std::fs::write(
            dir.join("result.json"),
            canonical_json(&self.result_json()),
        )
        .context("failed to write result.json")?;
        let manifest_value =
            serde_json::to_value(&self.manifest).context("manifest serialization")?;
        std::fs::write(
            dir.join("run_manifest.json"),
            canonical_json(&manifest_value),
        )
        .context("failed to write run_manifest.json")?;

        if let Some(events) = &self.events_jsonl {
            std::fs::write(dir.join("events.jsonl"), events)
                .context("failed to write events.jsonl")?;
        }
        tracing::info!(dir = %dir.display(), trades = self.trades.len(), "artifacts written");
        Ok(())
    }
}

fn write_parquet(path: &Path, df: &mut DataFrame) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    ParquetWriter::new(file)
        .finish(df)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, Side, Timeframe};

    fn sample_artifacts() -> RunArtifacts {
        let trades = vec![TradeRecord {
            trade_id: 1,
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_ts_ms: 900_000,
            exit_ts_ms: 2_700_000,
            entry_price: 100.0,
            exit_price: 103.0,
            quantity: 2.0,
            notional_usdt: 200.0,
            fees_usdt: 0.22,
            pnl_usdt: 6.0,
            bars_held: 2,
            stop_hit: false,
            tp_hit: false,
            exit_reason: ExitReason::Signal,
        }];
        let equity = vec![
            EquityPoint {
                ts_close_ms: 900_000,
                equity_usdt: 10_000.0,
                cash_usdt: 10_000.0,
                unrealized_pnl_usdt: 0.0,
                drawdown_pct: 0.0,
            },
            EquityPoint {
                ts_close_ms: 1_800_000,
                equity_usdt: 10_003.0,
                cash_usdt: 10_000.0,
                unrealized_pnl_usdt: 3.0,
                drawdown_pct: 0.0,
            },
        ];
        let metrics = compute_metrics(&equity, &trades, 10_000.0, Timeframe::M15);
        let play_hash = hashes::sha256_hex("play");
        let input_hash = hashes::sha256_hex("input");
        let hashes = RunHashes::build(play_hash.clone(), input_hash.clone(), &trades, &equity);
        RunArtifacts {
            trades,
            equity,
            metrics,
            manifest: RunManifest {
                play_id: "p1".into(),
                play_version: 1,
                symbol: "BTCUSDT".into(),
                tf_roles: TfRoles {
                    exec: "15m".into(),
                    mid: None,
                    high: None,
                },
                start_ts_ms: 0,
                end_ts_ms: 2_700_000,
                eval_start_ts_ms: 900_000,
                eval_start_utc: iso_utc(900_000),
                lookback_bars: RoleNumbers {
                    exec: 63,
                    mid: None,
                    high: None,
                },
                delay_bars: RoleNumbers {
                    exec: 0,
                    mid: None,
                    high: None,
                },
                play_hash,
                input_hash,
                equity_timestamp_column: EQUITY_TS_COL,
                stop_reason: "completed".into(),
            },
            hashes,
            events_jsonl: None,
        }
    }

    #[test]
    fn frames_have_expected_shape() {
        let artifacts = sample_artifacts();
        let trades = artifacts.trades_frame().unwrap();
        assert_eq!(trades.height(), 1);
        assert!(trades.schema().contains("pnl_usdt"));
        let equity = artifacts.equity_frame().unwrap();
        assert_eq!(equity.height(), 2);
        assert!(equity.schema().contains(EQUITY_TS_COL));
    }

    #[test]
    fn result_json_carries_hashes() {
        let artifacts = sample_artifacts();
        let result = artifacts.result_json();
        assert_eq!(result["overall_status"], "ok");
        assert_eq!(
            result["hashes"]["run_hash"],
            serde_json::json!(artifacts.hashes.run_hash)
        );
    }

    #[test]
    fn hashes_recomputable_from_tables() {
        // R2: a reader recomputes the same hashes from the artifact rows.
        let artifacts = sample_artifacts();
        let recomputed = RunHashes::build(
            artifacts.manifest.play_hash.clone(),
            artifacts.manifest.input_hash.clone(),
            &artifacts.trades,
            &artifacts.equity,
        );
        assert_eq!(recomputed, artifacts.hashes);
    }

    #[test]
    fn write_to_dir_produces_files() {
        let artifacts = sample_artifacts();
        let dir = tempfile::tempdir().unwrap();
        artifacts.write_to_dir(dir.path()).unwrap();
        for name in [
            "trades.parquet",
            "equity.parquet",
            "result.json",
            "run_manifest.json",
        ] {
            assert!(dir.path().join(name).exists(), "missing {name}");
        }
        assert!(!dir.path().join("events.jsonl").exists());

        let result: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("result.json")).unwrap())
                .unwrap();
        assert_eq!(result["overall_status"], "ok");
        let manifest: Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("run_manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest["equity_timestamp_column"], "ts_ms");
    }

    #[test]
    fn events_written_when_present() {
        let mut artifacts = sample_artifacts();
        artifacts.events_jsonl = Some("{\"gate\":\"G_PASS\"}\n".to_string());
        let dir = tempfile::tempdir().unwrap();
        artifacts.write_to_dir(dir.path()).unwrap();
        assert!(dir.path().join("events.jsonl").exists());
    }
}
