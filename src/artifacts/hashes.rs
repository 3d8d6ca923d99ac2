//! Canonical hashing: SHA-256 over a key-sorted JSON serialization. Any
//! reader can recompute every hash from the artifact tables alone;
//! re-running identical inputs must reproduce identical hex strings.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{EquityPoint, TradeRecord};

/// Deterministic JSON: object keys sorted recursively, arrays in order,
/// numbers as serde_json renders them.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&serde_json::to_string(leaf).expect("leaf serializes")),
    }
}

pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn hash_value(value: &Value) -> String {
    sha256_hex(&canonical_json(value))
}

/// First 12 hex chars, for display and file names.
pub fn short_hash(full: &str) -> &str {
    &full[..12.min(full.len())]
}

/// Hash of the normalized Play document.
pub fn play_hash(normalized_doc: &Value) -> String {
    hash_value(normalized_doc)
}

/// Hash of the run inputs: symbol, TF set, window, data provenance.
pub fn input_hash(
    symbol: &str,
    tfs: &[(&str, String)],
    start_ts_ms: i64,
    end_ts_ms: i64,
    provenance: &str,
) -> String {
    let tf_obj: serde_json::Map<String, Value> = tfs
        .iter()
        .map(|(role, tf)| ((*role).to_string(), Value::String(tf.clone())))
        .collect();
    hash_value(&serde_json::json!({
        "symbol": symbol,
        "tfs": tf_obj,
        "start_ts_ms": start_ts_ms,
        "end_ts_ms": end_ts_ms,
        "provenance": provenance,
    }))
}

/// Hash of the trades table, rows sorted by entry ts then side.
pub fn trades_hash(trades: &[TradeRecord]) -> String {
    let mut sorted: Vec<&TradeRecord> = trades.iter().collect();
    sorted.sort_by(|a, b| {
        a.entry_ts_ms
            .cmp(&b.entry_ts_ms)
            .then_with(|| a.side.to_string().cmp(&b.side.to_string()))
    });
    let rows: Vec<Value> = sorted
        .iter()
        .map(|t| serde_json::to_value(t).expect("trade serializes"))
        .collect();
    hash_value(&Value::Array(rows))
}

/// Hash of the equity table, rows in timestamp order.
pub fn equity_hash(equity: &[EquityPoint]) -> String {
    let rows: Vec<Value> = equity
        .iter()
        .map(|e| serde_json::to_value(e).expect("equity point serializes"))
        .collect();
    hash_value(&Value::Array(rows))
}

/// Hash over the 4-tuple of the other canonical hashes.
pub fn run_hash(play: &str, input: &str, trades: &str, equity: &str) -> String {
    hash_value(&serde_json::json!([play, input, trades, equity]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, Side};
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"z": 2, "y": 3}});
        assert_eq!(canonical_json(&a), r#"{"a":{"y":3,"z":2},"b":1}"#);
    }

    #[test]
    fn canonical_json_stable_under_key_order() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": [1, 2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": [1, 2], "x": 1}"#).unwrap();
        assert_eq!(hash_value(&a), hash_value(&b));
    }

    #[test]
    fn sha256_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            sha256_hex(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn short_hash_is_prefix() {
        let full = sha256_hex("abc");
        assert_eq!(short_hash(&full).len(), 12);
        assert!(full.starts_with(short_hash(&full)));
    }

    fn trade(entry_ts: i64, side: Side) -> TradeRecord {
        TradeRecord {
            trade_id: 1,
            symbol: "BTCUSDT".into(),
            side,
            entry_ts_ms: entry_ts,
            exit_ts_ms: entry_ts + 900_000,
            entry_price: 100.0,
            exit_price: 101.0,
            quantity: 1.0,
            notional_usdt: 100.0,
            fees_usdt: 0.1,
            pnl_usdt: 1.0,
            bars_held: 1,
            stop_hit: false,
            tp_hit: false,
            exit_reason: ExitReason::Signal,
        }
    }

    #[test]
    fn trades_hash_row_order_canonicalized() {
        let t1 = trade(1_000, Side::Long);
        let t2 = trade(2_000, Side::Short);
        let forward = trades_hash(&[t1.clone(), t2.clone()]);
        let backward = trades_hash(&[t2, t1]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn different_trades_different_hash() {
        let t1 = trade(1_000, Side::Long);
        let mut t2 = t1.clone();
        t2.pnl_usdt = 2.0;
        assert_ne!(trades_hash(&[t1]), trades_hash(&[t2]));
    }

    #[test]
    fn run_hash_depends_on_all_parts() {
        let base = run_hash("p", "i", "t", "e");
        assert_ne!(base, run_hash("p2", "i", "t", "e"));
        assert_ne!(base, run_hash("p", "i", "t2", "e"));
        assert_eq!(base, run_hash("p", "i", "t", "e"));
    }
}
