//! Shared helpers for the end-to-end scenario tests: synthetic bar series
//! and timeframe aggregation.

use playback::{Bar, Timeframe};

/// Build aligned bars from a close series. Opens chain from the previous
/// close; highs/lows pad the candle body by a fixed wick.
pub fn bars_from_closes(closes: &[f64], tf: Timeframe, start_ms: i64) -> Vec<Bar> {
    let d = tf.duration_ms();
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let ts_open = start_ms + i as i64 * d;
            let prev = if i == 0 { c } else { closes[i - 1] };
            Bar {
                ts_open,
                ts_close: ts_open + d,
                open: prev,
                high: c.max(prev) + 0.5,
                low: c.min(prev) - 0.5,
                close: c,
                volume: 100.0,
            }
        })
        .collect()
}

/// Aggregate exec-resolution bars into a slower timeframe, OHLCV-style.
pub fn aggregate(bars: &[Bar], target: Timeframe) -> Vec<Bar> {
    let d = target.duration_ms();
    let mut out: Vec<Bar> = Vec::new();
    for bar in bars {
        let bucket_open = bar.ts_open.div_euclid(d) * d;
        match out.last_mut() {
            Some(last) if last.ts_open == bucket_open => {
                last.high = last.high.max(bar.high);
                last.low = last.low.min(bar.low);
                last.close = bar.close;
                last.volume += bar.volume;
            }
            _ => out.push(Bar {
                ts_open: bucket_open,
                ts_close: bucket_open + d,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
            }),
        }
    }
    // Drop a trailing bucket that is not fully covered by exec bars.
    if let (Some(last_out), Some(last_in)) = (out.last(), bars.last()) {
        if last_in.ts_close < last_out.ts_close {
            out.pop();
        }
    }
    out
}

/// Piecewise-linear close series: (length, slope) legs starting from
/// `start_price`.
pub fn trending_closes(start_price: f64, legs: &[(usize, f64)]) -> Vec<f64> {
    let mut closes = Vec::new();
    let mut price = start_price;
    for &(len, slope) in legs {
        for _ in 0..len {
            price += slope;
            closes.push(price);
        }
    }
    closes
}
