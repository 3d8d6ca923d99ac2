//! Vectorized indicator kernels: full input arrays in, full output arrays
//! out. Warmup bars are NaN; a NaN anywhere in a window poisons that window's
//! output. Window sums always run front-to-back so the streaming
//! implementations can reproduce them exactly.

use super::Indicator;

/// Input arrays for one computation. `primary` is the routed single-series
/// input (defaults to `close`, may be any other column per `input_source`).
pub struct SeriesInputs<'a> {
    pub open: &'a [f64],
    pub high: &'a [f64],
    pub low: &'a [f64],
    pub close: &'a [f64],
    pub volume: &'a [f64],
    pub primary: &'a [f64],
}

/// Compute one indicator. The outer Vec matches the registry's output suffix
/// list (single-output kinds return one array).
pub fn compute(ind: &Indicator, inp: &SeriesInputs) -> Vec<Vec<f64>> {
    let n = inp.close.len();
    match *ind {
        Indicator::Sma { length } => vec![roll_mean(inp.primary, length)],
        Indicator::Ema { length } => vec![ema_rec(inp.primary, length)],
        Indicator::Wma { length } => vec![wma(inp.primary, length)],
        Indicator::Rma { length } => vec![rma_rec(inp.primary, length)],
        Indicator::Dema { length } => {
            let e1 = ema_rec(inp.primary, length);
            let e2 = ema_rec(&e1, length);
            vec![zip2(&e1, &e2, |a, b| 2.0 * a - b)]
        }
        Indicator::Tema { length } => {
            let e1 = ema_rec(inp.primary, length);
            let e2 = ema_rec(&e1, length);
            let e3 = ema_rec(&e2, length);
            let mut out = nan_vec(n);
            for i in 0..n {
                out[i] = 3.0 * e1[i] - 3.0 * e2[i] + e3[i];
            }
            vec![out]
        }
        Indicator::Vwma { length } => {
            let pv: Vec<f64> = inp
                .close
                .iter()
                .zip(inp.volume)
                .map(|(p, v)| p * v)
                .collect();
            let num = roll_sum(&pv, length);
            let den = roll_sum(inp.volume, length);
            vec![zip2(&num, &den, |a, b| if b == 0.0 { f64::NAN } else { a / b })]
        }
        Indicator::Hl2 => vec![zip2(inp.high, inp.low, |h, l| f64::midpoint(h, l))],
        Indicator::Hlc3 => {
            let mut out = nan_vec(n);
            for i in 0..n {
                out[i] = (inp.high[i] + inp.low[i] + inp.close[i]) / 3.0;
            }
            vec![out]
        }
        Indicator::Ohlc4 => {
            let mut out = nan_vec(n);
            for i in 0..n {
                out[i] = (inp.open[i] + inp.high[i] + inp.low[i] + inp.close[i]) / 4.0;
            }
            vec![out]
        }
        Indicator::Rsi { length } => vec![rsi(inp.primary, length)],
        Indicator::Macd { fast, slow, signal } => {
            let (macd, sig, hist) = macd_lines(inp.primary, fast, slow, signal);
            vec![macd, sig, hist]
        }
        Indicator::Stoch { k, d, smooth } => {
            let raw = stoch_raw(inp.high, inp.low, inp.close, k);
            let k_s = roll_mean(&raw, smooth);
            let d_s = roll_mean(&k_s, d);
            vec![k_s, d_s]
        }
        Indicator::StochRsi { length, k, d } => {
            let r = rsi(inp.primary, length);
            let hh = roll_max(&r, length);
            let ll = roll_min(&r, length);
            let mut raw = nan_vec(n);
            for i in 0..n {
                if !hh[i].is_nan() && !ll[i].is_nan() {
                    let range = hh[i] - ll[i];
                    raw[i] = if range == 0.0 {
                        50.0
                    } else {
                        100.0 * (r[i] - ll[i]) / range
                    };
                }
            }
            let k_s = roll_mean(&raw, k);
            let d_s = roll_mean(&k_s, d);
            vec![k_s, d_s]
        }
        Indicator::Cci { length } => {
            let tp = typical_price(inp.high, inp.low, inp.close);
            let mean = roll_mean(&tp, length);
            let mad = roll_mad(&tp, length);
            let mut out = nan_vec(n);
            for i in 0..n {
                if !mean[i].is_nan() && !mad[i].is_nan() {
                    out[i] = if mad[i] == 0.0 {
                        0.0
                    } else {
                        (tp[i] - mean[i]) / (0.015 * mad[i])
                    };
                }
            }
            vec![out]
        }
        Indicator::Willr { length } => {
            let hh = roll_max(inp.high, length);
            let ll = roll_min(inp.low, length);
            let mut out = nan_vec(n);
            for i in 0..n {
                if !hh[i].is_nan() && !ll[i].is_nan() {
                    let range = hh[i] - ll[i];
                    out[i] = if range == 0.0 {
                        0.0
                    } else {
                        -100.0 * (hh[i] - inp.close[i]) / range
                    };
                }
            }
            vec![out]
        }
        Indicator::Roc { length } => {
            let mut out = nan_vec(n);
            for i in length..n {
                let base = inp.primary[i - length];
                if base != 0.0 {
                    out[i] = 100.0 * (inp.primary[i] - base) / base;
                }
            }
            vec![out]
        }
        Indicator::Mom { length } => {
            let mut out = nan_vec(n);
            for i in length..n {
                out[i] = inp.primary[i] - inp.primary[i - length];
            }
            vec![out]
        }
        Indicator::Ppo { fast, slow, signal } => {
            let ef = ema_rec(inp.primary, fast);
            let es = ema_rec(inp.primary, slow);
            let ppo = zip2(&ef, &es, |f, s| {
                if s == 0.0 {
                    f64::NAN
                } else {
                    100.0 * (f - s) / s
                }
            });
            let sig = ema_rec(&ppo, signal);
            let hist = zip2(&ppo, &sig, |p, s| p - s);
            vec![ppo, sig, hist]
        }
        Indicator::Trix { length } => {
            let e1 = ema_rec(inp.primary, length);
            let e2 = ema_rec(&e1, length);
            let e3 = ema_rec(&e2, length);
            let mut out = nan_vec(n);
            for i in 1..n {
                if !e3[i].is_nan() && !e3[i - 1].is_nan() && e3[i - 1] != 0.0 {
                    out[i] = 100.0 * (e3[i] - e3[i - 1]) / e3[i - 1];
                }
            }
            vec![out]
        }
        Indicator::Cmo { length } => {
            let mut out = nan_vec(n);
            for i in length..n {
                let mut up = 0.0;
                let mut down = 0.0;
                let mut poisoned = false;
                for j in (i - length + 1)..=i {
                    let d = inp.primary[j] - inp.primary[j - 1];
                    if d.is_nan() {
                        poisoned = true;
                        break;
                    }
                    if d > 0.0 {
                        up += d;
                    } else {
                        down -= d;
                    }
                }
                if !poisoned {
                    let total = up + down;
                    out[i] = if total == 0.0 {
                        0.0
                    } else {
                        100.0 * (up - down) / total
                    };
                }
            }
            vec![out]
        }
        Indicator::Dpo { length } => {
            let shift = length / 2 + 1;
            let sma = roll_mean(inp.primary, length);
            let mut out = nan_vec(n);
            for i in shift..n {
                if !sma[i - shift].is_nan() {
                    out[i] = inp.primary[i] - sma[i - shift];
                }
            }
            vec![out]
        }
        Indicator::Tr => vec![true_range(inp.high, inp.low, inp.close)],
        Indicator::Atr { length } => {
            let tr = true_range(inp.high, inp.low, inp.close);
            vec![rma_rec(&tr, length)]
        }
        Indicator::Natr { length } => {
            let tr = true_range(inp.high, inp.low, inp.close);
            let atr = rma_rec(&tr, length);
            vec![zip2(&atr, inp.close, |a, c| {
                if c == 0.0 {
                    f64::NAN
                } else {
                    100.0 * a / c
                }
            })]
        }
        Indicator::Bbands { length, mult } => {
            let middle = roll_mean(inp.primary, length);
            let sd = roll_std_pop(inp.primary, length);
            let mut upper = nan_vec(n);
            let mut lower = nan_vec(n);
            let mut bandwidth = nan_vec(n);
            let mut percent_b = nan_vec(n);
            for i in 0..n {
                if !middle[i].is_nan() && !sd[i].is_nan() {
                    upper[i] = middle[i] + mult * sd[i];
                    lower[i] = middle[i] - mult * sd[i];
                    bandwidth[i] = if middle[i] == 0.0 {
                        f64::NAN
                    } else {
                        (upper[i] - lower[i]) / middle[i]
                    };
                    let range = upper[i] - lower[i];
                    percent_b[i] = if range == 0.0 {
                        0.5
                    } else {
                        (inp.primary[i] - lower[i]) / range
                    };
                }
            }
            vec![upper, middle, lower, bandwidth, percent_b]
        }
        Indicator::Kc { length, mult } => {
            let middle = ema_rec(inp.close, length);
            let tr = true_range(inp.high, inp.low, inp.close);
            let atr = rma_rec(&tr, length);
            let upper = zip2(&middle, &atr, move |m, a| m + mult * a);
            let lower = zip2(&middle, &atr, move |m, a| m - mult * a);
            vec![upper, middle, lower]
        }
        Indicator::Donchian { length } => {
            let upper = roll_max(inp.high, length);
            let lower = roll_min(inp.low, length);
            let middle = zip2(&upper, &lower, f64::midpoint);
            vec![upper, middle, lower]
        }
        Indicator::Stddev { length } => vec![roll_std_pop(inp.primary, length)],
        Indicator::Zscore { length } => {
            let mean = roll_mean(inp.primary, length);
            let sd = roll_std_pop(inp.primary, length);
            let mut out = nan_vec(n);
            for i in 0..n {
                if !mean[i].is_nan() && !sd[i].is_nan() {
                    out[i] = if sd[i] == 0.0 {
                        0.0
                    } else {
                        (inp.primary[i] - mean[i]) / sd[i]
                    };
                }
            }
            vec![out]
        }
        Indicator::Obv => {
            let mut out = nan_vec(n);
            if n > 0 {
                out[0] = 0.0;
                for i in 1..n {
                    let step = if inp.close[i] > inp.close[i - 1] {
                        inp.volume[i]
                    } else if inp.close[i] < inp.close[i - 1] {
                        -inp.volume[i]
                    } else {
                        0.0
                    };
                    out[i] = out[i - 1] + step;
                }
            }
            vec![out]
        }
        Indicator::Mfi { length } => vec![mfi(inp.high, inp.low, inp.close, inp.volume, length)],
        Indicator::Cmf { length } => {
            let mfv = money_flow_volume(inp.high, inp.low, inp.close, inp.volume);
            let num = roll_sum(&mfv, length);
            let den = roll_sum(inp.volume, length);
            vec![zip2(&num, &den, |a, b| if b == 0.0 { 0.0 } else { a / b })]
        }
        Indicator::Adl => {
            let mfv = money_flow_volume(inp.high, inp.low, inp.close, inp.volume);
            let mut out = nan_vec(n);
            let mut acc = 0.0;
            for i in 0..n {
                acc += mfv[i];
                out[i] = acc;
            }
            vec![out]
        }
        Indicator::Vwap { length } => {
            let tp = typical_price(inp.high, inp.low, inp.close);
            let pv: Vec<f64> = tp.iter().zip(inp.volume).map(|(p, v)| p * v).collect();
            let num = roll_sum(&pv, length);
            let den = roll_sum(inp.volume, length);
            vec![zip2(&num, &den, |a, b| if b == 0.0 { f64::NAN } else { a / b })]
        }
        Indicator::Adx { length } => {
            let (adx, pdi, mdi) = adx_lines(inp.high, inp.low, inp.close, length);
            vec![adx, pdi, mdi]
        }
        Indicator::Aroon { length } => {
            let (up, down, osc) = aroon_lines(inp.high, inp.low, length);
            vec![up, down, osc]
        }
        Indicator::Supertrend { length, mult } => {
            let (line, dir) = supertrend_lines(inp.high, inp.low, inp.close, length, mult);
            vec![line, dir]
        }
        Indicator::Psar {
            af_start,
            af_step,
            af_max,
        } => {
            let (value, dir) = psar_lines(inp.high, inp.low, af_start, af_step, af_max);
            vec![value, dir]
        }
        Indicator::Linreg { length } => {
            let (endpoint, _) = linreg_lines(inp.primary, length);
            vec![endpoint]
        }
        Indicator::Slope { length } => {
            let (_, slope) = linreg_lines(inp.primary, length);
            vec![slope]
        }
        Indicator::Midprice { length } => {
            let hh = roll_max(inp.high, length);
            let ll = roll_min(inp.low, length);
            vec![zip2(&hh, &ll, f64::midpoint)]
        }
    }
}

pub fn nan_vec(n: usize) -> Vec<f64> {
    vec![f64::NAN; n]
}

fn zip2(a: &[f64], b: &[f64], f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect()
}

/// Rolling window sum, front-to-back per window. NaN if the window is
/// incomplete or contains NaN.
pub fn roll_sum(src: &[f64], len: usize) -> Vec<f64> {
    let n = src.len();
    let mut out = nan_vec(n);
    if len == 0 || len > n {
        return out;
    }
    for i in (len - 1)..n {
        let mut sum = 0.0;
        let mut poisoned = false;
        for &v in &src[(i + 1 - len)..=i] {
            if v.is_nan() {
                poisoned = true;
                break;
            }
            sum += v;
        }
        if !poisoned {
            out[i] = sum;
        }
    }
    out
}

pub fn roll_mean(src: &[f64], len: usize) -> Vec<f64> {
    let mut out = roll_sum(src, len);
    for v in &mut out {
        *v /= len as f64;
    }
    out
}

/// Population standard deviation (ddof = 0), two-pass per window.
pub fn roll_std_pop(src: &[f64], len: usize) -> Vec<f64> {
    let n = src.len();
    let mut out = nan_vec(n);
    if len == 0 || len > n {
        return out;
    }
    for i in (len - 1)..n {
        let window = &src[(i + 1 - len)..=i];
        if window.iter().any(|v| v.is_nan()) {
            continue;
        }
        let mean = window.iter().sum::<f64>() / len as f64;
        let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / len as f64;
        out[i] = var.sqrt();
    }
    out
}

pub fn roll_max(src: &[f64], len: usize) -> Vec<f64> {
    roll_extreme(src, len, f64::max)
}

pub fn roll_min(src: &[f64], len: usize) -> Vec<f64> {
    roll_extreme(src, len, f64::min)
}

fn roll_extreme(src: &[f64], len: usize, pick: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    let n = src.len();
    let mut out = nan_vec(n);
    if len == 0 || len > n {
        return out;
    }
    for i in (len - 1)..n {
        let window = &src[(i + 1 - len)..=i];
        if window.iter().any(|v| v.is_nan()) {
            continue;
        }
        out[i] = window.iter().copied().fold(window[0], &pick);
    }
    out
}

/// Mean absolute deviation about the window mean.
fn roll_mad(src: &[f64], len: usize) -> Vec<f64> {
    let n = src.len();
    let mut out = nan_vec(n);
    if len == 0 || len > n {
        return out;
    }
    for i in (len - 1)..n {
        let window = &src[(i + 1 - len)..=i];
        if window.iter().any(|v| v.is_nan()) {
            continue;
        }
        let mean = window.iter().sum::<f64>() / len as f64;
        out[i] = window.iter().map(|v| (v - mean).abs()).sum::<f64>() / len as f64;
    }
    out
}

fn wma(src: &[f64], len: usize) -> Vec<f64> {
    let n = src.len();
    let mut out = nan_vec(n);
    if len == 0 || len > n {
        return out;
    }
    let denom = (len * (len + 1)) as f64 / 2.0;
    for i in (len - 1)..n {
        let window = &src[(i + 1 - len)..=i];
        if window.iter().any(|v| v.is_nan()) {
            continue;
        }
        let mut acc = 0.0;
        for (j, &v) in window.iter().enumerate() {
            acc += v * (j + 1) as f64;
        }
        out[i] = acc / denom;
    }
    out
}

/// Recursive EMA: seeded with the SMA of the first `len` non-NaN values,
/// `k = 2 / (len + 1)` after. A NaN prefix (chained indicators) shifts the
/// seed; a NaN after the seed poisons the rest of the series.
pub fn ema_rec(src: &[f64], len: usize) -> Vec<f64> {
    recursive_ma(src, len, 2.0 / (len as f64 + 1.0))
}

/// Wilder smoothing: same seeding, `k = 1 / len`.
pub fn rma_rec(src: &[f64], len: usize) -> Vec<f64> {
    recursive_ma(src, len, 1.0 / len as f64)
}

fn recursive_ma(src: &[f64], len: usize, k: f64) -> Vec<f64> {
    let n = src.len();
    let mut out = nan_vec(n);
    if len == 0 {
        return out;
    }
    let Some(start) = src.iter().position(|v| !v.is_nan()) else {
        return out;
    };
    if start + len > n {
        return out;
    }
    let seed_window = &src[start..start + len];
    if seed_window.iter().any(|v| v.is_nan()) {
        return out;
    }
    let mut prev = seed_window.iter().sum::<f64>() / len as f64;
    out[start + len - 1] = prev;
    for i in (start + len)..n {
        prev = src[i] * k + prev * (1.0 - k);
        out[i] = prev;
    }
    out
}

pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let n = close.len();
    let mut out = nan_vec(n);
    for i in 1..n {
        let pc = close[i - 1];
        out[i] = (high[i] - low[i])
            .max((high[i] - pc).abs())
            .max((low[i] - pc).abs());
    }
    out
}

fn typical_price(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    (0..close.len())
        .map(|i| (high[i] + low[i] + close[i]) / 3.0)
        .collect()
}

fn money_flow_volume(high: &[f64], low: &[f64], close: &[f64], volume: &[f64]) -> Vec<f64> {
    (0..close.len())
        .map(|i| {
            let range = high[i] - low[i];
            if range == 0.0 {
                0.0
            } else {
                ((close[i] - low[i]) - (high[i] - close[i])) / range * volume[i]
            }
        })
        .collect()
}

fn rsi(src: &[f64], len: usize) -> Vec<f64> {
    let n = src.len();
    let mut out = nan_vec(n);
    if n < len + 1 {
        return out;
    }
    // Seed: simple means of the first `len` gains/losses, Wilder after.
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=len {
        let d = src[i] - src[i - 1];
        if d > 0.0 {
            avg_gain += d;
        } else {
            avg_loss -= d;
        }
    }
    avg_gain /= len as f64;
    avg_loss /= len as f64;
    out[len] = rsi_value(avg_gain, avg_loss);
    for i in (len + 1)..n {
        let d = src[i] - src[i - 1];
        let gain = if d > 0.0 { d } else { 0.0 };
        let loss = if d < 0.0 { -d } else { 0.0 };
        avg_gain = (avg_gain * (len as f64 - 1.0) + gain) / len as f64;
        avg_loss = (avg_loss * (len as f64 - 1.0) + loss) / len as f64;
        out[i] = rsi_value(avg_gain, avg_loss);
    }
    out
}

pub(super) fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

fn macd_lines(src: &[f64], fast: usize, slow: usize, signal: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let ef = ema_rec(src, fast);
    let es = ema_rec(src, slow);
    let macd = zip2(&ef, &es, |f, s| f - s);
    let sig = ema_rec(&macd, signal);
    let hist = zip2(&macd, &sig, |m, s| m - s);
    (macd, sig, hist)
}

fn stoch_raw(high: &[f64], low: &[f64], close: &[f64], k: usize) -> Vec<f64> {
    let hh = roll_max(high, k);
    let ll = roll_min(low, k);
    let n = close.len();
    let mut out = nan_vec(n);
    for i in 0..n {
        if !hh[i].is_nan() && !ll[i].is_nan() {
            let range = hh[i] - ll[i];
            out[i] = if range == 0.0 {
                50.0
            } else {
                100.0 * (close[i] - ll[i]) / range
            };
        }
    }
    out
}

fn mfi(high: &[f64], low: &[f64], close: &[f64], volume: &[f64], len: usize) -> Vec<f64> {
    let n = close.len();
    let tp = typical_price(high, low, close);
    let mut out = nan_vec(n);
    for i in len..n {
        let mut pos = 0.0;
        let mut neg = 0.0;
        for j in (i + 1 - len)..=i {
            let flow = tp[j] * volume[j];
            if tp[j] > tp[j - 1] {
                pos += flow;
            } else if tp[j] < tp[j - 1] {
                neg += flow;
            }
        }
        out[i] = if neg == 0.0 {
            100.0
        } else if pos == 0.0 {
            0.0
        } else {
            100.0 - 100.0 / (1.0 + pos / neg)
        };
    }
    out
}

fn adx_lines(high: &[f64], low: &[f64], close: &[f64], len: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = close.len();
    let tr = true_range(high, low, close);
    let mut dm_plus = nan_vec(n);
    let mut dm_minus = nan_vec(n);
    for i in 1..n {
        let up = high[i] - high[i - 1];
        let down = low[i - 1] - low[i];
        dm_plus[i] = if up > down && up > 0.0 { up } else { 0.0 };
        dm_minus[i] = if down > up && down > 0.0 { down } else { 0.0 };
    }
    let atr = rma_rec(&tr, len);
    let sp = rma_rec(&dm_plus, len);
    let sm = rma_rec(&dm_minus, len);
    let mut pdi = nan_vec(n);
    let mut mdi = nan_vec(n);
    let mut dx = nan_vec(n);
    for i in 0..n {
        if !atr[i].is_nan() && atr[i] != 0.0 && !sp[i].is_nan() && !sm[i].is_nan() {
            pdi[i] = 100.0 * sp[i] / atr[i];
            mdi[i] = 100.0 * sm[i] / atr[i];
            let total = pdi[i] + mdi[i];
            dx[i] = if total == 0.0 {
                0.0
            } else {
                100.0 * (pdi[i] - mdi[i]).abs() / total
            };
        }
    }
    let adx = rma_rec(&dx, len);
    (adx, pdi, mdi)
}

fn aroon_lines(high: &[f64], low: &[f64], len: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = high.len();
    let mut up = nan_vec(n);
    let mut down = nan_vec(n);
    let mut osc = nan_vec(n);
    for i in len..n {
        let window_start = i - len;
        let mut hi_idx = window_start;
        let mut lo_idx = window_start;
        for j in window_start..=i {
            if high[j] >= high[hi_idx] {
                hi_idx = j;
            }
            if low[j] <= low[lo_idx] {
                lo_idx = j;
            }
        }
        up[i] = 100.0 * (len - (i - hi_idx)) as f64 / len as f64;
        down[i] = 100.0 * (len - (i - lo_idx)) as f64 / len as f64;
        osc[i] = up[i] - down[i];
    }
    (up, down, osc)
}

fn supertrend_lines(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    len: usize,
    mult: f64,
) -> (Vec<f64>, Vec<f64>) {
    let n = close.len();
    let tr = true_range(high, low, close);
    let atr = rma_rec(&tr, len);
    let mut line = nan_vec(n);
    let mut dir = nan_vec(n);
    let Some(start) = atr.iter().position(|v| !v.is_nan()) else {
        return (line, dir);
    };

    let mut fub = f64::NAN;
    let mut flb = f64::NAN;
    let mut d = 0.0;
    for i in start..n {
        let mid = f64::midpoint(high[i], low[i]);
        let bub = mid + mult * atr[i];
        let blb = mid - mult * atr[i];
        if i == start {
            fub = bub;
            flb = blb;
            d = if close[i] >= mid { 1.0 } else { -1.0 };
        } else {
            fub = if bub < fub || close[i - 1] > fub { bub } else { fub };
            flb = if blb > flb || close[i - 1] < flb { blb } else { flb };
            d = if close[i] > fub {
                1.0
            } else if close[i] < flb {
                -1.0
            } else {
                d
            };
        }
        dir[i] = d;
        line[i] = if d > 0.0 { flb } else { fub };
    }
    (line, dir)
}

fn psar_lines(
    high: &[f64],
    low: &[f64],
    af_start: f64,
    af_step: f64,
    af_max: f64,
) -> (Vec<f64>, Vec<f64>) {
    let n = high.len();
    let mut value = nan_vec(n);
    let mut dir = nan_vec(n);
    if n < 2 {
        return (value, dir);
    }
    let mut rising = high[1] + low[1] >= high[0] + low[0];
    let mut sar = if rising { low[0] } else { high[0] };
    let mut ep = if rising { high[1] } else { low[1] };
    let mut af = af_start;

    for i in 1..n {
        if i > 1 {
            sar += af * (ep - sar);
            // SAR may not enter the prior two bars' range.
            if rising {
                sar = sar.min(low[i - 1]).min(low[i - 2]);
            } else {
                sar = sar.max(high[i - 1]).max(high[i - 2]);
            }
        }
        let reversed = if rising { low[i] < sar } else { high[i] > sar };
        if reversed {
            sar = ep;
            rising = !rising;
            ep = if rising { high[i] } else { low[i] };
            af = af_start;
        } else if rising && high[i] > ep {
            ep = high[i];
            af = (af + af_step).min(af_max);
        } else if !rising && low[i] < ep {
            ep = low[i];
            af = (af + af_step).min(af_max);
        }
        value[i] = sar;
        dir[i] = if rising { 1.0 } else { -1.0 };
    }
    (value, dir)
}

fn linreg_lines(src: &[f64], len: usize) -> (Vec<f64>, Vec<f64>) {
    let n = src.len();
    let mut endpoint = nan_vec(n);
    let mut slope_out = nan_vec(n);
    if len < 2 || len > n {
        return (endpoint, slope_out);
    }
    let len_f = len as f64;
    let sum_x = (len * (len - 1)) as f64 / 2.0;
    let sum_x2 = ((len - 1) * len * (2 * len - 1)) as f64 / 6.0;
    let denom = len_f * sum_x2 - sum_x * sum_x;
    for i in (len - 1)..n {
        let window = &src[(i + 1 - len)..=i];
        if window.iter().any(|v| v.is_nan()) {
            continue;
        }
        let mut sum_y = 0.0;
        let mut sum_xy = 0.0;
        for (j, &v) in window.iter().enumerate() {
            sum_y += v;
            sum_xy += v * j as f64;
        }
        let slope = (len_f * sum_xy - sum_x * sum_y) / denom;
        let intercept = (sum_y - slope * sum_x) / len_f;
        endpoint[i] = intercept + slope * (len_f - 1.0);
        slope_out[i] = slope;
    }
    (endpoint, slope_out)
}
