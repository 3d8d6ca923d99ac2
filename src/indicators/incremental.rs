//! Streaming indicator states: one `update` per bar, no full-array
//! recomputation. Every state replicates its batch kernel operation-for-
//! operation (same window iteration order, same seeds, same recursions) so
//! the two implementations agree on the shared validity mask.

use std::collections::VecDeque;

use super::batch::rsi_value;
use super::Indicator;

/// Per-bar inputs for a streaming update. `primary` mirrors the batch
/// `SeriesInputs::primary` routing.
#[derive(Debug, Clone, Copy)]
pub struct BarInput {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub primary: f64,
}

/// Fixed-length value window. Keeps NaN so a poisoned window recovers once
/// the NaN slides out, matching the batch kernels.
#[derive(Debug, Clone)]
struct Window {
    len: usize,
    buf: VecDeque<f64>,
}

impl Window {
    fn new(len: usize) -> Self {
        Self {
            len,
            buf: VecDeque::with_capacity(len),
        }
    }

    fn push(&mut self, v: f64) {
        if self.buf.len() == self.len {
            self.buf.pop_front();
        }
        self.buf.push_back(v);
    }

    fn ready(&self) -> bool {
        self.buf.len() == self.len && !self.buf.iter().any(|v| v.is_nan())
    }

    fn sum(&self) -> f64 {
        self.buf.iter().sum()
    }

    fn mean(&self) -> f64 {
        self.sum() / self.len as f64
    }

    fn std_pop(&self) -> f64 {
        let mean = self.mean();
        let var = self.buf.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / self.len as f64;
        var.sqrt()
    }

    fn mad(&self) -> f64 {
        let mean = self.mean();
        self.buf.iter().map(|v| (v - mean).abs()).sum::<f64>() / self.len as f64
    }

    fn max(&self) -> f64 {
        let first = *self.buf.front().unwrap();
        self.buf.iter().copied().fold(first, f64::max)
    }

    fn min(&self) -> f64 {
        let first = *self.buf.front().unwrap();
        self.buf.iter().copied().fold(first, f64::min)
    }
}

/// Recursive moving average (EMA / Wilder) with batch-identical seeding: the
/// seed is the plain mean of the first `len` non-NaN values; NaN after the
/// seed window opens poisons the state for good.
#[derive(Debug, Clone)]
struct RecMa {
    len: usize,
    k: f64,
    seed: Vec<f64>,
    prev: Option<f64>,
    poisoned: bool,
}

impl RecMa {
    fn ema(len: usize) -> Self {
        Self::new(len, 2.0 / (len as f64 + 1.0))
    }

    fn rma(len: usize) -> Self {
        Self::new(len, 1.0 / len as f64)
    }

    fn new(len: usize, k: f64) -> Self {
        Self {
            len,
            k,
            seed: Vec::with_capacity(len),
            prev: None,
            poisoned: false,
        }
    }

    fn update(&mut self, v: f64) -> f64 {
        if self.poisoned {
            return f64::NAN;
        }
        if let Some(prev) = self.prev {
            if v.is_nan() {
                self.poisoned = true;
                return f64::NAN;
            }
            let next = v * self.k + prev * (1.0 - self.k);
            self.prev = Some(next);
            return next;
        }
        if v.is_nan() {
            if !self.seed.is_empty() {
                self.poisoned = true;
            }
            return f64::NAN;
        }
        self.seed.push(v);
        if self.seed.len() == self.len {
            let seeded = self.seed.iter().sum::<f64>() / self.len as f64;
            self.prev = Some(seeded);
            return seeded;
        }
        f64::NAN
    }
}

/// Streaming true range.
#[derive(Debug, Clone, Default)]
struct TrState {
    prev_close: Option<f64>,
}

impl TrState {
    fn update(&mut self, x: &BarInput) -> f64 {
        let out = match self.prev_close {
            None => f64::NAN,
            Some(pc) => (x.high - x.low)
                .max((x.high - pc).abs())
                .max((x.low - pc).abs()),
        };
        self.prev_close = Some(x.close);
        out
    }
}

#[derive(Debug, Clone)]
struct RsiState {
    len: usize,
    prev: Option<f64>,
    seen: usize,
    avg_gain: f64,
    avg_loss: f64,
}

impl RsiState {
    fn new(len: usize) -> Self {
        Self {
            len,
            prev: None,
            seen: 0,
            avg_gain: 0.0,
            avg_loss: 0.0,
        }
    }

    fn update(&mut self, v: f64) -> f64 {
        let Some(prev) = self.prev else {
            self.prev = Some(v);
            return f64::NAN;
        };
        self.prev = Some(v);
        let d = v - prev;
        let len_f = self.len as f64;
        if self.seen < self.len {
            // Seed accumulation: simple means of the first `len` deltas.
            if d > 0.0 {
                self.avg_gain += d;
            } else {
                self.avg_loss -= d;
            }
            self.seen += 1;
            if self.seen == self.len {
                self.avg_gain /= len_f;
                self.avg_loss /= len_f;
                return rsi_value(self.avg_gain, self.avg_loss);
            }
            return f64::NAN;
        }
        let gain = if d > 0.0 { d } else { 0.0 };
        let loss = if d < 0.0 { -d } else { 0.0 };
        self.avg_gain = (self.avg_gain * (len_f - 1.0) + gain) / len_f;
        self.avg_loss = (self.avg_loss * (len_f - 1.0) + loss) / len_f;
        rsi_value(self.avg_gain, self.avg_loss)
    }
}

#[derive(Debug, Clone)]
struct SupertrendState {
    mult: f64,
    atr: RecMa,
    tr: TrState,
    started: bool,
    fub: f64,
    flb: f64,
    dir: f64,
    prev_close: Option<f64>,
}

impl SupertrendState {
    fn new(len: usize, mult: f64) -> Self {
        Self {
            mult,
            atr: RecMa::rma(len),
            tr: TrState::default(),
            started: false,
            fub: f64::NAN,
            flb: f64::NAN,
            dir: 0.0,
            prev_close: None,
        }
    }

    fn update(&mut self, x: &BarInput) -> (f64, f64) {
        let tr = self.tr.update(x);
        let atr = self.atr.update(tr);
        let prev_close = self.prev_close;
        self.prev_close = Some(x.close);
        if atr.is_nan() {
            return (f64::NAN, f64::NAN);
        }
        let mid = f64::midpoint(x.high, x.low);
        let bub = mid + self.mult * atr;
        let blb = mid - self.mult * atr;
        if self.started {
            let pc = prev_close.unwrap_or(x.close);
            self.fub = if bub < self.fub || pc > self.fub { bub } else { self.fub };
            self.flb = if blb > self.flb || pc < self.flb { blb } else { self.flb };
            self.dir = if x.close > self.fub {
                1.0
            } else if x.close < self.flb {
                -1.0
            } else {
                self.dir
            };
        } else {
            self.started = true;
            self.fub = bub;
            self.flb = blb;
            self.dir = if x.close >= mid { 1.0 } else { -1.0 };
        }
        let line = if self.dir > 0.0 { self.flb } else { self.fub };
        (line, self.dir)
    }
}

/// Streaming state for one indicator instance. Constructed via
/// [`StreamState::new`]; returns `None` for kinds without an incremental
/// implementation.
#[derive(Debug, Clone)]
pub enum StreamState {
    Sma(Window),
    Ema(RecMa),
    Wma(Window),
    Rma(RecMa),
    Vwma { pv: Window, vol: Window },
    Hl2,
    Hlc3,
    Ohlc4,
    Rsi(RsiState),
    Macd { fast: RecMa, slow: RecMa, signal: RecMa },
    Cci(Window),
    Willr { high: Window, low: Window },
    Roc(Window),
    Mom(Window),
    Cmo(Window),
    Tr(TrState),
    Atr { tr: TrState, rma: RecMa },
    Natr { tr: TrState, rma: RecMa },
    Bbands { window: Window, mult: f64 },
    Donchian { high: Window, low: Window },
    Stddev(Window),
    Zscore(Window),
    Obv { acc: f64, prev_close: Option<f64> },
    Mfi { flows: Window, vols: Window, len: usize },
    Cmf { mfv: Window, vol: Window },
    Adl { acc: f64 },
    Vwap { pv: Window, vol: Window },
    Supertrend(SupertrendState),
    Midprice { high: Window, low: Window },
}

impl StreamState {
    pub fn new(ind: &Indicator) -> Option<Self> {
        if !ind.supports_incremental() {
            return None;
        }
        Some(match *ind {
            Indicator::Sma { length } => Self::Sma(Window::new(length)),
            Indicator::Ema { length } => Self::Ema(RecMa::ema(length)),
            Indicator::Wma { length } => Self::Wma(Window::new(length)),
            Indicator::Rma { length } => Self::Rma(RecMa::rma(length)),
            Indicator::Vwma { length } => Self::Vwma {
                pv: Window::new(length),
                vol: Window::new(length),
            },
            Indicator::Hl2 => Self::Hl2,
            Indicator::Hlc3 => Self::Hlc3,
            Indicator::Ohlc4 => Self::Ohlc4,
            Indicator::Rsi { length } => Self::Rsi(RsiState::new(length)),
            Indicator::Macd { fast, slow, signal } => Self::Macd {
                fast: RecMa::ema(fast),
                slow: RecMa::ema(slow),
                signal: RecMa::ema(signal),
            },
            Indicator::Cci { length } => Self::Cci(Window::new(length)),
            Indicator::Willr { length } => Self::Willr {
                high: Window::new(length),
                low: Window::new(length),
            },
            Indicator::Roc { length } => Self::Roc(Window::new(length + 1)),
            Indicator::Mom { length } => Self::Mom(Window::new(length + 1)),
            Indicator::Cmo { length } => Self::Cmo(Window::new(length + 1)),
            Indicator::Tr => Self::Tr(TrState::default()),
            Indicator::Atr { length } => Self::Atr {
                tr: TrState::default(),
                rma: RecMa::rma(length),
            },
            Indicator::Natr { length } => Self::Natr {
                tr: TrState::default(),
                rma: RecMa::rma(length),
            },
            Indicator::Bbands { length, mult } => Self::Bbands {
                window: Window::new(length),
                mult,
            },
            Indicator::Donchian { length } => Self::Donchian {
                high: Window::new(length),
                low: Window::new(length),
            },
            Indicator::Stddev { length } => Self::Stddev(Window::new(length)),
            Indicator::Zscore { length } => Self::Zscore(Window::new(length)),
            Indicator::Obv => Self::Obv {
                acc: 0.0,
                prev_close: None,
            },
            Indicator::Mfi { length } => Self::Mfi {
                flows: Window::new(length + 1),
                vols: Window::new(length + 1),
                len: length,
            },
            Indicator::Cmf { length } => Self::Cmf {
                mfv: Window::new(length),
                vol: Window::new(length),
            },
            Indicator::Adl => Self::Adl { acc: 0.0 },
            Indicator::Vwap { length } => Self::Vwap {
                pv: Window::new(length),
                vol: Window::new(length),
            },
            Indicator::Supertrend { length, mult } => {
                Self::Supertrend(SupertrendState::new(length, mult))
            }
            Indicator::Midprice { length } => Self::Midprice {
                high: Window::new(length),
                low: Window::new(length),
            },
            _ => return None,
        })
    }

    /// Advance one bar; returns one value per registry output suffix.
    pub fn update(&mut self, x: &BarInput) -> Vec<f64> {
        match self {
            Self::Sma(w) => {
                w.push(x.primary);
                vec![if w.ready() { w.mean() } else { f64::NAN }]
            }
            Self::Ema(s) | Self::Rma(s) => vec![s.update(x.primary)],
            Self::Wma(w) => {
                w.push(x.primary);
                if !w.ready() {
                    return vec![f64::NAN];
                }
                let len = w.len;
                let denom = (len * (len + 1)) as f64 / 2.0;
                let mut acc = 0.0;
                for (j, &v) in w.buf.iter().enumerate() {
                    acc += v * (j + 1) as f64;
                }
                vec![acc / denom]
            }
            Self::Vwma { pv, vol } => {
                pv.push(x.close * x.volume);
                vol.push(x.volume);
                if pv.ready() && vol.ready() {
                    let den = vol.sum();
                    vec![if den == 0.0 { f64::NAN } else { pv.sum() / den }]
                } else {
                    vec![f64::NAN]
                }
            }
            Self::Hl2 => vec![f64::midpoint(x.high, x.low)],
            Self::Hlc3 => vec![(x.high + x.low + x.close) / 3.0],
            Self::Ohlc4 => vec![(x.open + x.high + x.low + x.close) / 4.0],
            Self::Rsi(s) => vec![s.update(x.primary)],
            Self::Macd { fast, slow, signal } => {
                let f = fast.update(x.primary);
                let s = slow.update(x.primary);
                let macd = f - s;
                let sig = signal.update(macd);
                vec![macd, sig, macd - sig]
            }
            Self::Cci(w) => {
                let tp = (x.high + x.low + x.close) / 3.0;
                w.push(tp);
                if !w.ready() {
                    return vec![f64::NAN];
                }
                let mean = w.mean();
                let mad = w.mad();
                vec![if mad == 0.0 {
                    0.0
                } else {
                    (tp - mean) / (0.015 * mad)
                }]
            }
            Self::Willr { high, low } => {
                high.push(x.high);
                low.push(x.low);
                if !high.ready() || !low.ready() {
                    return vec![f64::NAN];
                }
                let hh = high.max();
                let ll = low.min();
                let range = hh - ll;
                vec![if range == 0.0 {
                    0.0
                } else {
                    -100.0 * (hh - x.close) / range
                }]
            }
            Self::Roc(w) => {
                w.push(x.primary);
                if !w.ready() {
                    return vec![f64::NAN];
                }
                let base = *w.buf.front().unwrap();
                vec![if base == 0.0 {
                    f64::NAN
                } else {
                    100.0 * (x.primary - base) / base
                }]
            }
            Self::Mom(w) => {
                w.push(x.primary);
                if !w.ready() {
                    return vec![f64::NAN];
                }
                vec![x.primary - *w.buf.front().unwrap()]
            }
            Self::Cmo(w) => {
                w.push(x.primary);
                if !w.ready() {
                    return vec![f64::NAN];
                }
                let mut up = 0.0;
                let mut down = 0.0;
                let mut prev = *w.buf.front().unwrap();
                for &v in w.buf.iter().skip(1) {
                    let d = v - prev;
                    if d > 0.0 {
                        up += d;
                    } else {
                        down -= d;
                    }
                    prev = v;
                }
                let total = up + down;
                vec![if total == 0.0 {
                    0.0
                } else {
                    100.0 * (up - down) / total
                }]
            }
            Self::Tr(s) => vec![s.update(x)],
            Self::Atr { tr, rma } => {
                let t = tr.update(x);
                vec![rma.update(t)]
            }
            Self::Natr { tr, rma } => {
                let t = tr.update(x);
                let a = rma.update(t);
                vec![if a.is_nan() || x.close == 0.0 {
                    f64::NAN
                } else {
                    100.0 * a / x.close
                }]
            }
            Self::Bbands { window, mult } => {
                window.push(x.primary);
                if !window.ready() {
                    return vec![f64::NAN; 5];
                }
                let middle = window.mean();
                let sd = window.std_pop();
                let upper = middle + *mult * sd;
                let lower = middle - *mult * sd;
                let bandwidth = if middle == 0.0 {
                    f64::NAN
                } else {
                    (upper - lower) / middle
                };
                let range = upper - lower;
                let percent_b = if range == 0.0 {
                    0.5
                } else {
                    (x.primary - lower) / range
                };
                vec![upper, middle, lower, bandwidth, percent_b]
            }
            Self::Donchian { high, low } => {
                high.push(x.high);
                low.push(x.low);
                if !high.ready() || !low.ready() {
                    return vec![f64::NAN; 3];
                }
                let upper = high.max();
                let lower = low.min();
                vec![upper, f64::midpoint(upper, lower), lower]
            }
            Self::Stddev(w) => {
                w.push(x.primary);
                vec![if w.ready() { w.std_pop() } else { f64::NAN }]
            }
            Self::Zscore(w) => {
                w.push(x.primary);
                if !w.ready() {
                    return vec![f64::NAN];
                }
                let mean = w.mean();
                let sd = w.std_pop();
                vec![if sd == 0.0 { 0.0 } else { (x.primary - mean) / sd }]
            }
            Self::Obv { acc, prev_close } => {
                let out = match *prev_close {
                    None => {
                        *prev_close = Some(x.close);
                        return vec![0.0];
                    }
                    Some(pc) => {
                        let step = if x.close > pc {
                            x.volume
                        } else if x.close < pc {
                            -x.volume
                        } else {
                            0.0
                        };
                        *acc += step;
                        *acc
                    }
                };
                *prev_close = Some(x.close);
                vec![out]
            }
            Self::Mfi { flows, vols, len } => {
                let tp = (x.high + x.low + x.close) / 3.0;
                flows.push(tp);
                vols.push(x.volume);
                if flows.buf.len() < *len + 1 {
                    return vec![f64::NAN];
                }
                let mut pos = 0.0;
                let mut neg = 0.0;
                let mut prev_tp = *flows.buf.front().unwrap();
                for (tp_j, vol_j) in flows.buf.iter().skip(1).zip(vols.buf.iter().skip(1)) {
                    let flow = tp_j * vol_j;
                    if *tp_j > prev_tp {
                        pos += flow;
                    } else if *tp_j < prev_tp {
                        neg += flow;
                    }
                    prev_tp = *tp_j;
                }
                vec![if neg == 0.0 {
                    100.0
                } else if pos == 0.0 {
                    0.0
                } else {
                    100.0 - 100.0 / (1.0 + pos / neg)
                }]
            }
            Self::Cmf { mfv, vol } => {
                let range = x.high - x.low;
                let v = if range == 0.0 {
                    0.0
                } else {
                    ((x.close - x.low) - (x.high - x.close)) / range * x.volume
                };
                mfv.push(v);
                vol.push(x.volume);
                if mfv.ready() && vol.ready() {
                    let den = vol.sum();
                    vec![if den == 0.0 { 0.0 } else { mfv.sum() / den }]
                } else {
                    vec![f64::NAN]
                }
            }
            Self::Adl { acc } => {
                let range = x.high - x.low;
                let v = if range == 0.0 {
                    0.0
                } else {
                    ((x.close - x.low) - (x.high - x.close)) / range * x.volume
                };
                *acc += v;
                vec![*acc]
            }
            Self::Vwap { pv, vol } => {
                let tp = (x.high + x.low + x.close) / 3.0;
                pv.push(tp * x.volume);
                vol.push(x.volume);
                if pv.ready() && vol.ready() {
                    let den = vol.sum();
                    vec![if den == 0.0 { f64::NAN } else { pv.sum() / den }]
                } else {
                    vec![f64::NAN]
                }
            }
            Self::Supertrend(s) => {
                let (line, dir) = s.update(x);
                vec![line, dir]
            }
            Self::Midprice { high, low } => {
                high.push(x.high);
                low.push(x.low);
                if high.ready() && low.ready() {
                    vec![f64::midpoint(high.max(), low.min())]
                } else {
                    vec![f64::NAN]
                }
            }
        }
    }
}
