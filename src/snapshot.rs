//! Point-in-time view over the per-TF feed stores. A snapshot is rebuilt
//! (as a view, no copies) once per exec bar; mid/high contexts hold the last
//! closed index of their own timeframe (forward-fill).

use crate::error::{PlaybackError, Result};
use crate::feed::{FeedStore, PriceField};
use crate::types::TfRole;

/// All feeds for one run. Exec is mandatory; mid/high optional per the Play.
pub struct FeedSet {
    pub exec: FeedStore,
    pub mid: Option<FeedStore>,
    pub high: Option<FeedStore>,
}

impl FeedSet {
    pub fn feed(&self, role: TfRole) -> Option<&FeedStore> {
        match role {
            TfRole::Exec => Some(&self.exec),
            TfRole::Mid => self.mid.as_ref(),
            TfRole::High => self.high.as_ref(),
        }
    }

    /// Build the view for one exec bar. Mid/high indices are the last bar of
    /// their TF closed at or before the exec close; a context is absent until
    /// its first close.
    pub fn snapshot_at(&self, exec_idx: usize) -> Result<Snapshot<'_>> {
        if exec_idx >= self.exec.len() {
            return Err(PlaybackError::IndexOutOfRange {
                index: exec_idx,
                len: self.exec.len(),
            });
        }
        let ts_close_ms = self.exec.ts_close_at(exec_idx);
        fn ctx(feed: Option<&FeedStore>, ts_close_ms: i64) -> Option<TfContext<'_>> {
            feed.and_then(|f| {
                f.index_at_or_before(ts_close_ms)
                    .map(|idx| TfContext {
                        feed: f,
                        current_idx: idx,
                    })
            })
        }
        Ok(Snapshot {
            exec: TfContext {
                feed: &self.exec,
                current_idx: exec_idx,
            },
            mid: ctx(self.mid.as_ref(), ts_close_ms),
            high: ctx(self.high.as_ref(), ts_close_ms),
            ts_close_ms,
        })
    }
}

/// One TF's slice of a snapshot: the feed plus the index of its last closed
/// bar at the exec timestamp.
#[derive(Clone, Copy)]
pub struct TfContext<'a> {
    pub feed: &'a FeedStore,
    pub current_idx: usize,
}

/// Canonical dotted path into a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeaturePath {
    Indicator { role: TfRole, key: String },
    Structure { role: TfRole, id: String, field: String },
    Price { role: TfRole, field: PriceField },
    Builtin(Builtin),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Close,
    LastPrice,
    TsCloseMs,
}

impl FeaturePath {
    pub fn parse(path: &str) -> Result<Self> {
        let parts: Vec<&str> = path.split('.').collect();
        let role = |s: &str| -> Result<TfRole> {
            Ok(match s {
                "exec" => TfRole::Exec,
                "mid" => TfRole::Mid,
                "high" => TfRole::High,
                _ => return Err(PlaybackError::FeatureMissing(path.to_string())),
            })
        };
        match parts.as_slice() {
            ["indicator", r, key] => Ok(Self::Indicator {
                role: role(r)?,
                key: (*key).to_string(),
            }),
            ["structure", r, id, field] => Ok(Self::Structure {
                role: role(r)?,
                id: (*id).to_string(),
                field: (*field).to_string(),
            }),
            ["price", r, field] => Ok(Self::Price {
                role: role(r)?,
                field: PriceField::parse(field)?,
            }),
            ["builtin", name] => Ok(Self::Builtin(match *name {
                "close" => Builtin::Close,
                "last_price" => Builtin::LastPrice,
                "ts_close_ms" => Builtin::TsCloseMs,
                _ => return Err(PlaybackError::FeatureMissing(path.to_string())),
            })),
            _ => Err(PlaybackError::FeatureMissing(path.to_string())),
        }
    }

    pub fn role(&self) -> TfRole {
        match self {
            Self::Indicator { role, .. }
            | Self::Structure { role, .. }
            | Self::Price { role, .. } => *role,
            Self::Builtin(_) => TfRole::Exec,
        }
    }
}

pub struct Snapshot<'a> {
    exec: TfContext<'a>,
    mid: Option<TfContext<'a>>,
    high: Option<TfContext<'a>>,
    ts_close_ms: i64,
}

impl<'a> Snapshot<'a> {
    pub fn ts_close_ms(&self) -> i64 {
        self.ts_close_ms
    }

    pub fn exec_idx(&self) -> usize {
        self.exec.current_idx
    }

    pub fn context(&self, role: TfRole) -> Option<&TfContext<'a>> {
        match role {
            TfRole::Exec => Some(&self.exec),
            TfRole::Mid => self.mid.as_ref(),
            TfRole::High => self.high.as_ref(),
        }
    }

    /// True iff the role's last closed bar is older than the most recent
    /// boundary of that TF at or before the exec close, i.e. the feed lags
    /// behind where forward-fill expects it (data gap). Absent contexts are
    /// stale by definition.
    pub fn staleness(&self, role: TfRole) -> bool {
        let Some(ctx) = self.context(role) else {
            return true;
        };
        let duration = ctx.feed.tf().duration_ms();
        let expected = self.ts_close_ms.div_euclid(duration) * duration;
        ctx.feed.ts_close_at(ctx.current_idx) < expected
    }

    /// Read a value `offset` bars back (in the addressed TF's own bars).
    /// NaN is surfaced as `FeatureMissing`; the DSL maps that to `false`.
    pub fn get(&self, path: &FeaturePath, offset: usize) -> Result<f64> {
        let value = match path {
            FeaturePath::Builtin(Builtin::TsCloseMs) => {
                if offset > 0 {
                    let idx = self.offset_idx(&self.exec, offset)?;
                    self.exec.feed.ts_close_at(idx) as f64
                } else {
                    self.ts_close_ms as f64
                }
            }
            FeaturePath::Builtin(Builtin::Close | Builtin::LastPrice) => {
                let idx = self.offset_idx(&self.exec, offset)?;
                self.exec.feed.price(PriceField::Close)[idx]
            }
            FeaturePath::Price { role, field } => {
                let ctx = self.require(*role, path)?;
                let idx = self.offset_idx(ctx, offset)?;
                ctx.feed.price(*field)[idx]
            }
            FeaturePath::Indicator { role, key } => {
                let ctx = self.require(*role, path)?;
                let idx = self.offset_idx(ctx, offset)?;
                ctx.feed
                    .column(key)
                    .ok_or_else(|| PlaybackError::FeatureMissing(key.clone()))?[idx]
            }
            FeaturePath::Structure { role, id, field } => {
                let ctx = self.require(*role, path)?;
                let idx = self.offset_idx(ctx, offset)?;
                ctx.feed
                    .structure_field(id, field)
                    .ok_or_else(|| PlaybackError::FeatureMissing(format!("{id}.{field}")))?[idx]
            }
        };
        if value.is_nan() {
            return Err(PlaybackError::FeatureMissing(format!("{path:?}")));
        }
        Ok(value)
    }

    fn require(&self, role: TfRole, path: &FeaturePath) -> Result<&TfContext<'a>> {
        self.context(role)
            .ok_or_else(|| PlaybackError::FeatureMissing(format!("{path:?}")))
    }

    fn offset_idx(&self, ctx: &TfContext<'a>, offset: usize) -> Result<usize> {
        ctx.current_idx
            .checked_sub(offset)
            .ok_or(PlaybackError::IndexOutOfRange {
                index: offset,
                len: ctx.current_idx,
            })
    }

    /// Lookahead guard: the snapshot must sit exactly on the bar being
    /// evaluated, and no context may have closed after it.
    pub fn assert_no_lookahead(&self, bar_ts_close_ms: i64) -> Result<()> {
        if self.ts_close_ms != bar_ts_close_ms {
            return Err(PlaybackError::LookaheadViolation {
                snapshot_ts: self.ts_close_ms,
                bar_ts: bar_ts_close_ms,
            });
        }
        for ctx in [Some(&self.exec), self.mid.as_ref(), self.high.as_ref()]
            .into_iter()
            .flatten()
        {
            let ts = ctx.feed.ts_close_at(ctx.current_idx);
            if ts > self.ts_close_ms {
                return Err(PlaybackError::LookaheadViolation {
                    snapshot_ts: ts,
                    bar_ts: self.ts_close_ms,
                });
            }
        }
        Ok(())
    }
}
