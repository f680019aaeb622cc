//! Context-dependent TTL policies for the sync ledger.
//!
//! A policy decides how long after a successful sync the next one is due. It is a pure function
//! of wall-clock time and entity state; it never looks at the data itself.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};

use crate::{
    config::{ConfigValidationError, TtlPresets},
    store::EntityKey,
};

/// Entity state a policy may consult.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncContext {
    pub now: DateTime<Utc>,
    pub item_count: u64,
    pub latest_cursor: Option<String>,
}

impl SyncContext {
    #[must_use]
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now, item_count: 0, latest_cursor: None }
    }
}

/// Computes the next-sync interval for an entity.
pub trait TtlPolicy: Send + Sync + fmt::Debug {
    fn ttl(&self, entity: &EntityKey, ctx: &SyncContext) -> Duration;
}

/// Same interval regardless of context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTtl(pub Duration);

impl TtlPolicy for FixedTtl {
    fn ttl(&self, _entity: &EntityKey, _ctx: &SyncContext) -> Duration {
        self.0
    }
}

/// Short interval during the weekday trading session (UTC), longer off-hours, longest on
/// weekends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketHoursTtl {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub market: Duration,
    pub off_hours: Duration,
    pub weekend: Duration,
}

impl TtlPolicy for MarketHoursTtl {
    fn ttl(&self, _entity: &EntityKey, ctx: &SyncContext) -> Duration {
        if matches!(ctx.now.weekday(), Weekday::Sat | Weekday::Sun) {
            return self.weekend;
        }
        let time = ctx.now.time();
        if time >= self.open && time < self.close {
            self.market
        } else {
            self.off_hours
        }
    }
}

/// Short interval during the first `season_days` after each calendar-quarter end, when periodic
/// reports are filed; long otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportingSeasonTtl {
    pub season_days: u32,
    pub in_season: Duration,
    pub off_season: Duration,
}

impl ReportingSeasonTtl {
    /// Days elapsed since the most recent quarter end strictly before `date`.
    fn days_since_quarter_end(date: NaiveDate) -> i64 {
        let quarter_start_month = (date.month0() / 3) * 3 + 1;
        NaiveDate::from_ymd_opt(date.year(), quarter_start_month, 1)
            .and_then(|start| start.pred_opt())
            .map_or(0, |quarter_end| (date - quarter_end).num_days())
    }

    #[must_use]
    pub fn in_season(&self, now: DateTime<Utc>) -> bool {
        Self::days_since_quarter_end(now.date_naive()) <= i64::from(self.season_days)
    }
}

impl TtlPolicy for ReportingSeasonTtl {
    fn ttl(&self, _entity: &EntityKey, ctx: &SyncContext) -> Duration {
        if self.in_season(ctx.now) {
            self.in_season
        } else {
            self.off_season
        }
    }
}

/// Uses `empty` while the entity has no durable rows, `inner` otherwise.
#[derive(Debug, Clone)]
pub struct EmptyEntityTtl {
    pub empty: Duration,
    pub inner: Arc<dyn TtlPolicy>,
}

impl TtlPolicy for EmptyEntityTtl {
    fn ttl(&self, entity: &EntityKey, ctx: &SyncContext) -> Duration {
        if ctx.item_count == 0 {
            self.empty
        } else {
            self.inner.ttl(entity, ctx)
        }
    }
}

fn default_open() -> String {
    "13:30".to_string()
}

fn default_close() -> String {
    "20:00".to_string()
}

/// Configured form of a [`TtlPolicy`].
///
/// ```toml
/// [sources.ttl]
/// type = "empty_entity"
/// empty_seconds = 600
///
/// [sources.ttl.inner]
/// type = "reporting_season"
/// season_days = 45
/// in_season_seconds = 21600
/// off_season_seconds = 604800
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TtlPolicyConfig {
    Fixed {
        #[serde(default)]
        seconds: Option<u64>,
        #[serde(default)]
        preset: Option<String>,
    },
    MarketHours {
        #[serde(default = "default_open")]
        open: String,
        #[serde(default = "default_close")]
        close: String,
        market_seconds: u64,
        off_hours_seconds: u64,
        weekend_seconds: u64,
    },
    ReportingSeason {
        season_days: u32,
        in_season_seconds: u64,
        off_season_seconds: u64,
    },
    EmptyEntity {
        empty_seconds: u64,
        inner: Box<TtlPolicyConfig>,
    },
}

impl Default for TtlPolicyConfig {
    fn default() -> Self {
        Self::Fixed { seconds: Some(3_600), preset: None }
    }
}

fn positive(field: &str, seconds: u64) -> Result<Duration, ConfigValidationError> {
    if seconds == 0 {
        return Err(ConfigValidationError::Invalid(format!("ttl {field} must be greater than 0")));
    }
    Ok(Duration::from_secs(seconds))
}

fn parse_time(field: &str, value: &str) -> Result<NaiveTime, ConfigValidationError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|e| {
        ConfigValidationError::Invalid(format!("ttl {field} '{value}' is not HH:MM: {e}"))
    })
}

impl TtlPolicyConfig {
    /// Builds the policy, resolving named presets.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigValidationError`] for zero durations, unknown presets, malformed session
    /// times, or a `fixed` policy with neither `seconds` nor `preset`.
    pub fn build(&self, presets: &TtlPresets) -> Result<Arc<dyn TtlPolicy>, ConfigValidationError> {
        let policy: Arc<dyn TtlPolicy> = match self {
            Self::Fixed { seconds: Some(seconds), .. } => {
                Arc::new(FixedTtl(positive("seconds", *seconds)?))
            }
            Self::Fixed { seconds: None, preset: Some(name) } => {
                let ttl = presets
                    .get(name)
                    .ok_or_else(|| ConfigValidationError::UnknownTtlPreset(name.clone()))?;
                Arc::new(FixedTtl(ttl))
            }
            Self::Fixed { seconds: None, preset: None } => {
                return Err(ConfigValidationError::Invalid(
                    "fixed ttl needs either seconds or preset".to_string(),
                ));
            }
            Self::MarketHours { open, close, market_seconds, off_hours_seconds, weekend_seconds } => {
                let open = parse_time("open", open)?;
                let close = parse_time("close", close)?;
                if open >= close {
                    return Err(ConfigValidationError::Invalid(
                        "market session must open before it closes".to_string(),
                    ));
                }
                Arc::new(MarketHoursTtl {
                    open,
                    close,
                    market: positive("market_seconds", *market_seconds)?,
                    off_hours: positive("off_hours_seconds", *off_hours_seconds)?,
                    weekend: positive("weekend_seconds", *weekend_seconds)?,
                })
            }
            Self::ReportingSeason { season_days, in_season_seconds, off_season_seconds } => {
                Arc::new(ReportingSeasonTtl {
                    season_days: *season_days,
                    in_season: positive("in_season_seconds", *in_season_seconds)?,
                    off_season: positive("off_season_seconds", *off_season_seconds)?,
                })
            }
            Self::EmptyEntity { empty_seconds, inner } => Arc::new(EmptyEntityTtl {
                empty: positive("empty_seconds", *empty_seconds)?,
                inner: inner.build(presets)?,
            }),
        };
        Ok(policy)
    }
}
