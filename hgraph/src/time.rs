use chrono::DateTime;
use chrono::naive::NaiveDateTime;
use derive_more::Display;
use derive_new::new;
use once_cell::sync::Lazy;
use quanta::Clock;
use serde::{Deserialize, Serialize};
use std::convert::From;
use std::ops::{Add, Sub};
use std::time::Duration;

type RawTime = u64;

static CLOCK: Lazy<Clock> = Lazy::new(Clock::new);

/// A logical engine instant in nanoseconds since the unix epoch.
///
/// `MAX_DT` is the "never scheduled" sentinel; arithmetic on it is a bug
/// and `next()` saturates there.
#[derive(
    new,
    Display,
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
)]
pub struct EngineTime(RawTime);

impl EngineTime {
    /// The earliest representable instant.
    pub const MIN_DT: Self = Self(0);
    /// Sentinel meaning "never scheduled".
    pub const MAX_DT: Self = Self(RawTime::MAX);
    pub const NANOS_PER_SECOND: RawTime = 1_000_000_000;

    pub fn now() -> Self {
        Self(CLOCK.now().as_u64())
    }

    pub fn is_never(&self) -> bool {
        *self == Self::MAX_DT
    }

    /// The smallest representable step after `self`.  Used to defer a
    /// same-tick notification to the next tick.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for EngineTime {
    fn from(t: u64) -> Self {
        EngineTime(t)
    }
}

impl From<u128> for EngineTime {
    fn from(t: u128) -> Self {
        EngineTime(t as RawTime)
    }
}

impl From<Duration> for EngineTime {
    fn from(dur: Duration) -> Self {
        Self(dur.as_secs() * Self::NANOS_PER_SECOND + dur.subsec_nanos() as RawTime)
    }
}

impl TryFrom<NaiveDateTime> for EngineTime {
    type Error = anyhow::Error;
    fn try_from(date_time: NaiveDateTime) -> anyhow::Result<Self> {
        let t = date_time.and_utc().timestamp_nanos_opt().ok_or_else(|| {
            anyhow::anyhow!("timestamp out of range for nanosecond representation")
        })?;
        Ok(EngineTime(t as RawTime))
    }
}

impl TryFrom<EngineTime> for NaiveDateTime {
    type Error = anyhow::Error;
    fn try_from(t: EngineTime) -> anyhow::Result<Self> {
        DateTime::from_timestamp(
            (t.0 / EngineTime::NANOS_PER_SECOND) as i64,
            (t.0 % EngineTime::NANOS_PER_SECOND) as u32,
        )
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| anyhow::anyhow!("EngineTime out of range for DateTime"))
    }
}

impl From<EngineTime> for u64 {
    fn from(t: EngineTime) -> Self {
        t.0
    }
}

impl From<EngineTime> for f64 {
    fn from(t: EngineTime) -> Self {
        t.0 as f64
    }
}

impl From<EngineTime> for Duration {
    fn from(t: EngineTime) -> Self {
        Duration::from_nanos(t.0)
    }
}

impl Add<Duration> for EngineTime {
    type Output = Self;
    fn add(self, other: Duration) -> Self::Output {
        Self(self.0 + other.as_nanos() as RawTime)
    }
}

impl Add<EngineTime> for EngineTime {
    type Output = Self;
    fn add(self, other: Self) -> Self::Output {
        Self(self.0 + other.0)
    }
}

impl Add<RawTime> for EngineTime {
    type Output = Self;
    fn add(self, other: RawTime) -> Self::Output {
        Self(self.0 + other)
    }
}

impl Sub<EngineTime> for EngineTime {
    type Output = Self;
    fn sub(self, other: Self) -> Self::Output {
        Self(self.0 - other.0)
    }
}
