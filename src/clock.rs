//! Wall-clock timestamps stored without a zone, normalised to one fixed offset.

use std::{
    fmt,
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use time::{
    OffsetDateTime, PrimitiveDateTime, UtcOffset, format_description::BorrowedFormatItem,
    macros::format_description,
};

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

/// Zone-less timestamp, already shifted to the application's fixed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(PrimitiveDateTime);

impl Timestamp {
    /// Normalise an instant to `offset` and drop the zone.
    pub fn from_offset(instant: OffsetDateTime, offset: UtcOffset) -> Self {
        let local = instant.to_offset(offset);
        Self(PrimitiveDateTime::new(local.date(), local.time()))
    }

    /// Timestamp for a unix second count, normalised to UTC.
    pub fn from_unix(seconds: i64) -> Self {
        let instant =
            OffsetDateTime::from_unix_timestamp(seconds).unwrap_or(OffsetDateTime::UNIX_EPOCH);
        Self::from_offset(instant, UtcOffset::UTC)
    }

    /// Whole seconds elapsed since `earlier`; negative if `earlier` is in the future.
    pub fn seconds_since(self, earlier: Timestamp) -> i64 {
        (self.0 - earlier.0).whole_seconds()
    }

    /// Non-negative elapsed duration since `earlier`.
    pub fn elapsed_since(self, earlier: Timestamp) -> Duration {
        Duration::from_secs(self.seconds_since(earlier).max(0) as u64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = self.0.format(TIMESTAMP_FORMAT).map_err(|_| fmt::Error)?;
        f.write_str(&formatted)
    }
}

impl Serialize for Timestamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        PrimitiveDateTime::parse(&raw, TIMESTAMP_FORMAT)
            .map(Timestamp)
            .map_err(de::Error::custom)
    }
}

/// Source of "now" for every interval boundary the orchestrator records.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// System clock shifted to a fixed offset.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    /// Clock normalised to `offset_hours` east of UTC. Out-of-range offsets fall back to UTC.
    pub fn new(offset_hours: i8) -> Self {
        let offset = UtcOffset::from_hms(offset_hours, 0, 0).unwrap_or(UtcOffset::UTC);
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_offset(OffsetDateTime::now_utc(), self.offset)
    }
}

/// Manually driven clock, counting unix seconds.
#[derive(Debug, Default)]
pub struct ManualClock {
    seconds: AtomicI64,
}

impl ManualClock {
    /// Start the clock at `seconds` past the unix epoch.
    pub fn starting_at(seconds: i64) -> Self {
        Self {
            seconds: AtomicI64::new(seconds),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, seconds: i64) {
        self.seconds.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_unix(self.seconds.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_serialize_without_zone() {
        let ts = Timestamp::from_unix(1_700_000_000);
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"2023-11-14T22:13:20\"");
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn offset_is_applied_before_dropping_zone() {
        let instant = OffsetDateTime::from_unix_timestamp(0).unwrap();
        let offset = UtcOffset::from_hms(2, 0, 0).unwrap();
        assert_eq!(
            Timestamp::from_offset(instant, offset).to_string(),
            "1970-01-01T02:00:00"
        );
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::starting_at(100);
        let start = clock.now();
        clock.advance(301);
        assert_eq!(clock.now().seconds_since(start), 301);
        assert_eq!(start.elapsed_since(clock.now()), Duration::ZERO);
    }
}
