use serde::{Deserialize, Serialize};

/// Microseconds between the unix epoch and 2000-01-01T00:00:00Z.
pub const UNIX_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;
/// Days between 1970-01-01 and 2000-01-01.
pub const UNIX_EPOCH_OFFSET_DAYS: i32 = 10_957;
pub const MICROS_PER_DAY: i64 = 86_400_000_000;

/// A point in time, microseconds since 2000-01-01T00:00:00Z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Datetime(i64);

impl Datetime {
    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn from_unix_micros(micros: i64) -> Self {
        Self(micros - UNIX_EPOCH_OFFSET_MICROS)
    }

    pub fn micros(self) -> i64 {
        self.0
    }

    pub fn unix_micros(self) -> i64 {
        self.0 + UNIX_EPOCH_OFFSET_MICROS
    }
}

/// Wall-clock date and time without a zone, same epoch as [`Datetime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalDatetime(i64);

impl LocalDatetime {
    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn micros(self) -> i64 {
        self.0
    }
}

/// Days since 2000-01-01.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalDate(i32);

impl LocalDate {
    pub fn from_days(days: i32) -> Self {
        Self(days)
    }

    pub fn from_unix_days(days: i32) -> Self {
        Self(days - UNIX_EPOCH_OFFSET_DAYS)
    }

    pub fn days(self) -> i32 {
        self.0
    }
}

/// Microseconds since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalTime(i64);

impl LocalTime {
    /// Returns `None` outside `0..MICROS_PER_DAY`.
    pub fn from_micros(micros: i64) -> Option<Self> {
        (0..MICROS_PER_DAY).contains(&micros).then_some(Self(micros))
    }

    pub fn micros(self) -> i64 {
        self.0
    }
}

/// Exact elapsed time in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Duration(i64);

impl Duration {
    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn micros(self) -> i64 {
        self.0
    }
}

impl From<std::time::Duration> for Duration {
    fn from(value: std::time::Duration) -> Self {
        Self(i64::try_from(value.as_micros()).unwrap_or(i64::MAX))
    }
}

/// Calendar-aware interval: months and days are kept apart from the time part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelativeDuration {
    pub micros: i64,
    pub days: i32,
    pub months: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateDuration {
    pub days: i32,
    pub months: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_conversions_shift_epoch() {
        assert_eq!(Datetime::from_unix_micros(UNIX_EPOCH_OFFSET_MICROS).micros(), 0);
        assert_eq!(Datetime::from_micros(-1).unix_micros(), UNIX_EPOCH_OFFSET_MICROS - 1);
        assert_eq!(LocalDate::from_unix_days(UNIX_EPOCH_OFFSET_DAYS).days(), 0);
    }

    #[test]
    fn local_time_rejects_out_of_day_values() {
        assert!(LocalTime::from_micros(-1).is_none());
        assert!(LocalTime::from_micros(MICROS_PER_DAY).is_none());
        assert_eq!(
            LocalTime::from_micros(MICROS_PER_DAY - 1).map(LocalTime::micros),
            Some(MICROS_PER_DAY - 1)
        );
    }
}
