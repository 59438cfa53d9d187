//! ==============================================================================
//! clock.rs - calendar breakdowns for scheduling
//! ==============================================================================
//!
//! purpose:
//!     captures the local wall clock once and exposes it broken down by day
//!     and by hour. the hourly snapshot scheduler uses `until_next_hour()`
//!     so every rearm is computed from the current minute/second rather than
//!     from a fixed 3600s period.
//!
//! relationships:
//!     - used by: aggregation.rs (hourly trend snapshot)
//!
//! ==============================================================================

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use std::time::Duration;

const MS_PER_HOUR: u64 = 3_600_000;

/// A single instant of local time split into calendar fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBreakdown {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub millis: u32,
}

/// Progress through the current day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayBreakdown {
    pub hour: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub millis: u64,
}

/// Progress through the current hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourBreakdown {
    pub minute: u32,
    pub seconds: u32,
    pub millis: u64,
}

impl TimeBreakdown {
    pub fn now() -> Self {
        Self::from_datetime(&Local::now())
    }

    pub fn from_datetime<Tz: TimeZone>(dt: &DateTime<Tz>) -> Self {
        Self {
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
            // leap seconds report nanos >= 1e9
            millis: (dt.nanosecond() / 1_000_000).min(999),
        }
    }

    /// `yyyy-mm-dd`
    pub fn datestamp(&self) -> String {
        format!("{}-{:02}-{:02}", self.year, self.month, self.day)
    }

    /// `hh:mm:ss`, no milliseconds
    pub fn timestamp(&self) -> String {
        format!("{:02}:{:02}:{:02}", self.hour, self.minute, self.second)
    }

    /// log-entry form, `yyyy-mm-dd hh:mm:ss`
    pub fn date_timestamp(&self) -> String {
        format!("{} {}", self.datestamp(), self.timestamp())
    }

    pub fn day_breakdown(&self) -> DayBreakdown {
        let minutes = self.hour * 60 + self.minute;
        let seconds = minutes * 60 + self.second;
        DayBreakdown {
            hour: self.hour,
            minutes,
            seconds,
            millis: u64::from(seconds) * 1000 + u64::from(self.millis),
        }
    }

    pub fn hour_breakdown(&self) -> HourBreakdown {
        let seconds = self.minute * 60 + self.second;
        HourBreakdown {
            minute: self.minute,
            seconds,
            millis: u64::from(seconds) * 1000 + u64::from(self.millis),
        }
    }

    /// Time left until the next top of the hour, in `(0, 3600s]`.
    pub fn until_next_hour(&self) -> Duration {
        let elapsed = self.hour_breakdown().millis.min(MS_PER_HOUR - 1);
        Duration::from_millis(MS_PER_HOUR - elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(h: u32, m: u32, s: u32, ms: u32) -> TimeBreakdown {
        let dt = Utc
            .with_ymd_and_hms(2024, 3, 7, h, m, s)
            .unwrap()
            .with_nanosecond(ms * 1_000_000)
            .unwrap();
        TimeBreakdown::from_datetime(&dt)
    }

    #[test]
    fn stamps_are_zero_padded() {
        let t = at(4, 5, 6, 0);
        assert_eq!(t.datestamp(), "2024-03-07");
        assert_eq!(t.timestamp(), "04:05:06");
        assert_eq!(t.date_timestamp(), "2024-03-07 04:05:06");
    }

    #[test]
    fn day_and_hour_breakdowns() {
        let t = at(2, 30, 15, 250);
        let day = t.day_breakdown();
        assert_eq!(day.hour, 2);
        assert_eq!(day.minutes, 150);
        assert_eq!(day.seconds, 9015);
        assert_eq!(day.millis, 9_015_250);

        let hour = t.hour_breakdown();
        assert_eq!(hour.minute, 30);
        assert_eq!(hour.seconds, 1815);
        assert_eq!(hour.millis, 1_815_250);
    }

    #[test]
    fn until_next_hour_counts_down_from_current_minute() {
        assert_eq!(at(13, 0, 0, 0).until_next_hour(), Duration::from_secs(3600));
        assert_eq!(at(13, 59, 0, 0).until_next_hour(), Duration::from_secs(60));
        assert_eq!(at(13, 59, 59, 500).until_next_hour(), Duration::from_millis(500));
        assert_eq!(at(23, 15, 0, 0).until_next_hour(), Duration::from_secs(45 * 60));
    }
}
