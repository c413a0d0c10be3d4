//! Rollover Calendar
//!
//! Maps UTC timestamps to business dates under a configured timezone and
//! rollover hour. Conversion always goes UTC -> local, which chrono-tz keeps
//! total and unambiguous across DST transitions: the fall-back duplicated
//! local hour maps both instants to the same business date, and the
//! spring-forward skipped hour simply never occurs.

use crate::errors::PipelineError;
use crate::models::Millis;
use chrono::{Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub struct RolloverCalendar {
    tz: Tz,
    rollover_hour: u32,
}

impl RolloverCalendar {
    pub fn new(tz_name: &str, rollover_hour: u32) -> Result<Self, PipelineError> {
        if rollover_hour > 23 {
            return Err(PipelineError::ConfigInvalid(format!(
                "rollover_hour={} not in 0..=23",
                rollover_hour
            )));
        }
        let tz: Tz = tz_name.parse().map_err(|_| {
            PipelineError::ConfigInvalid(format!("unknown rollover timezone '{}'", tz_name))
        })?;
        Ok(Self { tz, rollover_hour })
    }

    /// The business date a UTC timestamp belongs to: the local calendar
    /// date, shifted back one day when local time is before the rollover
    /// hour.
    pub fn business_date(&self, ts_ms: Millis) -> NaiveDate {
        let utc = Utc
            .timestamp_millis_opt(ts_ms)
            .single()
            .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
        let local = utc.with_timezone(&self.tz);
        let date = local.date_naive();
        if local.hour() < self.rollover_hour {
            date - Duration::days(1)
        } else {
            date
        }
    }

    /// Whether a business-day boundary lies between the two timestamps.
    #[inline]
    pub fn crosses_boundary(&self, prev_ts_ms: Millis, ts_ms: Millis) -> bool {
        self.business_date(prev_ts_ms) != self.business_date(ts_ms)
    }
}
