use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};

/// When a job is due.
pub trait Schedule: Send + Sync + fmt::Debug {
    /// First fire time strictly after `after`, or `None` if the schedule
    /// never fires again.
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Fires every `every`, aligned to `anchor`.
///
/// The default anchor is the Unix epoch, so every process running the same
/// schedule agrees on the fire times without coordination.
#[derive(Clone, Debug)]
pub struct IntervalSchedule {
    every: Duration,
    anchor: DateTime<Utc>,
}

impl IntervalSchedule {
    pub fn new(every: Duration) -> Self {
        Self {
            every,
            anchor: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn every_ms(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    pub fn anchored_at(mut self, anchor: DateTime<Utc>) -> Self {
        self.anchor = anchor;
        self
    }

    pub fn period(&self) -> Duration {
        self.every
    }
}

impl Schedule for IntervalSchedule {
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let period = i64::try_from(self.every.as_millis()).ok().filter(|ms| *ms > 0)?;
        if after < self.anchor {
            return Some(self.anchor);
        }
        let elapsed = (after - self.anchor).num_milliseconds();
        let periods = elapsed.div_euclid(period).checked_add(1)?;
        let offset = chrono::Duration::try_milliseconds(periods.checked_mul(period)?)?;
        self.anchor.checked_add_signed(offset)
    }
}

/// Fires once a day at a fixed UTC time of day.
#[derive(Clone, Copy, Debug)]
pub struct DailySchedule {
    at: NaiveTime,
}

impl DailySchedule {
    /// `None` for an invalid hour or minute.
    pub fn at(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(|at| Self { at })
    }
}

impl Schedule for DailySchedule {
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = Utc.from_utc_datetime(&after.date_naive().and_time(self.at));
        if today > after {
            Some(today)
        } else {
            today.checked_add_signed(chrono::Duration::days(1))
        }
    }
}

/// Never due. Jobs with this schedule only run through
/// [`JobRunner::run_job`](super::JobRunner::run_job) or a replay.
#[derive(Clone, Copy, Debug, Default)]
pub struct ManualSchedule;

impl Schedule for ManualSchedule {
    fn next_after(&self, _after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        None
    }
}
