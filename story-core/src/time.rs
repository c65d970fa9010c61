//! In-story time tracking.
//!
//! Stories measure elapsed narrative time as a four-field duration rather
//! than a calendar date. All mutation paths normalize before the value is
//! observed or persisted, so a tracker read back from storage is always in
//! canonical form.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Minutes per hour.
const MINUTES_PER_HOUR: i64 = 60;

/// Hours per day.
const HOURS_PER_DAY: i64 = 24;

/// Days per year.
const DAYS_PER_YEAR: i64 = 365;

/// Elapsed in-story time as a four-field duration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeTracker {
    pub years: i64,
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
}

impl TimeTracker {
    /// Create a tracker and normalize it immediately.
    pub fn new(years: i64, days: i64, hours: i64, minutes: i64) -> Self {
        let mut tracker = Self {
            years,
            days,
            hours,
            minutes,
        };
        tracker.normalize();
        tracker
    }

    /// Normalize the duration in place.
    ///
    /// Negative fields first borrow from the next-larger unit (minutes from
    /// hours, hours from days, days from years); a remainder that is still
    /// negative after borrowing is clamped to zero rather than left negative.
    /// Overflow is then carried upward using fixed bases: 60 minutes/hour,
    /// 24 hours/day, 365 days/year.
    pub fn normalize(&mut self) {
        borrow(&mut self.minutes, &mut self.hours, MINUTES_PER_HOUR);
        borrow(&mut self.hours, &mut self.days, HOURS_PER_DAY);
        borrow(&mut self.days, &mut self.years, DAYS_PER_YEAR);
        if self.years < 0 {
            self.years = 0;
        }

        self.hours += self.minutes.div_euclid(MINUTES_PER_HOUR);
        self.minutes = self.minutes.rem_euclid(MINUTES_PER_HOUR);
        self.days += self.hours.div_euclid(HOURS_PER_DAY);
        self.hours = self.hours.rem_euclid(HOURS_PER_DAY);
        self.years += self.days.div_euclid(DAYS_PER_YEAR);
        self.days = self.days.rem_euclid(DAYS_PER_YEAR);
    }

    /// Return a normalized copy.
    pub fn normalized(mut self) -> Self {
        self.normalize();
        self
    }

    /// Add a (possibly negative) delta and normalize.
    pub fn add(&mut self, delta: TimeTracker) {
        self.years += delta.years;
        self.days += delta.days;
        self.hours += delta.hours;
        self.minutes += delta.minutes;
        self.normalize();
    }

    /// True if no time has elapsed.
    pub fn is_zero(&self) -> bool {
        self.years == 0 && self.days == 0 && self.hours == 0 && self.minutes == 0
    }

    /// A delta of the given number of minutes.
    pub fn from_minutes(minutes: i64) -> Self {
        Self::new(0, 0, 0, minutes)
    }

    /// A delta of the given number of hours.
    pub fn from_hours(hours: i64) -> Self {
        Self::new(0, 0, hours, 0)
    }

    /// A delta of the given number of days.
    pub fn from_days(days: i64) -> Self {
        Self::new(0, days, 0, 0)
    }
}

/// Resolve a negative `unit` by borrowing from `larger`.
///
/// After borrowing, `unit` lies in `[0, base)` -- any remaining deficit has
/// moved up into `larger`, which may itself go negative and borrow in turn.
fn borrow(unit: &mut i64, larger: &mut i64, base: i64) {
    if *unit < 0 {
        let borrowed = (-*unit + base - 1) / base;
        *larger -= borrowed;
        *unit += borrowed * base;
    }
}

impl fmt::Display for TimeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}y {}d {}h {}m",
            self.years, self.days, self.hours, self.minutes
        )
    }
}

/// Three-way restore semantics for a backed-up tracker.
///
/// Backups that never captured the tracker must not clobber the live value,
/// so "skip" is distinct from "explicitly clear".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerRestore {
    /// The backup never touched the tracker; leave the live value alone.
    Skip,
    /// The backup captured a cleared tracker; clear the live one.
    Clear,
    /// The backup captured a value; normalize and set it.
    Set(TimeTracker),
}

impl TrackerRestore {
    /// Build the restore instruction from a captured `Option<TimeTracker>`.
    pub fn from_captured(captured: Option<TimeTracker>) -> Self {
        match captured {
            Some(tracker) => TrackerRestore::Set(tracker),
            None => TrackerRestore::Clear,
        }
    }
}
