//! Hourly canonical grid anchored to a configurable day boundary.
//!
//! Days run from `START_DAY:00` to `(START_DAY - 1):00` of the next calendar
//! date. All instants are naive local wall-clock time as stored in the source.

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const HOURS_PER_DAY: usize = 24;
pub const DEFAULT_START_DAY: u32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CalendarError {
    #[error("day boundary hour must be within 0..=23, got {0}")]
    InvalidStartHour(u32),
}

/// Hour-of-day at which a consumption day starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDayBoundary")]
pub struct DayBoundary {
    start_hour: u32,
}

#[derive(Deserialize)]
struct RawDayBoundary {
    start_hour: u32,
}

impl TryFrom<RawDayBoundary> for DayBoundary {
    type Error = CalendarError;

    fn try_from(raw: RawDayBoundary) -> Result<Self, Self::Error> {
        Self::new(raw.start_hour)
    }
}

impl DayBoundary {
    pub fn new(start_hour: u32) -> Result<Self, CalendarError> {
        if start_hour >= HOURS_PER_DAY as u32 {
            return Err(CalendarError::InvalidStartHour(start_hour));
        }
        Ok(Self { start_hour })
    }

    pub fn start_hour(self) -> u32 {
        self.start_hour
    }

    /// Hour of the last slot of a day, one hour before the next boundary.
    pub fn end_hour(self) -> u32 {
        (self.start_hour + HOURS_PER_DAY as u32 - 1) % HOURS_PER_DAY as u32
    }
}

impl Default for DayBoundary {
    fn default() -> Self {
        Self {
            start_hour: DEFAULT_START_DAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalGrid {
    boundary: DayBoundary,
    instants: Vec<NaiveDateTime>,
}

impl CanonicalGrid {
    pub fn boundary(&self) -> DayBoundary {
        self.boundary
    }

    pub fn instants(&self) -> &[NaiveDateTime] {
        &self.instants
    }

    pub fn len(&self) -> usize {
        self.instants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instants.is_empty()
    }

    pub fn day_count(&self) -> usize {
        self.instants.len() / HOURS_PER_DAY
    }

    pub fn first(&self) -> Option<NaiveDateTime> {
        self.instants.first().copied()
    }

    pub fn last(&self) -> Option<NaiveDateTime> {
        self.instants.last().copied()
    }

    pub fn contains_range(&self, ts: NaiveDateTime) -> bool {
        match (self.first(), self.last()) {
            (Some(first), Some(last)) => ts >= first && ts <= last,
            _ => false,
        }
    }

    /// Slot index of `ts`, or `None` when it is outside the grid or not on the hour.
    pub fn index_of(&self, ts: NaiveDateTime) -> Option<usize> {
        if !self.contains_range(ts) {
            return None;
        }
        let offset = ts - self.first()?;
        let hours = offset.num_hours();
        if offset != ChronoDuration::hours(hours) {
            return None;
        }
        Some(hours as usize)
    }
}

/// Builds the grid covering every whole day between the dates of `first` and `last`.
///
/// The start is forced to the boundary hour of `first`'s date and the end to
/// the hour before the boundary on `last`'s date. If that leaves less than one
/// full day the grid is empty.
pub fn build_grid(
    first: NaiveDateTime,
    last: NaiveDateTime,
    boundary: DayBoundary,
) -> CanonicalGrid {
    let start = first.date().and_time(hour_time(boundary.start_hour()));
    let end = last.date().and_time(hour_time(boundary.end_hour()));

    let mut instants = Vec::new();
    if end >= start {
        let hours = (end - start).num_hours() + 1;
        instants.reserve(hours as usize);
        let mut cursor = start;
        while cursor <= end {
            instants.push(cursor);
            cursor += ChronoDuration::hours(1);
        }
    }
    debug_assert_eq!(instants.len() % HOURS_PER_DAY, 0);

    CanonicalGrid { boundary, instants }
}

/// Consumption day an instant belongs to.
pub fn day_label(instant: NaiveDateTime, boundary: DayBoundary) -> NaiveDate {
    (instant - ChronoDuration::hours(i64::from(boundary.start_hour()))).date()
}

fn hour_time(hour: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, 0, 0).expect("boundary hours are validated to 0..=23")
}
