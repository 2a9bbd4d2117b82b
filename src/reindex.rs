//! Left-join of raw readings onto a canonical grid.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::calendar::CanonicalGrid;
use crate::store::Reading;

const MAX_REPORTED_GAP_RANGES: usize = 256;

/// One value per grid instant; `None` marks a missing hour.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AlignedSeries {
    values: Vec<Option<f64>>,
}

impl AlignedSeries {
    pub fn from_values(values: Vec<Option<f64>>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReindexReport {
    pub grid_points: u64,
    pub matched_points: u64,
    pub missing_points: u64,
    pub out_of_range_readings_dropped: u64,
    pub off_grid_readings_dropped: u64,
    pub duplicate_readings_dropped: u64,
    pub total_gap_ranges: u64,
    /// Inclusive `(first_missing, last_missing)` hours, capped at 256 entries.
    pub gap_ranges: Vec<(NaiveDateTime, NaiveDateTime)>,
}

/// Aligns `readings` onto `grid`.
///
/// Readings outside the grid or off the hour are dropped; for repeated
/// timestamps the first reading wins. The result always has `grid.len()` values.
pub fn reindex(grid: &CanonicalGrid, readings: &[Reading]) -> (AlignedSeries, ReindexReport) {
    let mut values = vec![None; grid.len()];
    let mut filled = vec![false; grid.len()];
    let mut report = ReindexReport {
        grid_points: grid.len() as u64,
        ..ReindexReport::default()
    };

    for reading in readings {
        if !grid.contains_range(reading.timestamp) {
            report.out_of_range_readings_dropped += 1;
            continue;
        }
        let Some(idx) = grid.index_of(reading.timestamp) else {
            report.off_grid_readings_dropped += 1;
            continue;
        };
        if filled[idx] {
            report.duplicate_readings_dropped += 1;
            continue;
        }
        filled[idx] = true;
        values[idx] = reading.consumption;
        report.matched_points += 1;
    }

    let (gap_ranges, total_gap_ranges, missing_points) = gap_ranges(grid, &values);
    report.gap_ranges = gap_ranges;
    report.total_gap_ranges = total_gap_ranges as u64;
    report.missing_points = missing_points;

    (AlignedSeries { values }, report)
}

fn gap_ranges(
    grid: &CanonicalGrid,
    values: &[Option<f64>],
) -> (Vec<(NaiveDateTime, NaiveDateTime)>, usize, u64) {
    let instants = grid.instants();
    let mut full = Vec::new();
    let mut run_start: Option<usize> = None;
    let mut missing_points = 0u64;

    for (idx, value) in values.iter().enumerate() {
        match (value, run_start) {
            (None, None) => {
                run_start = Some(idx);
                missing_points += 1;
            }
            (None, Some(_)) => missing_points += 1,
            (Some(_), Some(start)) => {
                full.push((instants[start], instants[idx - 1]));
                run_start = None;
            }
            (Some(_), None) => {}
        }
    }
    if let Some(start) = run_start {
        full.push((instants[start], instants[values.len() - 1]));
    }

    let total = full.len();
    let reported = full.into_iter().take(MAX_REPORTED_GAP_RANGES).collect();
    (reported, total, missing_points)
}
