//! Splits an aligned series into consecutive 24-hour day records.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calendar::{day_label, CanonicalGrid, HOURS_PER_DAY};
use crate::reindex::AlignedSeries;

/// Hourly values of one day, starting at the day boundary hour.
pub type DayVector = [Option<f64>; HOURS_PER_DAY];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayRecord {
    pub counter_id: i64,
    pub day: NaiveDate,
    pub consumptions: DayVector,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "aligned series has {aligned_len} values for a grid of {grid_len} instants; both must match and be a multiple of 24"
)]
pub struct ShapeError {
    pub aligned_len: usize,
    pub grid_len: usize,
}

/// Cuts `aligned` into day records in grid order.
pub fn segment_days(
    counter_id: i64,
    grid: &CanonicalGrid,
    aligned: &AlignedSeries,
) -> Result<Vec<DayRecord>, ShapeError> {
    if aligned.len() != grid.len() || aligned.len() % HOURS_PER_DAY != 0 {
        return Err(ShapeError {
            aligned_len: aligned.len(),
            grid_len: grid.len(),
        });
    }

    let boundary = grid.boundary();
    let days = grid
        .instants()
        .chunks_exact(HOURS_PER_DAY)
        .zip(aligned.values().chunks_exact(HOURS_PER_DAY))
        .map(|(instants, values)| {
            let mut consumptions: DayVector = [None; HOURS_PER_DAY];
            consumptions.copy_from_slice(values);
            DayRecord {
                counter_id,
                day: day_label(instants[0], boundary),
                consumptions,
            }
        })
        .collect();

    Ok(days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{build_grid, DayBoundary};
    use chrono::NaiveDateTime;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn two_day_grid_yields_two_labelled_records() {
        let grid = build_grid(at(1, 5), at(3, 4), DayBoundary::default());
        let aligned = AlignedSeries::from_values((0..48).map(|v| Some(v as f64)).collect());

        let days = segment_days(3, &grid, &aligned).unwrap();

        assert_eq!(days.len(), 2);
        assert_eq!(days[0].day, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(days[1].day, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(days[0].consumptions[0], Some(0.0));
        assert_eq!(days[1].consumptions[23], Some(47.0));
        assert!(days.iter().all(|day| day.counter_id == 3));
    }

    #[test]
    fn concatenated_days_reproduce_the_series() {
        let grid = build_grid(at(1, 5), at(4, 4), DayBoundary::default());
        let values: Vec<Option<f64>> = (0..72)
            .map(|v| if v % 7 == 0 { None } else { Some(v as f64) })
            .collect();
        let aligned = AlignedSeries::from_values(values.clone());

        let days = segment_days(1, &grid, &aligned).unwrap();
        let rebuilt: Vec<Option<f64>> = days
            .iter()
            .flat_map(|day| day.consumptions.iter().copied())
            .collect();

        assert_eq!(rebuilt, values);
    }

    #[test]
    fn mismatched_lengths_are_a_shape_error() {
        let grid = build_grid(at(1, 5), at(2, 4), DayBoundary::default());
        let aligned = AlignedSeries::from_values(vec![Some(1.0); 23]);

        assert_eq!(
            segment_days(1, &grid, &aligned).unwrap_err(),
            ShapeError {
                aligned_len: 23,
                grid_len: 24
            }
        );
    }

    #[test]
    fn empty_grid_segments_into_no_days() {
        let grid = build_grid(at(1, 5), at(1, 23), DayBoundary::default());
        let days = segment_days(1, &grid, &AlignedSeries::default()).unwrap();
        assert!(days.is_empty());
    }
}
