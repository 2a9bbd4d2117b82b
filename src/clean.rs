//! Per-day outlier scrubbing.
//!
//! A reading is invalid when it is negative or when it lies strictly above
//! `mean + 3 * std` of the day's non-negative readings. Standard deviation is
//! the population one. Invalid readings become missing; missing readings are
//! never touched.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calendar::HOURS_PER_DAY;
use crate::segment::DayVector;

pub const SPIKE_SIGMAS: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegenerateDayPolicy {
    /// Drop negatives and skip the spike test.
    FlagNegativesOnly,
    /// Mark every hour of the day missing.
    InvalidateDay,
    Fail,
}

impl Default for DegenerateDayPolicy {
    fn default() -> Self {
        Self::FlagNegativesOnly
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("day has no non-negative readings to compute a baseline from")]
pub struct DegenerateStatsError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DayStats {
    pub mean: f64,
    pub std: f64,
    pub count: usize,
}

impl DayStats {
    pub fn threshold(&self) -> f64 {
        self.mean + SPIKE_SIGMAS * self.std
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedDay {
    pub consumptions: DayVector,
    pub negatives_flagged: usize,
    pub spikes_flagged: usize,
    pub day_invalidated: bool,
    pub stats: Option<DayStats>,
}

impl CleanedDay {
    pub fn flagged(&self) -> usize {
        self.negatives_flagged + self.spikes_flagged
    }
}

/// Mean and population standard deviation of the non-negative, present readings.
pub fn day_stats(values: &DayVector) -> Option<DayStats> {
    let baseline: Vec<f64> = values
        .iter()
        .flatten()
        .copied()
        .filter(|value| *value >= 0.0)
        .collect();
    if baseline.is_empty() {
        return None;
    }

    let count = baseline.len();
    let mean = baseline.iter().sum::<f64>() / count as f64;
    let variance = baseline
        .iter()
        .map(|v| {
            let d = *v - mean;
            d * d
        })
        .sum::<f64>()
        / count as f64;

    Some(DayStats {
        mean,
        std: variance.sqrt(),
        count,
    })
}

/// Returns a copy of `values` with negatives and spikes replaced by `None`.
pub fn clean_day(
    values: &DayVector,
    policy: DegenerateDayPolicy,
) -> Result<CleanedDay, DegenerateStatsError> {
    let stats = day_stats(values);
    let negatives_flagged = values.iter().flatten().filter(|v| **v < 0.0).count();

    if stats.is_none() {
        match policy {
            DegenerateDayPolicy::Fail => return Err(DegenerateStatsError),
            DegenerateDayPolicy::InvalidateDay => {
                return Ok(CleanedDay {
                    consumptions: [None; HOURS_PER_DAY],
                    negatives_flagged,
                    spikes_flagged: 0,
                    day_invalidated: true,
                    stats: None,
                });
            }
            DegenerateDayPolicy::FlagNegativesOnly => {}
        }
    }

    let threshold = stats.map(|s| s.threshold());
    let mut consumptions = *values;
    let mut spikes_flagged = 0;
    for slot in consumptions.iter_mut() {
        let Some(value) = *slot else {
            continue;
        };
        if value < 0.0 {
            *slot = None;
        } else if threshold.is_some_and(|limit| value > limit) {
            *slot = None;
            spikes_flagged += 1;
        }
    }

    Ok(CleanedDay {
        consumptions,
        negatives_flagged,
        spikes_flagged,
        day_invalidated: false,
        stats,
    })
}
