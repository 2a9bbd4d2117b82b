//! Counter-by-counter driver: fetch, grid, reindex, segment, clean, accumulate.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::calendar::{build_grid, DayBoundary};
use crate::clean::{clean_day, DegenerateDayPolicy, DegenerateStatsError};
use crate::export::{ExportError, TableSink};
use crate::reindex::{reindex, ReindexReport};
use crate::segment::{segment_days, DayRecord, DayVector, ShapeError};
use crate::store::{with_retry, ReadingSource, RetryPolicy, SourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterFailurePolicy {
    /// Stop the whole run at the first failing counter.
    Abort,
    /// Log the failure, record it in the report and move on.
    ReportAndSkip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub boundary: DayBoundary,
    pub failure_policy: CounterFailurePolicy,
    pub degenerate_policy: DegenerateDayPolicy,
    pub retry: RetryPolicy,
}

impl Default for CounterFailurePolicy {
    fn default() -> Self {
        Self::ReportAndSkip
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("shape error for counter {counter_id}: {source}")]
    Shape {
        counter_id: i64,
        #[source]
        source: ShapeError,
    },
    #[error("counter {counter_id} day {day}: {source}")]
    DegenerateStats {
        counter_id: i64,
        day: NaiveDate,
        #[source]
        source: DegenerateStatsError,
    },
    #[error("export error: {0}")]
    Export(#[from] ExportError),
}

/// One output row: a cleaned day of one building's counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub day: NaiveDate,
    pub building_id: i64,
    pub consumptions: DayVector,
}

/// Accumulated output of a run, in processing order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConsumptionTable {
    rows: Vec<TableRow>,
}

impl ConsumptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<TableRow>) -> Self {
        Self { rows }
    }

    /// Appends a counter's days tagged with `building_id = counter_id`.
    pub fn append_days(&mut self, days: Vec<DayRecord>) -> usize {
        let appended = days.len();
        self.rows.extend(days.into_iter().map(|day| TableRow {
            day: day.day,
            building_id: day.counter_id,
            consumptions: day.consumptions,
        }));
        appended
    }

    pub fn rows(&self) -> &[TableRow] {
        &self.rows
    }

    pub fn rows_for(&self, building_id: i64) -> impl Iterator<Item = &TableRow> {
        self.rows
            .iter()
            .filter(move |row| row.building_id == building_id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterFailure {
    pub counter_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineReport {
    pub counters_total: u64,
    pub counters_exported: u64,
    pub counters_failed: Vec<CounterFailure>,
    pub days_exported: u64,
    pub missing_slots: u64,
    pub negatives_flagged: u64,
    pub spikes_flagged: u64,
    pub days_invalidated: u64,
}

/// Cleaned days of one counter plus what happened on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterOutput {
    pub counter_id: i64,
    pub days: Vec<DayRecord>,
    pub reindex: ReindexReport,
    pub negatives_flagged: u64,
    pub spikes_flagged: u64,
    pub days_invalidated: u64,
}

pub fn process_counter(
    source: &dyn ReadingSource,
    counter_id: i64,
    cfg: &PipelineConfig,
) -> Result<CounterOutput, PipelineError> {
    let first = with_retry(&cfg.retry, "first_timestamp", || {
        source.first_timestamp(counter_id)
    })?;
    let last = with_retry(&cfg.retry, "last_timestamp", || {
        source.last_timestamp(counter_id)
    })?;
    let readings = with_retry(&cfg.retry, "fetch_readings", || {
        source.fetch_readings(counter_id)
    })?;

    let grid = build_grid(first, last, cfg.boundary);
    let (aligned, reindex_report) = reindex(&grid, &readings);
    if reindex_report.missing_points > 0 {
        debug!(
            component = "pipeline",
            event = "counter.gap_detected",
            counter_id,
            missing_points = reindex_report.missing_points,
            total_gap_ranges = reindex_report.total_gap_ranges,
            out_of_range_readings_dropped = reindex_report.out_of_range_readings_dropped
        );
    }

    let days = segment_days(counter_id, &grid, &aligned)
        .map_err(|source| PipelineError::Shape { counter_id, source })?;

    let mut output = CounterOutput {
        counter_id,
        days: Vec::with_capacity(days.len()),
        reindex: reindex_report,
        negatives_flagged: 0,
        spikes_flagged: 0,
        days_invalidated: 0,
    };

    for record in days {
        let cleaned = clean_day(&record.consumptions, cfg.degenerate_policy).map_err(|source| {
            PipelineError::DegenerateStats {
                counter_id,
                day: record.day,
                source,
            }
        })?;
        if cleaned.stats.is_none() {
            debug!(
                component = "pipeline",
                event = "day.degenerate",
                counter_id,
                day = %record.day,
                policy = ?cfg.degenerate_policy
            );
        }

        output.negatives_flagged += cleaned.negatives_flagged as u64;
        output.spikes_flagged += cleaned.spikes_flagged as u64;
        output.days_invalidated += u64::from(cleaned.day_invalidated);
        output.days.push(DayRecord {
            consumptions: cleaned.consumptions,
            ..record
        });
    }

    Ok(output)
}

/// Runs every counter of `source` and returns the accumulated table.
pub fn run_pipeline(
    source: &dyn ReadingSource,
    cfg: &PipelineConfig,
) -> Result<(ConsumptionTable, PipelineReport), PipelineError> {
    let counter_ids = with_retry(&cfg.retry, "list_counter_ids", || source.list_counter_ids())?;
    let total = counter_ids.len();

    info!(
        component = "pipeline",
        event = "pipeline.start",
        counters = total,
        start_day = cfg.boundary.start_hour(),
        failure_policy = ?cfg.failure_policy,
        degenerate_policy = ?cfg.degenerate_policy
    );

    let mut table = ConsumptionTable::new();
    let mut report = PipelineReport {
        counters_total: total as u64,
        ..PipelineReport::default()
    };

    for (idx, counter_id) in counter_ids.into_iter().enumerate() {
        match process_counter(source, counter_id, cfg) {
            Ok(output) => {
                report.counters_exported += 1;
                report.missing_slots += output.reindex.missing_points;
                report.negatives_flagged += output.negatives_flagged;
                report.spikes_flagged += output.spikes_flagged;
                report.days_invalidated += output.days_invalidated;
                let days = table.append_days(output.days);
                report.days_exported += days as u64;

                info!(
                    component = "pipeline",
                    event = "counter.done",
                    counter_id,
                    done = idx + 1,
                    total,
                    days,
                    negatives_flagged = output.negatives_flagged,
                    spikes_flagged = output.spikes_flagged
                );
            }
            Err(err) => handle_counter_failure(counter_id, err, cfg, &mut report)?,
        }
    }

    info!(
        component = "pipeline",
        event = "pipeline.finish",
        counters_total = report.counters_total,
        counters_exported = report.counters_exported,
        counters_failed = report.counters_failed.len(),
        days_exported = report.days_exported,
        negatives_flagged = report.negatives_flagged,
        spikes_flagged = report.spikes_flagged
    );

    Ok((table, report))
}

/// Runs the pipeline and hands the finished table to `sink`.
pub fn run_to_sink(
    source: &dyn ReadingSource,
    sink: &mut dyn TableSink,
    cfg: &PipelineConfig,
) -> Result<PipelineReport, PipelineError> {
    let (table, report) = run_pipeline(source, cfg)?;
    sink.write_table(&table)?;
    Ok(report)
}

fn handle_counter_failure(
    counter_id: i64,
    err: PipelineError,
    cfg: &PipelineConfig,
    report: &mut PipelineReport,
) -> Result<(), PipelineError> {
    // A shape mismatch means the grid itself is broken; never skip it.
    if matches!(err, PipelineError::Shape { .. }) {
        error!(
            component = "pipeline",
            event = "counter.shape_error",
            counter_id,
            error = %err
        );
        return Err(err);
    }

    match cfg.failure_policy {
        CounterFailurePolicy::Abort => {
            error!(
                component = "pipeline",
                event = "counter.failed",
                counter_id,
                policy = "abort",
                error = %err
            );
            Err(err)
        }
        CounterFailurePolicy::ReportAndSkip => {
            warn!(
                component = "pipeline",
                event = "counter.failed",
                counter_id,
                policy = "skip",
                error = %err
            );
            report.counters_failed.push(CounterFailure {
                counter_id,
                reason: err.to_string(),
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryReadingSource, Reading};
    use chrono::{Duration as ChronoDuration, NaiveDateTime};

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn hourly(counter_id: i64, start: NaiveDateTime, values: &[f64]) -> Vec<Reading> {
        values
            .iter()
            .enumerate()
            .map(|(h, v)| Reading::new(counter_id, start + ChronoDuration::hours(h as i64), Some(*v)))
            .collect()
    }

    fn fast_cfg(policy: CounterFailurePolicy) -> PipelineConfig {
        PipelineConfig {
            failure_policy: policy,
            retry: RetryPolicy {
                max_retries: 0,
                retry_backoff_ms: 0,
            },
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn deserialized_config_rejects_invalid_boundary() {
        let raw = r#"{
            "boundary": {"start_hour": 30},
            "failure_policy": "Abort",
            "degenerate_policy": "FlagNegativesOnly",
            "retry": {"max_retries": 0, "retry_backoff_ms": 0}
        }"#;
        assert!(serde_json::from_str::<PipelineConfig>(raw).is_err());

        let valid = raw.replace("30", "0");
        let cfg: PipelineConfig = serde_json::from_str(&valid).unwrap();
        assert_eq!(cfg.boundary.start_hour(), 0);
        assert_eq!(cfg.failure_policy, CounterFailurePolicy::Abort);
    }

    #[test]
    fn table_rows_carry_building_id() {
        let mut table = ConsumptionTable::new();
        let appended = table.append_days(vec![DayRecord {
            counter_id: 17,
            day: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            consumptions: [Some(1.0); 24],
        }]);

        assert_eq!(appended, 1);
        assert_eq!(table.rows()[0].building_id, 17);
        assert_eq!(table.rows_for(17).count(), 1);
        assert_eq!(table.rows_for(18).count(), 0);
    }

    #[test]
    fn process_counter_cleans_every_day() {
        let mut values = vec![2.0; 48];
        values[3] = -4.0;
        values[30] = 400.0;
        let source = InMemoryReadingSource::new().with_counter(5, hourly(5, at(1, 5), &values));

        let output = process_counter(&source, 5, &fast_cfg(CounterFailurePolicy::Abort)).unwrap();

        assert_eq!(output.days.len(), 2);
        assert_eq!(output.days[0].consumptions[3], None);
        assert_eq!(output.days[1].consumptions[6], None);
        assert_eq!(output.negatives_flagged, 1);
        assert_eq!(output.spikes_flagged, 1);
        assert_eq!(output.reindex.missing_points, 0);
    }

    #[test]
    fn skip_policy_records_empty_counter_and_continues() {
        let source = InMemoryReadingSource::new()
            .with_counter(1, Vec::new())
            .with_counter(2, hourly(2, at(1, 5), &[1.0; 24]));

        let (table, report) =
            run_pipeline(&source, &fast_cfg(CounterFailurePolicy::ReportAndSkip)).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(report.counters_total, 2);
        assert_eq!(report.counters_exported, 1);
        assert_eq!(report.counters_failed.len(), 1);
        assert_eq!(report.counters_failed[0].counter_id, 1);
    }

    #[test]
    fn abort_policy_stops_on_empty_counter() {
        let source = InMemoryReadingSource::new()
            .with_counter(1, Vec::new())
            .with_counter(2, hourly(2, at(1, 5), &[1.0; 24]));

        let err = run_pipeline(&source, &fast_cfg(CounterFailurePolicy::Abort)).unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Source(SourceError::EmptySource { counter_id: 1 })
        ));
    }

    #[test]
    fn failing_degenerate_policy_names_the_day() {
        let source = InMemoryReadingSource::new().with_counter(8, hourly(8, at(1, 5), &[-1.0; 24]));
        let cfg = PipelineConfig {
            degenerate_policy: DegenerateDayPolicy::Fail,
            ..fast_cfg(CounterFailurePolicy::Abort)
        };

        match run_pipeline(&source, &cfg).unwrap_err() {
            PipelineError::DegenerateStats {
                counter_id, day, ..
            } => {
                assert_eq!(counter_id, 8);
                assert_eq!(day, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
