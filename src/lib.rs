//! Daygrid core crate.
//!
//! Turns raw hourly electricity readings per counter into one cleaned
//! 24-value row per counter and day:
//! - canonical hourly grid anchored to a configurable day boundary
//! - left-join reindexing with gap reporting
//! - fixed-size day segmentation
//! - per-day negative and 3-sigma spike scrubbing
//! - sequential driver, CSV export and environment configuration

mod calendar;
mod clean;
mod config;
mod export;
mod observability;
mod pipeline;
mod reindex;
mod segment;
mod store;
#[cfg(test)]
mod test_support;

pub use calendar::{
    build_grid, day_label, CalendarError, CanonicalGrid, DayBoundary, DEFAULT_START_DAY,
    HOURS_PER_DAY,
};
pub use clean::{
    clean_day, day_stats, CleanedDay, DayStats, DegenerateDayPolicy, DegenerateStatsError,
    SPIKE_SIGMAS,
};
pub use config::{
    app_config_from_env, AppConfig, ConfigError, ENV_DEGENERATE_DAY, ENV_MAX_RETRIES,
    ENV_ON_COUNTER_ERROR, ENV_OUTPUT_PATH, ENV_RETRY_BACKOFF_MS, ENV_START_DAY, ENV_STORE_PATH,
};
pub use export::{
    read_table_csv, read_table_file, write_table_csv, CsvTableSink, ExportError, TableSink,
    TABLE_HEADERS,
};
pub use observability::{
    init_logging, log_app_start, log_run_summary, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    process_counter, run_pipeline, run_to_sink, ConsumptionTable, CounterFailure,
    CounterFailurePolicy, CounterOutput, PipelineConfig, PipelineError, PipelineReport, TableRow,
};
pub use reindex::{reindex, AlignedSeries, ReindexReport};
pub use segment::{segment_days, DayRecord, DayVector, ShapeError};
pub use store::{
    with_retry, InMemoryReadingSource, Reading, ReadingSource, RetryPolicy, SourceError,
    SqliteReadingStore,
};
