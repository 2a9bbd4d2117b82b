//! Environment-driven run configuration.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

use crate::calendar::DayBoundary;
use crate::clean::DegenerateDayPolicy;
use crate::pipeline::{CounterFailurePolicy, PipelineConfig};

pub const ENV_START_DAY: &str = "DAYGRID_START_DAY";
pub const ENV_OUTPUT_PATH: &str = "DAYGRID_OUTPUT_PATH";
pub const ENV_STORE_PATH: &str = "DAYGRID_STORE_PATH";
pub const ENV_MAX_RETRIES: &str = "DAYGRID_MAX_RETRIES";
pub const ENV_RETRY_BACKOFF_MS: &str = "DAYGRID_RETRY_BACKOFF_MS";
pub const ENV_ON_COUNTER_ERROR: &str = "DAYGRID_ON_COUNTER_ERROR";
pub const ENV_DEGENERATE_DAY: &str = "DAYGRID_DEGENERATE_DAY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub store_path: PathBuf,
    pub output_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            store_path: PathBuf::from("data/consumption.sqlite"),
            output_path: PathBuf::from("out/raw_consumptions.csv"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    InvalidVar {
        var: &'static str,
        value: String,
        reason: String,
    },
}

pub fn app_config_from_env() -> Result<AppConfig, ConfigError> {
    let mut config = AppConfig::default();

    if let Some(raw) = non_empty_var(ENV_START_DAY) {
        let hour = raw
            .parse::<u32>()
            .map_err(|_| invalid(ENV_START_DAY, &raw, "expected an hour between 0 and 23"))?;
        config.pipeline.boundary =
            DayBoundary::new(hour).map_err(|err| invalid(ENV_START_DAY, &raw, err.to_string()))?;
    }

    if let Some(raw) = non_empty_var(ENV_STORE_PATH) {
        config.store_path = PathBuf::from(raw);
    }

    if let Some(raw) = non_empty_var(ENV_OUTPUT_PATH) {
        config.output_path = PathBuf::from(raw);
    }

    if let Some(raw) = non_empty_var(ENV_MAX_RETRIES) {
        config.pipeline.retry.max_retries = raw
            .parse()
            .map_err(|_| invalid(ENV_MAX_RETRIES, &raw, "expected a non-negative integer"))?;
    }

    if let Some(raw) = non_empty_var(ENV_RETRY_BACKOFF_MS) {
        config.pipeline.retry.retry_backoff_ms = raw
            .parse()
            .map_err(|_| invalid(ENV_RETRY_BACKOFF_MS, &raw, "expected milliseconds"))?;
    }

    if let Some(raw) = non_empty_var(ENV_ON_COUNTER_ERROR) {
        config.pipeline.failure_policy = parse_failure_policy(&raw)
            .ok_or_else(|| invalid(ENV_ON_COUNTER_ERROR, &raw, "expected 'abort' or 'skip'"))?;
    }

    if let Some(raw) = non_empty_var(ENV_DEGENERATE_DAY) {
        config.pipeline.degenerate_policy = parse_degenerate_policy(&raw).ok_or_else(|| {
            invalid(
                ENV_DEGENERATE_DAY,
                &raw,
                "expected 'flag-negatives', 'invalidate' or 'fail'",
            )
        })?;
    }

    Ok(config)
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidVar {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_failure_policy(raw: &str) -> Option<CounterFailurePolicy> {
    match raw.to_ascii_lowercase().as_str() {
        "abort" => Some(CounterFailurePolicy::Abort),
        "skip" => Some(CounterFailurePolicy::ReportAndSkip),
        _ => None,
    }
}

fn parse_degenerate_policy(raw: &str) -> Option<DegenerateDayPolicy> {
    match raw.to_ascii_lowercase().as_str() {
        "flag-negatives" => Some(DegenerateDayPolicy::FlagNegativesOnly),
        "invalidate" => Some(DegenerateDayPolicy::InvalidateDay),
        "fail" => Some(DegenerateDayPolicy::Fail),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_env_vars;

    const ALL_VARS: [&str; 7] = [
        ENV_START_DAY,
        ENV_OUTPUT_PATH,
        ENV_STORE_PATH,
        ENV_MAX_RETRIES,
        ENV_RETRY_BACKOFF_MS,
        ENV_ON_COUNTER_ERROR,
        ENV_DEGENERATE_DAY,
    ];

    fn cleared_except<'a>(set: &[(&'a str, Option<&'a str>)]) -> Vec<(&'a str, Option<&'a str>)> {
        let mut vars: Vec<(&str, Option<&str>)> = ALL_VARS
            .iter()
            .filter(|key| !set.iter().any(|(k, _)| k == *key))
            .map(|key| (*key, None))
            .collect();
        vars.extend_from_slice(set);
        vars
    }

    #[test]
    fn defaults_when_env_missing() {
        let cfg = with_env_vars(&cleared_except(&[]), app_config_from_env).unwrap();
        assert_eq!(cfg, AppConfig::default());
        assert_eq!(cfg.pipeline.boundary.start_hour(), 5);
        assert_eq!(
            cfg.pipeline.failure_policy,
            CounterFailurePolicy::ReportAndSkip
        );
    }

    #[test]
    fn parses_every_variable() {
        let cfg = with_env_vars(
            &cleared_except(&[
                (ENV_START_DAY, Some("0")),
                (ENV_OUTPUT_PATH, Some("/tmp/out.csv")),
                (ENV_STORE_PATH, Some("/tmp/store.sqlite")),
                (ENV_MAX_RETRIES, Some("4")),
                (ENV_RETRY_BACKOFF_MS, Some("50")),
                (ENV_ON_COUNTER_ERROR, Some("ABORT")),
                (ENV_DEGENERATE_DAY, Some("invalidate")),
            ]),
            app_config_from_env,
        )
        .unwrap();

        assert_eq!(cfg.pipeline.boundary.start_hour(), 0);
        assert_eq!(cfg.output_path, PathBuf::from("/tmp/out.csv"));
        assert_eq!(cfg.store_path, PathBuf::from("/tmp/store.sqlite"));
        assert_eq!(cfg.pipeline.retry.max_retries, 4);
        assert_eq!(cfg.pipeline.retry.retry_backoff_ms, 50);
        assert_eq!(cfg.pipeline.failure_policy, CounterFailurePolicy::Abort);
        assert_eq!(
            cfg.pipeline.degenerate_policy,
            DegenerateDayPolicy::InvalidateDay
        );
    }

    #[test]
    fn rejects_out_of_range_start_day() {
        let err = with_env_vars(
            &cleared_except(&[(ENV_START_DAY, Some("24"))]),
            app_config_from_env,
        )
        .unwrap_err();

        match err {
            ConfigError::InvalidVar { var, value, .. } => {
                assert_eq!(var, ENV_START_DAY);
                assert_eq!(value, "24");
            }
        }
    }

    #[test]
    fn rejects_unknown_policies() {
        let err = with_env_vars(
            &cleared_except(&[(ENV_ON_COUNTER_ERROR, Some("retry"))]),
            app_config_from_env,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidVar {
                var: ENV_ON_COUNTER_ERROR,
                ..
            }
        ));
    }
}
