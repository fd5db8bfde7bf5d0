use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

use crate::access::AccessCodeConfig;
use crate::model::{MINUTE_MS, Ms};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
}

/// Runtime knobs, read from `RESV_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub timezone: Tz,
    /// No URL means the in-memory provider.
    pub provider_url: Option<String>,
    pub provider_api_key: String,
    pub provider_timeout: Duration,
    pub code_lead: Ms,
    pub code_trail: Ms,
    pub sweep_interval: Duration,
    pub sweep_concurrency: usize,
    pub span_rebuild_interval: Duration,
    pub staleness_bound: Duration,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            timezone: chrono_tz::Europe::Helsinki,
            provider_url: None,
            provider_api_key: String::new(),
            provider_timeout: Duration::from_millis(10_000),
            code_lead: 10 * MINUTE_MS,
            code_trail: 5 * MINUTE_MS,
            sweep_interval: Duration::from_secs(300),
            sweep_concurrency: 8,
            span_rebuild_interval: Duration::from_secs(3600),
            staleness_bound: Duration::from_secs(600),
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparsable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        fn or<T>(value: Option<T>, default: T) -> T {
            value.unwrap_or(default)
        }
        let d = Config::default();

        let timezone = match lookup("RESV_TIMEZONE") {
            Some(name) => Tz::from_str(name.trim()).map_err(|_| ConfigError::UnknownTimezone(name))?,
            None => d.timezone,
        };

        Ok(Config {
            data_dir: lookup("RESV_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            timezone,
            provider_url: lookup("RESV_PROVIDER_URL").filter(|s| !s.trim().is_empty()),
            provider_api_key: lookup("RESV_PROVIDER_API_KEY").unwrap_or(d.provider_api_key),
            provider_timeout: or(
                parsed("RESV_PROVIDER_TIMEOUT_MS").map(Duration::from_millis),
                d.provider_timeout,
            ),
            code_lead: or(
                parsed("RESV_CODE_LEAD_MINUTES").map(|m| m as Ms * MINUTE_MS),
                d.code_lead,
            ),
            code_trail: or(
                parsed("RESV_CODE_TRAIL_MINUTES").map(|m| m as Ms * MINUTE_MS),
                d.code_trail,
            ),
            sweep_interval: or(
                parsed("RESV_SWEEP_INTERVAL_SECS").map(Duration::from_secs),
                d.sweep_interval,
            ),
            sweep_concurrency: or(
                parsed("RESV_SWEEP_CONCURRENCY").map(|n| n.max(1) as usize),
                d.sweep_concurrency,
            ),
            span_rebuild_interval: or(
                parsed("RESV_SPAN_REBUILD_INTERVAL_SECS").map(Duration::from_secs),
                d.span_rebuild_interval,
            ),
            staleness_bound: or(
                parsed("RESV_STALENESS_BOUND_SECS").map(Duration::from_secs),
                d.staleness_bound,
            ),
            compact_threshold: or(parsed("RESV_COMPACT_THRESHOLD"), d.compact_threshold),
            metrics_port: lookup("RESV_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
        })
    }

    pub fn access_code(&self) -> AccessCodeConfig {
        AccessCodeConfig {
            lead: self.code_lead,
            trail: self.code_trail,
            provider_timeout: self.provider_timeout,
            sweep_concurrency: self.sweep_concurrency,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.timezone, chrono_tz::Europe::Helsinki);
        assert_eq!(config.code_lead, 10 * MINUTE_MS);
        assert_eq!(config.code_trail, 5 * MINUTE_MS);
        assert!(config.provider_url.is_none());
        assert!(config.metrics_port.is_none());
        assert_eq!(config.wal_path(), PathBuf::from("./data/reservations.wal"));
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("RESV_TIMEZONE", "UTC"),
            ("RESV_PROVIDER_URL", "https://locks.example"),
            ("RESV_PROVIDER_TIMEOUT_MS", "2500"),
            ("RESV_CODE_LEAD_MINUTES", "15"),
            ("RESV_SWEEP_CONCURRENCY", "0"),
            ("RESV_METRICS_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(config.timezone, chrono_tz::UTC);
        assert_eq!(config.provider_url.as_deref(), Some("https://locks.example"));
        assert_eq!(config.provider_timeout, Duration::from_millis(2500));
        assert_eq!(config.access_code().lead, 15 * MINUTE_MS);
        assert_eq!(config.sweep_concurrency, 1);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("RESV_SWEEP_INTERVAL_SECS", "soon"),
            ("RESV_COMPACT_THRESHOLD", "-3"),
            ("RESV_PROVIDER_URL", "  "),
        ]))
        .unwrap();
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.compact_threshold, 1000);
        assert!(config.provider_url.is_none());
    }

    #[test]
    fn unknown_timezone_is_an_error() {
        assert_eq!(
            Config::from_lookup(lookup(&[("RESV_TIMEZONE", "Mars/Olympus")])).unwrap_err(),
            ConfigError::UnknownTimezone("Mars/Olympus".into())
        );
    }
}
