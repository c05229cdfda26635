//! Runtime configuration.
//!
//! Loaded from environment variables (a `.env` file is honoured) with defaults
//! for everything except the API credentials.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::enricher::EnricherConfig;
use crate::error::{LookThroughError, Result};
use crate::retry::RetryConfig;

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Token for the N-PORT filings API.
    pub sec_api_token: Option<String>,
    pub openfigi_api_key: Option<String>,
    pub enricher: EnricherConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EnricherConfig::default();
        let max_retries = parse_or(&lookup, "LOOK_THROUGH_MAX_RETRIES", defaults.retry.max_retries)?;
        let timeout_secs = parse_or(
            &lookup,
            "LOOK_THROUGH_TICKER_TIMEOUT_SECS",
            defaults.ticker_timeout.as_secs_f64(),
        )?;
        if !(timeout_secs.is_finite() && timeout_secs > 0.0) {
            return Err(LookThroughError::Config(format!(
                "LOOK_THROUGH_TICKER_TIMEOUT_SECS must be positive, got {}",
                timeout_secs
            )));
        }

        let ticker_timeout = Duration::try_from_secs_f64(timeout_secs).map_err(|e| {
            LookThroughError::Config(format!(
                "LOOK_THROUGH_TICKER_TIMEOUT_SECS out of range ({}): {}",
                timeout_secs, e
            ))
        })?;

        let enricher = EnricherConfig {
            concurrency: parse_positive(&lookup, "LOOK_THROUGH_CONCURRENCY", defaults.concurrency)?,
            ticker_timeout,
            retry: RetryConfig::default().with_max_retries(max_retries),
            batch_size: parse_positive(&lookup, "LOOK_THROUGH_BATCH_SIZE", defaults.batch_size)?,
            checkpoint_every: parse_positive(
                &lookup,
                "LOOK_THROUGH_CHECKPOINT_EVERY",
                defaults.checkpoint_every,
            )?,
            checkpoint_path: None,
            compositions_dir: None,
        };

        Ok(Self {
            sec_api_token: non_empty(lookup("SEC_API_TOKEN")),
            openfigi_api_key: non_empty(lookup("OPENFIGI_API_KEY")),
            enricher,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match non_empty(lookup(key)) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| LookThroughError::Config(format!("Invalid {}: {}", key, raw))),
    }
}

fn parse_positive<F>(lookup: &F, key: &str, default: usize) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_or(lookup, key, default)? {
        0 => Err(LookThroughError::Config(format!("{} must be at least 1", key))),
        value => Ok(value),
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
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.sec_api_token, None);
        assert_eq!(config.enricher.concurrency, 4);
        assert_eq!(config.enricher.ticker_timeout, Duration::from_secs(5));
        assert_eq!(config.enricher.retry.max_retries, 3);
        assert_eq!(config.enricher.batch_size, 25);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("SEC_API_TOKEN", "token"),
            ("OPENFIGI_API_KEY", " "),
            ("LOOK_THROUGH_CONCURRENCY", "8"),
            ("LOOK_THROUGH_TICKER_TIMEOUT_SECS", "2.5"),
            ("LOOK_THROUGH_MAX_RETRIES", "0"),
        ]))
        .unwrap();
        assert_eq!(config.sec_api_token.as_deref(), Some("token"));
        assert_eq!(config.openfigi_api_key, None);
        assert_eq!(config.enricher.concurrency, 8);
        assert_eq!(config.enricher.ticker_timeout, Duration::from_millis(2500));
        assert_eq!(config.enricher.retry.max_retries, 0);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        for pairs in [
            [("LOOK_THROUGH_CONCURRENCY", "many")],
            [("LOOK_THROUGH_BATCH_SIZE", "0")],
            [("LOOK_THROUGH_TICKER_TIMEOUT_SECS", "-1")],
            [("LOOK_THROUGH_TICKER_TIMEOUT_SECS", "1e30")],
        ] {
            let result = Config::from_lookup(lookup(&pairs));
            assert!(matches!(result, Err(LookThroughError::Config(_))));
        }
    }
}
