//! Engine configuration.
//!
//! Every field has a default, so a partial JSON document or an empty
//! environment yields a working in-memory engine.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{millis, BackoffPolicy};
use crate::error::{Error, Result};
use crate::util::{is_http_url, normalize_text_option};

pub const DEFAULT_STABILITY_WINDOW: Duration = Duration::from_secs(2);
pub const DEFAULT_LEDGER_CAPACITY: usize = 10_000;

/// Settings for [`crate::engine::SyncEngine::open`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ledger database file; `None` keeps everything in memory
    pub db_path: Option<PathBuf>,
    /// Base URL of the remote authority
    pub remote_url: Option<String>,
    /// How long connectivity must hold before a transition is announced
    #[serde(with = "millis")]
    pub stability_window: Duration,
    /// Per-call limit on remote requests
    #[serde(with = "millis")]
    pub push_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Pending ledger entries allowed before appends fail with `StorageFull`
    pub ledger_capacity: usize,
    pub pull_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            remote_url: None,
            stability_window: DEFAULT_STABILITY_WINDOW,
            push_timeout: crate::sync::DEFAULT_PUSH_TIMEOUT,
            backoff: BackoffPolicy::default(),
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            pull_page_size: crate::sync::DEFAULT_PULL_PAGE_SIZE,
        }
    }
}

impl EngineConfig {
    /// Read `DLINK_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let db_path = optional_trimmed(&lookup, "DLINK_DB_PATH").map(PathBuf::from);
        let remote_url = optional_trimmed(&lookup, "DLINK_REMOTE_URL");

        let stability_window = millis_or_default(
            &lookup,
            "DLINK_STABILITY_WINDOW_MS",
            defaults.stability_window,
        )?;
        let push_timeout =
            millis_or_default(&lookup, "DLINK_PUSH_TIMEOUT_MS", defaults.push_timeout)?;
        let backoff = BackoffPolicy {
            base: millis_or_default(&lookup, "DLINK_BACKOFF_BASE_MS", defaults.backoff.base)?,
            multiplier: parse_or_default(
                &lookup,
                "DLINK_BACKOFF_MULTIPLIER",
                defaults.backoff.multiplier,
            )?,
            cap: millis_or_default(&lookup, "DLINK_BACKOFF_CAP_MS", defaults.backoff.cap)?,
        };
        let ledger_capacity = parse_or_default(
            &lookup,
            "DLINK_LEDGER_CAPACITY",
            defaults.ledger_capacity,
        )?;
        let pull_page_size =
            parse_or_default(&lookup, "DLINK_PULL_PAGE_SIZE", defaults.pull_page_size)?;

        let config = Self {
            db_path,
            remote_url,
            stability_window,
            push_timeout,
            backoff,
            ledger_capacity,
            pull_page_size,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.remote_url {
            if !is_http_url(url) {
                return Err(Error::Config(
                    "remote URL must start with http:// or https://".to_string(),
                ));
            }
        }
        if self.push_timeout.is_zero() {
            return Err(Error::Config("push timeout must be positive".to_string()));
        }
        if self.backoff.multiplier == 0 {
            return Err(Error::Config("backoff multiplier must be >= 1".to_string()));
        }
        if self.backoff.base.is_zero() || self.backoff.base > self.backoff.cap {
            return Err(Error::Config(
                "backoff base must be positive and no larger than the cap".to_string(),
            ));
        }
        if self.ledger_capacity == 0 {
            return Err(Error::Config("ledger capacity must be positive".to_string()));
        }
        if self.pull_page_size == 0 {
            return Err(Error::Config("pull page size must be positive".to_string()));
        }
        Ok(())
    }
}

fn optional_trimmed(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    normalize_text_option(lookup(key))
}

fn parse_or_default<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    optional_trimmed(lookup, key).map_or(Ok(default), |raw| {
        raw.parse::<T>()
            .map_err(|_| Error::Config(format!("{key} must be a non-negative integer")))
    })
}

fn millis_or_default(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    optional_trimmed(lookup, key).map_or(Ok(default), |raw| {
        raw.parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| Error::Config(format!("{key} must be a duration in milliseconds")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(values: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = values
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |name| values.get(name).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.stability_window, Duration::from_secs(2));
        assert_eq!(config.push_timeout, Duration::from_secs(10));
        assert_eq!(config.backoff.cap, Duration::from_secs(60));
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("DLINK_DB_PATH", " /var/lib/dlink/ledger.db "),
            ("DLINK_REMOTE_URL", "https://relay.example.org"),
            ("DLINK_PUSH_TIMEOUT_MS", "2500"),
            ("DLINK_BACKOFF_MULTIPLIER", "3"),
            ("DLINK_LEDGER_CAPACITY", "50"),
        ]))
        .unwrap();
        assert_eq!(config.db_path, Some(PathBuf::from("/var/lib/dlink/ledger.db")));
        assert_eq!(config.remote_url.as_deref(), Some("https://relay.example.org"));
        assert_eq!(config.push_timeout, Duration::from_millis(2_500));
        assert_eq!(config.backoff.multiplier, 3);
        assert_eq!(config.ledger_capacity, 50);
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(EngineConfig::from_lookup(lookup(&[("DLINK_REMOTE_URL", "relay.local")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("DLINK_PUSH_TIMEOUT_MS", "soon")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("DLINK_LEDGER_CAPACITY", "0")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[
            ("DLINK_BACKOFF_BASE_MS", "90000"),
            ("DLINK_BACKOFF_CAP_MS", "60000"),
        ]))
        .is_err());
    }

    #[test]
    fn json_fills_missing_fields() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"remote_url":"http://127.0.0.1:8080","push_timeout":500}"#)
                .unwrap();
        assert_eq!(config.push_timeout, Duration::from_millis(500));
        assert_eq!(config.stability_window, DEFAULT_STABILITY_WINDOW);
        assert_eq!(config.pull_page_size, 100);
    }
}
