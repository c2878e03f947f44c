use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub bind_addr: String,
    /// Added before every sync call, for exercising client timeouts
    pub latency: Option<Duration>,
    /// Upper bound on `limit` for `GET /v1/alerts/since`
    pub max_page_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            latency: None,
            max_page_size: 500,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let bind_addr = value_or_default(&lookup, "DLINK_API_BIND_ADDR", &defaults.bind_addr);

        let latency_ms = value_or_default(&lookup, "DLINK_API_LATENCY_MS", "0")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid("DLINK_API_LATENCY_MS must be a positive integer".to_string())
            })?;
        let latency = (latency_ms > 0).then(|| Duration::from_millis(latency_ms));

        let max_page_size = value_or_default(
            &lookup,
            "DLINK_API_MAX_PAGE_SIZE",
            &defaults.max_page_size.to_string(),
        )
        .parse::<usize>()
        .map_err(|_| {
            ConfigError::Invalid("DLINK_API_MAX_PAGE_SIZE must be a positive integer".to_string())
        })?;
        if max_page_size == 0 {
            return Err(ConfigError::Invalid(
                "DLINK_API_MAX_PAGE_SIZE must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            latency,
            max_page_size,
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
