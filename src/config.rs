use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::capacity::{CapacityPolicy, DEFAULT_ACTIVE_STUDENT_LIMIT};
use crate::retry::RetryConfig;
use crate::token::TokenPolicy;

/// Parses an optional variable, rejecting values outside the target type.
fn parsed<T, F>(lookup: &F, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("`{}` must be a non-negative integer in range, got `{}`", key, raw)),
        None => Ok(None),
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub request_timeout: Duration,
    pub capacity: CapacityPolicy,
    pub retry: RetryConfig,
    pub tokens: TokenPolicy,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind = match lookup("TUTORDESK_BIND") {
            Some(raw) => SocketAddr::from_str(raw.trim())
                .with_context(|| format!("`TUTORDESK_BIND` is not a socket address: `{}`", raw))?,
            None => SocketAddr::from(([127, 0, 0, 1], 3000)),
        };

        let limit: usize =
            parsed(&lookup, "TUTORDESK_ACTIVE_STUDENT_LIMIT")?.unwrap_or(DEFAULT_ACTIVE_STUDENT_LIMIT);
        let attempts: u32 = parsed(&lookup, "TUTORDESK_STORE_ATTEMPTS")?.unwrap_or(3);
        if attempts == 0 {
            return Err(anyhow!("`TUTORDESK_STORE_ATTEMPTS` must be at least 1"));
        }
        let delay: u64 = parsed(&lookup, "TUTORDESK_RETRY_DELAY_MS")?.unwrap_or(100);
        let max_connections: u32 = parsed(&lookup, "TUTORDESK_DB_MAX_CONNECTIONS")?.unwrap_or(5);
        let timeout_secs: u64 = parsed(&lookup, "TUTORDESK_REQUEST_TIMEOUT_SECS")?.unwrap_or(10);
        let tokens = match parsed::<u32, _>(&lookup, "TUTORDESK_PARENT_TOKEN_TTL_DAYS")? {
            Some(days) => chrono::Duration::try_days(i64::from(days))
                .map(TokenPolicy::with_ttl)
                .ok_or_else(|| anyhow!("`TUTORDESK_PARENT_TOKEN_TTL_DAYS` is out of range: `{}`", days))?,
            None => TokenPolicy::default(),
        };

        Ok(Config {
            bind,
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            max_connections,
            request_timeout: Duration::from_secs(timeout_secs),
            capacity: CapacityPolicy::new(limit),
            retry: RetryConfig {
                max_attempts: attempts,
                initial_delay: Duration::from_millis(delay),
                ..RetryConfig::default()
            },
            tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind, SocketAddr::from(([127, 0, 0, 1], 3000)));
        assert_eq!(cfg.capacity.limit, 20);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.tokens.ttl, None);
    }

    #[test]
    fn overrides() {
        let cfg = config(&[
            ("TUTORDESK_BIND", "0.0.0.0:8080"),
            ("TUTORDESK_ACTIVE_STUDENT_LIMIT", "35"),
            ("TUTORDESK_PARENT_TOKEN_TTL_DAYS", "90"),
            ("DATABASE_URL", "postgres://localhost/tutordesk"),
        ])
        .unwrap();
        assert_eq!(cfg.bind.port(), 8080);
        assert_eq!(cfg.capacity.limit, 35);
        assert_eq!(cfg.tokens.ttl, Some(chrono::Duration::days(90)));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/tutordesk"));
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = config(&[("TUTORDESK_ACTIVE_STUDENT_LIMIT", "twenty")]).unwrap_err();
        assert!(err.to_string().contains("TUTORDESK_ACTIVE_STUDENT_LIMIT"));
        assert!(config(&[("TUTORDESK_STORE_ATTEMPTS", "0")]).is_err());
        assert!(config(&[("TUTORDESK_BIND", "nowhere")]).is_err());
    }

    #[test]
    fn oversized_ttl_is_a_startup_error() {
        let err = config(&[("TUTORDESK_PARENT_TOKEN_TTL_DAYS", "200000000000000")]).unwrap_err();
        assert!(err.to_string().contains("TUTORDESK_PARENT_TOKEN_TTL_DAYS"));

        let err = config(&[("TUTORDESK_PARENT_TOKEN_TTL_DAYS", "99999999999999999999")]).unwrap_err();
        assert!(err.to_string().contains("TUTORDESK_PARENT_TOKEN_TTL_DAYS"));
    }

    #[test]
    fn out_of_range_counts_are_rejected() {
        let err = config(&[("TUTORDESK_DB_MAX_CONNECTIONS", "4294967296")]).unwrap_err();
        assert!(err.to_string().contains("TUTORDESK_DB_MAX_CONNECTIONS"));

        let err = config(&[("TUTORDESK_STORE_ATTEMPTS", "4294967297")]).unwrap_err();
        assert!(err.to_string().contains("TUTORDESK_STORE_ATTEMPTS"));
    }
}
