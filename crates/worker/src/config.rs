//! Worker configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use saga::{BackoffPolicy, OrchestratorConfig, SweeperConfig};

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` / `PORT`: bind address of the health and metrics server
///   (default: `"0.0.0.0"`, `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for JSON log lines, anything else for plain text
/// - `DATABASE_URL`: PostgreSQL connection string; unset runs in memory
/// - `DATABASE_MAX_CONNECTIONS` (default: `10`)
/// - `SWEEP_INTERVAL_SECS` (default: `30`), `STALE_AFTER_SECS` (default: `60`),
///   `SWEEP_CONCURRENCY` (default: `8`)
/// - `RETRY_BASE_DELAY_MS` (default: `100`), `RETRY_MAX_DELAY_MS` (default: `10000`)
/// - `CLAIM_TTL_SECS` (default: `60`), `MAX_CONFLICT_RETRIES` (default: `5`)
///
/// Values that fail to parse fall back to their default, as does a zero
/// `SWEEP_INTERVAL_SECS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub sweep_interval: Duration,
    pub stale_after: Duration,
    pub sweep_concurrency: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub claim_ttl: Duration,
    pub max_conflict_retries: u32,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |key: &str| get(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_or(&get, "PORT", defaults.port),
            log_level: get("RUST_LOG").unwrap_or(defaults.log_level),
            log_json: get("LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
            database_url: get("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections: parse_or(
                &get,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            ),
            sweep_interval: parse("SWEEP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            stale_after: parse("STALE_AFTER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_after),
            sweep_concurrency: parse_or(&get, "SWEEP_CONCURRENCY", defaults.sweep_concurrency),
            retry_base_delay: parse("RETRY_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            retry_max_delay: parse("RETRY_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_max_delay),
            claim_ttl: parse("CLAIM_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.claim_ttl),
            max_conflict_retries: parse_or(
                &get,
                "MAX_CONFLICT_RETRIES",
                defaults.max_conflict_retries,
            ),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_backoff(BackoffPolicy::new(self.retry_base_delay, self.retry_max_delay))
            .with_claim_ttl(self.claim_ttl)
            .with_max_conflict_retries(self.max_conflict_retries)
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: self.sweep_interval,
            stale_after: self.stale_after,
            concurrency: self.sweep_concurrency,
        }
    }
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        let orchestrator = OrchestratorConfig::default();
        let sweeper = SweeperConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_json: false,
            database_url: None,
            database_max_connections: 10,
            sweep_interval: sweeper.interval,
            stale_after: sweeper.stale_after,
            sweep_concurrency: sweeper.concurrency,
            retry_base_delay: orchestrator.backoff.base_delay,
            retry_max_delay: orchestrator.backoff.max_delay,
            claim_ttl: orchestrator.claim_ttl,
            max_conflict_retries: orchestrator.max_conflict_retries,
        }
    }
}
