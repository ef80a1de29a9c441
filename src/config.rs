use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::worker::RetryPolicy;

/// Process configuration, read once from `MEETBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Shared password for every pgwire login.
    pub password: String,
    /// Login names that act with the admin role.
    pub admin_users: HashSet<String>,
    pub max_connections: usize,
    pub workers: usize,
    pub retry: RetryPolicy,
    /// WAL appends since the last compaction that trigger a rewrite.
    pub compact_threshold: u64,
    pub catalog_path: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "meetbook".into(),
            admin_users: HashSet::from(["admin".to_string()]),
            max_connections: 256,
            workers: 1,
            retry: RetryPolicy::default(),
            compact_threshold: 1000,
            catalog_path: None,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let admin_users = match get("MEETBOOK_ADMIN_USERS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            None => defaults.admin_users,
        };

        let workers = parse_or(get("MEETBOOK_WORKERS"), "MEETBOOK_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ConfigError::Invalid {
                var: "MEETBOOK_WORKERS",
                value: "0".into(),
            });
        }
        let max_attempts = parse_or(
            get("MEETBOOK_MAX_ATTEMPTS"),
            "MEETBOOK_MAX_ATTEMPTS",
            defaults.retry.max_attempts,
        )?
        .max(1);
        let base_ms: u64 = parse_or(
            get("MEETBOOK_RETRY_BASE_MS"),
            "MEETBOOK_RETRY_BASE_MS",
            defaults.retry.base_backoff.as_millis() as u64,
        )?;
        let max_ms: u64 = parse_or(
            get("MEETBOOK_RETRY_MAX_MS"),
            "MEETBOOK_RETRY_MAX_MS",
            defaults.retry.max_backoff.as_millis() as u64,
        )?;

        Ok(Self {
            bind: get("MEETBOOK_BIND").unwrap_or(defaults.bind),
            port: parse_or(get("MEETBOOK_PORT"), "MEETBOOK_PORT", defaults.port)?,
            data_dir: get("MEETBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: get("MEETBOOK_PASSWORD").unwrap_or(defaults.password),
            admin_users,
            max_connections: parse_or(
                get("MEETBOOK_MAX_CONNECTIONS"),
                "MEETBOOK_MAX_CONNECTIONS",
                defaults.max_connections,
            )?,
            workers,
            retry: RetryPolicy {
                max_attempts,
                base_backoff: Duration::from_millis(base_ms),
                max_backoff: Duration::from_millis(max_ms.max(base_ms)),
            },
            compact_threshold: parse_or(
                get("MEETBOOK_COMPACT_THRESHOLD"),
                "MEETBOOK_COMPACT_THRESHOLD",
                defaults.compact_threshold,
            )?,
            catalog_path: get("MEETBOOK_CATALOG").map(PathBuf::from),
            metrics_port: get("MEETBOOK_METRICS_PORT")
                .map(|v| parse("MEETBOOK_METRICS_PORT", v))
                .transpose()?,
            tls_cert: get("MEETBOOK_TLS_CERT"),
            tls_key: get("MEETBOOK_TLS_KEY"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}

fn parse_or<T: FromStr>(value: Option<String>, var: &'static str, default: T) -> Result<T, ConfigError> {
    match value {
        Some(v) => parse(var, v),
        None => Ok(default),
    }
}
