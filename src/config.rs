//! Runtime configuration from environment variables
//!
//! Every knob has a default; binaries call `dotenv().ok()` first so a local
//! `.env` file can override them.

use crate::aggregate::timezone::{parse_utc_offset, OwnerTimezones};
use crate::capture::dead_letter::DeadLetterBackend;
use crate::relay::stream::PartitionStrategy;
use std::env;
use std::str::FromStr;

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Upstream subscription settings
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Database holding the `change_notifications` outbox
    pub source_db_path: String,
    /// `schema.table` filter
    pub tables: Vec<String>,
    /// Last acknowledged outbox id from a previous run
    pub resume_token: Option<u64>,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_retries: u32,
}

/// Relay, aggregation and retention settings
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub db_path: String,
    pub channel_buffer: usize,
    pub dedup_window_secs: i64,
    pub dedup_max_per_id: usize,
    pub publish_retry_window_secs: i64,
    pub publish_max_retries: u32,
    pub partition_strategy: PartitionStrategy,
    pub window_grace_secs: i64,
    pub stream_retention_days: i64,
    pub timezones: OwnerTimezones,
    pub metric_registry_path: Option<String>,
    pub dead_letter_backend: DeadLetterBackend,
    pub dead_letter_path: String,
    pub consumer_poll_interval_ms: u64,
    pub maintenance_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub capture: CaptureConfig,
    pub relay: RelayConfig,
    pub rust_log: String,
}

fn parsed_or<T: FromStr>(var: &str, default: T) -> T {
    match env::var(var) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("Invalid {} '{}', using default", var, raw);
                default
            }
        },
        Err(_) => default,
    }
}

impl CaptureConfig {
    pub fn from_env(default_db_path: &str) -> Result<Self, ConfigError> {
        let tables: Vec<String> = env::var("CAPTURE_TABLES")
            .unwrap_or_else(|_| "public.baby_logs,public.mom_logs".to_string())
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        let resume_token = match env::var("CAPTURE_RESUME_TOKEN") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse::<u64>().map_err(|_| {
                ConfigError::InvalidValue(format!("CAPTURE_RESUME_TOKEN must be an integer, got '{}'", raw))
            })?),
            _ => None,
        };

        Ok(Self {
            source_db_path: env::var("CRADLEFLOW_SOURCE_DB_PATH")
                .unwrap_or_else(|_| default_db_path.to_string()),
            tables,
            resume_token,
            reconnect_initial_ms: parsed_or("CAPTURE_RECONNECT_INITIAL_MS", 500),
            reconnect_max_ms: parsed_or("CAPTURE_RECONNECT_MAX_MS", 60_000),
            reconnect_max_retries: parsed_or("CAPTURE_RECONNECT_MAX_RETRIES", 10),
        })
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let partition_strategy = match env::var("PARTITION_STRATEGY") {
            Ok(raw) => PartitionStrategy::from_str(&raw).ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "PARTITION_STRATEGY must be 'single' or 'entity_type', got '{}'",
                    raw
                ))
            })?,
            Err(_) => PartitionStrategy::Single,
        };

        let default_offset = match env::var("DEFAULT_UTC_OFFSET") {
            Ok(raw) => parse_utc_offset(&raw).ok_or_else(|| {
                ConfigError::InvalidValue(format!("DEFAULT_UTC_OFFSET '{}' is not like +08:00", raw))
            })?,
            Err(_) => OwnerTimezones::utc().default_offset(),
        };
        let mut timezones = OwnerTimezones::new(default_offset);
        if let Ok(pairs) = env::var("OWNER_UTC_OFFSETS") {
            timezones
                .extend_from_pairs(&pairs)
                .map_err(ConfigError::InvalidValue)?;
        }

        let dead_letter_backend = match env::var("DEAD_LETTER_BACKEND") {
            Ok(raw) => DeadLetterBackend::from_str(&raw).ok_or_else(|| {
                ConfigError::InvalidValue(format!(
                    "DEAD_LETTER_BACKEND must be 'jsonl' or 'sqlite', got '{}'",
                    raw
                ))
            })?,
            Err(_) => DeadLetterBackend::Jsonl,
        };

        let channel_buffer: usize = parsed_or("RELAY_CHANNEL_BUFFER", 10_000);
        if channel_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "RELAY_CHANNEL_BUFFER must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            db_path: env::var("CRADLEFLOW_DB_PATH")
                .unwrap_or_else(|_| "/var/lib/cradleflow/cradleflow.db".to_string()),
            channel_buffer,
            dedup_window_secs: parsed_or("DEDUP_WINDOW_SECS", 600),
            dedup_max_per_id: parsed_or("DEDUP_MAX_PER_ID", 16),
            publish_retry_window_secs: parsed_or("PUBLISH_RETRY_WINDOW_SECS", 600),
            publish_max_retries: parsed_or("PUBLISH_MAX_RETRIES", 5),
            partition_strategy,
            window_grace_secs: parsed_or("WINDOW_GRACE_SECS", 2 * 24 * 3600),
            stream_retention_days: parsed_or("STREAM_RETENTION_DAYS", 30),
            timezones,
            metric_registry_path: env::var("METRIC_REGISTRY_PATH").ok().filter(|p| !p.is_empty()),
            dead_letter_backend,
            dead_letter_path: env::var("DEAD_LETTER_PATH")
                .unwrap_or_else(|_| "dead_letters/capture.jsonl".to_string()),
            consumer_poll_interval_ms: parsed_or("CONSUMER_POLL_INTERVAL_MS", 500),
            maintenance_interval_ms: parsed_or("MAINTENANCE_INTERVAL_MS", 60_000),
        })
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let relay = RelayConfig::from_env()?;
        let capture = CaptureConfig::from_env(&relay.db_path)?;
        Ok(Self {
            capture,
            relay,
            rust_log: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}
