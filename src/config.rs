use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::engine::EngineError;
use crate::limits::MAX_TICKET_PREFIX_LEN;

/// Knobs the engine reads on every operation.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on any single lock wait.
    pub lock_timeout: Duration,
    pub ticket_prefix: String,
    /// Per started hour when no pricing rule applies.
    pub fallback_hourly_rate: Decimal,
    /// Grace after expected exit stamped onto new reservations.
    pub grace_period_minutes: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            ticket_prefix: "PKM".into(),
            fallback_hourly_rate: Decimal::from(5),
            grace_period_minutes: 15,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.lock_timeout.is_zero() {
            return Err(EngineError::InvalidConfig("lock timeout must be positive".into()));
        }
        if self.ticket_prefix.is_empty()
            || self.ticket_prefix.len() > MAX_TICKET_PREFIX_LEN
            || !self.ticket_prefix.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(EngineError::InvalidConfig(format!(
                "ticket prefix must be 1-{MAX_TICKET_PREFIX_LEN} ASCII alphanumerics"
            )));
        }
        if self.fallback_hourly_rate.is_sign_negative() && !self.fallback_hourly_rate.is_zero() {
            return Err(EngineError::InvalidConfig("fallback rate must not be negative".into()));
        }
        Ok(())
    }
}

/// Process-level settings, read from `PARKLINE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compact_threshold: 1000,
            metrics_port: None,
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let defaults = Config::default();
        let engine = EngineConfig {
            lock_timeout: parse_var(&lookup, "PARKLINE_LOCK_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.engine.lock_timeout),
            ticket_prefix: lookup("PARKLINE_TICKET_PREFIX").unwrap_or(defaults.engine.ticket_prefix),
            fallback_hourly_rate: parse_var(&lookup, "PARKLINE_FALLBACK_HOURLY_RATE")?
                .unwrap_or(defaults.engine.fallback_hourly_rate),
            grace_period_minutes: parse_var(&lookup, "PARKLINE_GRACE_MINUTES")?
                .unwrap_or(defaults.engine.grace_period_minutes),
        };
        engine.validate()?;

        let compact_threshold: u64 =
            parse_var(&lookup, "PARKLINE_COMPACT_THRESHOLD")?.unwrap_or(defaults.compact_threshold);
        if compact_threshold == 0 {
            return Err(EngineError::InvalidConfig("compact threshold must be positive".into()));
        }

        Ok(Self {
            data_dir: lookup("PARKLINE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            compact_threshold,
            metrics_port: parse_var(&lookup, "PARKLINE_METRICS_PORT")?,
            engine,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, EngineError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| EngineError::InvalidConfig(format!("{key}: cannot parse {raw:?}"))),
    }
}
