use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::engine::{BookingPolicy, EngineError, EngineSettings};
use crate::limits::MAX_ADVANCE_WINDOW_MS;
use crate::model::{DAY_MS, MINUTE_MS};
use crate::sweeper::SweepSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("both MEDSLOT_TLS_CERT and MEDSLOT_TLS_KEY must be set, or neither")]
    PartialTls,
    #[error("invalid booking policy: {0}")]
    Policy(#[from] EngineError),
}

/// Everything the server reads from its environment, parsed once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub engine: EngineSettings,
    pub sweep: SweepSettings,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take their defaults; set but
    /// unparsable keys are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());
        fn parse<T: std::str::FromStr>(var: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
            raw.map(|value| {
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Invalid { var, value: value.clone() })
            })
            .transpose()
        }

        let policy = BookingPolicy {
            min_notice_ms: parse::<i64>("MEDSLOT_MIN_NOTICE_MINUTES", get("MEDSLOT_MIN_NOTICE_MINUTES"))?
                .map_or(BookingPolicy::default().min_notice_ms, |m| m.saturating_mul(MINUTE_MS)),
            max_advance_ms: parse::<i64>("MEDSLOT_MAX_ADVANCE_DAYS", get("MEDSLOT_MAX_ADVANCE_DAYS"))?
                .map_or(BookingPolicy::default().max_advance_ms, |d| d.saturating_mul(DAY_MS)),
        };
        policy.validate()?;
        if policy.max_advance_ms > MAX_ADVANCE_WINDOW_MS {
            return Err(ConfigError::Invalid {
                var: "MEDSLOT_MAX_ADVANCE_DAYS",
                value: (policy.max_advance_ms / DAY_MS).to_string(),
            });
        }

        let defaults = EngineSettings::default();
        let engine = EngineSettings {
            policy,
            commit_timeout: parse::<u64>("MEDSLOT_COMMIT_TIMEOUT_MS", get("MEDSLOT_COMMIT_TIMEOUT_MS"))?
                .map_or(defaults.commit_timeout, Duration::from_millis),
            no_show_grace_ms: parse::<i64>("MEDSLOT_NO_SHOW_GRACE_MINUTES", get("MEDSLOT_NO_SHOW_GRACE_MINUTES"))?
                .map_or(defaults.no_show_grace_ms, |m| m.saturating_mul(MINUTE_MS)),
            reminder_lead_ms: parse::<i64>("MEDSLOT_REMINDER_LEAD_HOURS", get("MEDSLOT_REMINDER_LEAD_HOURS"))?
                .map_or(defaults.reminder_lead_ms, |h| h * 60 * MINUTE_MS),
        };

        let sweep_defaults = SweepSettings::default();
        let sweep = SweepSettings {
            interval: parse::<u64>("MEDSLOT_SWEEP_INTERVAL_SECS", get("MEDSLOT_SWEEP_INTERVAL_SECS"))?
                .map_or(sweep_defaults.interval, Duration::from_secs),
            compact_threshold: parse("MEDSLOT_COMPACT_THRESHOLD", get("MEDSLOT_COMPACT_THRESHOLD"))?
                .unwrap_or(sweep_defaults.compact_threshold),
        };

        let tls_cert = get("MEDSLOT_TLS_CERT");
        let tls_key = get("MEDSLOT_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        Ok(Self {
            bind: get("MEDSLOT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse("MEDSLOT_PORT", get("MEDSLOT_PORT"))?.unwrap_or(5433),
            data_dir: get("MEDSLOT_DATA_DIR").map_or_else(|| PathBuf::from("./data"), PathBuf::from),
            password: get("MEDSLOT_PASSWORD").unwrap_or_else(|| "medslot".into()),
            max_connections: parse("MEDSLOT_MAX_CONNECTIONS", get("MEDSLOT_MAX_CONNECTIONS"))?.unwrap_or(256),
            metrics_port: parse("MEDSLOT_METRICS_PORT", get("MEDSLOT_METRICS_PORT"))?,
            tls_cert,
            tls_key,
            engine,
            sweep,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
