use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;

use crate::devices::stale_cutoff;
use crate::health::HealthWire;
use crate::recordings::{RetentionPolicy, UploadPolicy};

/// Configuration problems are fatal: the process reports them and exits.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// The service processes sharing this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Controller,
    Recorder,
}

impl ServiceKind {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::Controller => "controller",
            ServiceKind::Recorder => "recorder",
        }
    }

    pub fn default_health_port(&self) -> u16 {
        match self {
            ServiceKind::Controller => 9100,
            ServiceKind::Recorder => 9500,
        }
    }

    pub fn health_port_key(&self) -> &'static str {
        match self {
            ServiceKind::Controller => "SILVASONIC_CONTROLLER_PORT",
            ServiceKind::Recorder => "SILVASONIC_RECORDER_PORT",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Dev,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" | "text" => Ok(LogFormat::Dev),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected dev or json, got {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// flexi_logger spec, e.g. `info` or `debug, rocket=warn`
    pub level: String,
    pub format: LogFormat,
    /// Also write rotated log files here when set.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Dev,
            dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
    pub connect_timeout: Duration,
    pub busy_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            pool_size: 4,
            connect_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// One shared in-memory database. A second pooled connection would see
    /// a different, empty database, so the pool is capped at one.
    pub fn in_memory() -> Self {
        Self {
            pool_size: 1,
            ..Self::new(":memory:")
        }
    }
}

/// Everything a service reads from its environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub service: ServiceKind,
    pub database: DatabaseConfig,
    pub health_port: u16,
    pub health_wire: HealthWire,
    pub workspace: PathBuf,
    pub upload_policy: UploadPolicy,
    pub retention_policy: RetentionPolicy,
    /// Devices silent for longer than this are swept offline.
    pub device_timeout: Duration,
    pub device_sweep_interval: Duration,
    /// Free space the recording probe requires on the workspace disk.
    pub min_free_bytes: u64,
    pub logging: LogConfig,
}

impl Config {
    pub fn from_env(service: ServiceKind) -> Result<Self, ConfigError> {
        Self::from_lookup(service, |key| env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(service: ServiceKind, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let url = get("SILVASONIC_DATABASE_URL").ok_or(ConfigError::Missing("SILVASONIC_DATABASE_URL"))?;
        let mut database = DatabaseConfig::new(url.trim());
        database.pool_size = parse_or(&get, "SILVASONIC_DB_POOL_SIZE", database.pool_size)?;
        if database.pool_size == 0 {
            return Err(ConfigError::Invalid {
                key: "SILVASONIC_DB_POOL_SIZE",
                value: "0".to_string(),
                reason: "pool needs at least one connection".to_string(),
            });
        }

        let device_timeout = Duration::from_secs(parse_or(&get, "SILVASONIC_DEVICE_TIMEOUT_SECS", 120)?);
        if device_timeout.is_zero() || stale_cutoff(Utc::now().naive_utc(), device_timeout).is_none() {
            return Err(ConfigError::Invalid {
                key: "SILVASONIC_DEVICE_TIMEOUT_SECS",
                value: device_timeout.as_secs().to_string(),
                reason: "timeout must be positive and fit the calendar".to_string(),
            });
        }

        let device_sweep_interval = Duration::from_secs(parse_or(&get, "SILVASONIC_DEVICE_SWEEP_SECS", 30)?);
        if device_sweep_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "SILVASONIC_DEVICE_SWEEP_SECS",
                value: "0".to_string(),
                reason: "sweep interval must be at least one second".to_string(),
            });
        }

        let logging = LogConfig {
            level: get("SILVASONIC_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            format: parse_or(&get, "SILVASONIC_LOG_FORMAT", LogFormat::Dev)?,
            dir: get("SILVASONIC_LOG_DIR").map(PathBuf::from),
        };

        Ok(Self {
            service,
            database,
            health_port: parse_or(&get, service.health_port_key(), service.default_health_port())?,
            health_wire: parse_or(&get, "SILVASONIC_HEALTH_WIRE", HealthWire::Full)?,
            workspace: get("SILVASONIC_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/workspace")),
            upload_policy: parse_or(&get, "SILVASONIC_UPLOAD_POLICY", UploadPolicy::AnyRemote)?,
            retention_policy: parse_or(
                &get,
                "SILVASONIC_RETENTION_POLICY",
                RetentionPolicy::RequireUpload,
            )?,
            device_timeout,
            device_sweep_interval,
            min_free_bytes: parse_or(&get, "SILVASONIC_MIN_FREE_BYTES", 512 * 1024 * 1024)?,
            logging,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
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
    fn defaults_follow_the_service() {
        let env = lookup(&[("SILVASONIC_DATABASE_URL", "/data/silvasonic.db")]);

        let controller = Config::from_lookup(ServiceKind::Controller, &env).unwrap();
        assert_eq!(controller.health_port, 9100);
        assert_eq!(controller.health_wire, HealthWire::Full);
        assert_eq!(controller.upload_policy, UploadPolicy::AnyRemote);

        let recorder = Config::from_lookup(ServiceKind::Recorder, &env).unwrap();
        assert_eq!(recorder.health_port, 9500);
        assert_eq!(recorder.retention_policy, RetentionPolicy::RequireUpload);
        assert_eq!(recorder.device_timeout, Duration::from_secs(120));
    }

    #[test]
    fn port_override_is_per_service() {
        let env = lookup(&[
            ("SILVASONIC_DATABASE_URL", "db.sqlite"),
            ("SILVASONIC_CONTROLLER_PORT", "9200"),
        ]);
        assert_eq!(Config::from_lookup(ServiceKind::Controller, &env).unwrap().health_port, 9200);
        assert_eq!(Config::from_lookup(ServiceKind::Recorder, &env).unwrap().health_port, 9500);
    }

    #[test]
    fn missing_database_url_is_fatal() {
        let err = Config::from_lookup(ServiceKind::Recorder, lookup(&[("SILVASONIC_DATABASE_URL", "  ")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SILVASONIC_DATABASE_URL")));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = Config::from_lookup(
            ServiceKind::Controller,
            lookup(&[
                ("SILVASONIC_DATABASE_URL", "db.sqlite"),
                ("SILVASONIC_CONTROLLER_PORT", "ninety-one hundred"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SILVASONIC_CONTROLLER_PORT", .. }));

        let err = Config::from_lookup(
            ServiceKind::Controller,
            lookup(&[
                ("SILVASONIC_DATABASE_URL", "db.sqlite"),
                ("SILVASONIC_UPLOAD_POLICY", "most"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SILVASONIC_UPLOAD_POLICY", .. }));
    }

    #[test]
    fn sweep_settings_must_be_usable() {
        for (key, value) in [
            ("SILVASONIC_DEVICE_SWEEP_SECS", "0"),
            ("SILVASONIC_DEVICE_TIMEOUT_SECS", "0"),
            ("SILVASONIC_DEVICE_TIMEOUT_SECS", "10000000000000"),
        ] {
            let err = Config::from_lookup(
                ServiceKind::Controller,
                lookup(&[("SILVASONIC_DATABASE_URL", "db.sqlite"), (key, value)]),
            )
            .unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { key: k, .. } if k == key),
                "{key}={value}: {err}"
            );
        }
    }

    #[test]
    fn policies_and_wire_variant_parse() {
        let env = lookup(&[
            ("SILVASONIC_DATABASE_URL", "db.sqlite"),
            ("SILVASONIC_HEALTH_WIRE", "minimal"),
            ("SILVASONIC_UPLOAD_POLICY", "all"),
            ("SILVASONIC_RETENTION_POLICY", "allow-unuploaded"),
            ("SILVASONIC_LOG_FORMAT", "JSON"),
        ]);
        let config = Config::from_lookup(ServiceKind::Recorder, env).unwrap();
        assert_eq!(config.health_wire, HealthWire::Minimal);
        assert_eq!(config.upload_policy, UploadPolicy::AllActiveRemotes);
        assert_eq!(config.retention_policy, RetentionPolicy::AllowUnuploaded);
        assert_eq!(config.logging.format, LogFormat::Json);
    }
}
