use std::io::Write;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use flexi_logger::{
    Age, Cleanup, Criterion, DeferredNow, Duplicate, FileSpec, Logger, LoggerHandle, Naming,
};
use log::Record;

use crate::config::{LogConfig, LogFormat};

static SERVICE: OnceLock<String> = OnceLock::new();

fn service_name() -> &'static str {
    SERVICE.get().map(String::as_str).unwrap_or("silvasonic")
}

/// Initialize logging for a service process.
///
/// Always writes to stdout; with a log directory configured it also keeps
/// daily rotated files there. `RUST_LOG` overrides the configured level.
pub fn init_logging(service: &str, config: &LogConfig) -> Result<LoggerHandle> {
    let _ = SERVICE.set(service.to_string());

    let spec = format!("{}, rocket=warn, hyper=warn", config.level);
    let format = match config.format {
        LogFormat::Dev => dev_format,
        LogFormat::Json => json_format,
    };

    let logger = Logger::try_with_env_or_str(&spec)
        .with_context(|| format!("invalid log specification {spec:?}"))?
        .format(format);

    let handle = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log directory {}", dir.display()))?;
            logger
                .log_to_file(
                    FileSpec::default()
                        .directory(dir)
                        .basename(service)
                        .suffix("log"),
                )
                .rotate(
                    Criterion::Age(Age::Day),
                    Naming::Numbers,
                    Cleanup::KeepLogFiles(7),
                )
                .duplicate_to_stdout(Duplicate::All)
                .start()?
        }
        None => logger.log_to_stdout().start()?,
    };

    Ok(handle)
}

fn dev_format(w: &mut dyn Write, _now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    write!(
        w,
        "{} {:<5} [{}] {}: {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        record.level(),
        service_name(),
        record.target(),
        record.args()
    )
}

/// One JSON object per line for log shippers.
fn json_format(w: &mut dyn Write, _now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    let line = serde_json::json!({
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "level": record.level().as_str().to_ascii_lowercase(),
        "service": service_name(),
        "logger": record.target(),
        "event": record.args().to_string(),
    });
    write!(w, "{line}")
}
