//! Logging initialization and configuration.

use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::LogConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Timestamp style selected by `log.timestampFormat`
#[derive(Debug, Clone, PartialEq)]
enum Timer {
    Local,
    Utc,
    Rfc3339,
    Custom(String),
}

impl Timer {
    fn from_config(cfg: &LogConfig) -> Result<Self> {
        match cfg.timestamp_format.to_lowercase().as_str() {
            "rfc3339" => Ok(Timer::Rfc3339),
            "utc" => Ok(Timer::Utc),
            "custom" => cfg
                .custom_timestamp_format
                .clone()
                .map(Timer::Custom)
                .ok_or_else(|| {
                    anyhow::anyhow!("customTimestampFormat is required when timestampFormat is 'custom'")
                }),
            _ => Ok(Timer::Local),
        }
    }
}

impl FormatTime for Timer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        match self {
            Timer::Local => write!(w, "{}", chrono::Local::now().format(DEFAULT_TIME_FORMAT)),
            Timer::Utc => write!(w, "{}", chrono::Utc::now().format(DEFAULT_TIME_FORMAT)),
            Timer::Rfc3339 => write!(
                w,
                "{}",
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
            ),
            Timer::Custom(format) => write!(w, "{}", chrono::Local::now().format(format)),
        }
    }
}

/// Parse log level string to a filter directive.
fn parse_log_level(level_str: &str) -> Result<&'static str> {
    match level_str.to_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" => Ok("warn"),
        "error" => Ok("error"),
        _ => anyhow::bail!("Invalid log level: {}", level_str),
    }
}

/// Filter directives used when `RUST_LOG` is not set.
fn filter_directives(cfg: &LogConfig) -> Result<String> {
    let level = parse_log_level(&cfg.level)?;
    let mut directives = format!("isolab={}", level);

    let mut modules: Vec<(&String, &String)> = cfg.module_levels.iter().collect();
    modules.sort();
    for (module, module_level) in modules {
        if let Ok(parsed) = parse_log_level(module_level) {
            directives.push_str(&format!(",{}={}", module, parsed));
        }
    }
    Ok(directives)
}

fn fmt_layer<W>(cfg: &LogConfig, timer: Timer, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_timer(timer)
        .with_target(cfg.show_target)
        .with_thread_ids(cfg.show_thread_ids)
        .with_file(cfg.show_file)
        .with_line_number(cfg.show_file);

    match cfg.format.to_lowercase().as_str() {
        "json" => layer.json().boxed(),
        "compact" => layer.compact().boxed(),
        "pretty" => layer.pretty().boxed(),
        _ => layer.boxed(),
    }
}

/// Initialize the logging system based on configuration.
///
/// `RUST_LOG` overrides the configured levels. When file output is enabled
/// logs also go to a daily rolling file in `log_dir`; the returned guard
/// must be kept alive for the file writer to flush.
pub fn init_logging(cfg: &LogConfig, log_dir: &Path) -> Result<Option<WorkerGuard>> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(filter_directives(cfg)?),
    };
    let timer = Timer::from_config(cfg)?;

    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(cfg, timer.clone(), std::io::stderr, true)];

    let guard = if cfg.file_output {
        std::fs::create_dir_all(log_dir)?;
        // isolab.yyyy-MM-dd.log or isolab.yyyy-MM-dd.json
        let suffix = match cfg.format.to_lowercase().as_str() {
            "json" => "json",
            _ => "log",
        };
        let appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("isolab")
            .filename_suffix(suffix)
            .build(log_dir)
            .map_err(|e| anyhow::anyhow!("Failed to create rolling file appender: {}", e))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt_layer(cfg, timer, non_blocking, false));
        Some(guard)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::debug!(
        level = %cfg.level,
        format = %cfg.format,
        file_output = cfg.file_output,
        dir = %log_dir.display(),
        "Logging initialized"
    );
    Ok(guard)
}

/// Initialize simple logging for commands that don't load config.
pub fn init_simple_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "isolab=warn".into()))
        .try_init();
}
