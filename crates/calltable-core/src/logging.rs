//! Logging setup and per-session spans
//!
//! The engine only emits `tracing` events. Retirement, persistence and
//! audio hand-off run inside [`session_span`], so every event they log
//! carries the session's call-id, serial and kind. Binaries install a
//! subscriber with [`setup_logging`], driven by the `[logging]` table of
//! [`CalltableConfig`](crate::CalltableConfig).

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::{Level, Span, Subscriber};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::EnvFilter;

use crate::call::Call;
use crate::error::{CalltableError, Result};

/// Subscriber settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level (trace, debug, info, warn, error); `RUST_LOG` directives
    /// are applied on top
    pub level: String,
    /// One JSON document per event instead of text
    pub json: bool,
    /// Include file and line of the emitting call site
    pub file_info: bool,
    /// Log span enter/exit
    pub log_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_info: false,
            log_spans: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }

    pub fn parsed_level(&self) -> Result<Level> {
        parse_log_level(&self.level)
    }
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| CalltableError::Config(format!("Invalid log level: {}", level)))
}

/// Build a subscriber writing to `writer` without installing it
pub fn build_subscriber<W>(config: &LoggingConfig, writer: W) -> Result<Box<dyn Subscriber + Send + Sync>>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let level = config.parsed_level()?;
    let filter = EnvFilter::from_default_env().add_directive(LevelFilter::from_level(level).into());

    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info)
        .with_writer(writer);

    if config.json {
        Ok(Box::new(builder.json().finish()))
    } else {
        Ok(Box::new(builder.finish()))
    }
}

/// Install the global subscriber on stdout. Fails if one is already set.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let subscriber = build_subscriber(config, std::io::stdout)?;
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| CalltableError::Config(format!("logging already initialized: {}", e)))?;
    tracing::info!("Starting voipcorr v{}", crate::VERSION);
    Ok(())
}

/// Span scoping everything logged on behalf of one session
pub fn session_span(call: &Call) -> Span {
    tracing::info_span!(
        "session",
        call_id = %String::from_utf8_lossy(call.call_id()),
        serial = call.serial(),
        kind = ?call.kind(),
    )
}
