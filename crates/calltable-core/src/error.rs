//! Error types for calltable-core
//!
//! The packet path (lookups, binding, protocol state updates, sweeps) never
//! fails: misses are `None`, exhausted capacity is an outcome value. Errors
//! only surface from configuration loading and from the external sinks the
//! background workers hand sessions to.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CalltableError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Sink '{sink}' failed: {message}")]
    Sink { sink: &'static str, message: String },
}

impl CalltableError {
    /// Build a sink failure for the named consumer
    pub fn sink(sink: &'static str, message: impl Into<String>) -> Self {
        Self::Sink {
            sink,
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for CalltableError {
    fn from(err: toml::de::Error) -> Self {
        CalltableError::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for CalltableError {
    fn from(err: serde_json::Error) -> Self {
        CalltableError::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CalltableError>;
