// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for llmtap.
//!
//! This module provides strongly-typed errors for the instrumentation layer,
//! using `thiserror` for ergonomic error definitions and `anyhow` for error
//! propagation.
//!
//! Large parts of this crate deliberately do *not* return errors: event
//! publication is fire-and-forget, and observability failures must never
//! surface into the instrumented call's own control flow. The types here
//! cover the surfaces where a caller can actually act on the failure
//! (registering configs, stamping events).

use thiserror::Error;

/// Errors that can occur while building or loading instrumentation configs.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Duplicate channel: {0}")]
    DuplicateChannel(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for RegistryError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Errors that can occur when attaching an event to an invocation.
///
/// Policy: an event that cannot be correlated is dropped with a diagnostic.
/// It is never attached to a guessed invocation - misattribution is worse
/// than a missing span.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("No active invocation in the current execution context")]
    NoActiveInvocation,

    #[error("Event for channel '{event}' emitted inside invocation of channel '{current}'")]
    ChannelMismatch { current: String, event: String },
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: RegistryError = io_err.into();
        assert!(matches!(err, RegistryError::IoError(_)));
    }

    #[test]
    fn test_registry_error_from_json() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("not json");
        let err: RegistryError = result.unwrap_err().into();
        assert!(matches!(err, RegistryError::JsonError(_)));
    }

    #[test]
    fn test_registry_error_from_yaml() {
        let result: std::result::Result<serde_yaml::Value, _> = serde_yaml::from_str("[unclosed");
        let err: RegistryError = result.unwrap_err().into();
        assert!(matches!(err, RegistryError::YamlError(_)));
    }

    #[test]
    fn test_correlation_error_display() {
        let err = CorrelationError::NoActiveInvocation;
        assert!(err.to_string().contains("No active invocation"));

        let err = CorrelationError::ChannelMismatch {
            current: "a".to_string(),
            event: "b".to_string(),
        };
        let display = err.to_string();
        assert!(display.contains("'a'"));
        assert!(display.contains("'b'"));
    }
}
