// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Opt-in subscriber for llmtap's own diagnostics.
//!
//! The crate never logs payloads and never installs anything on its own: it
//! reports its health through `tracing` under the `llmtap` target and
//! inherits whatever subscriber the host application configured. The
//! signals that show up there are the ones this crate cannot turn into
//! errors without breaking an instrumented call - events dropped because no
//! invocation context could be resolved, subscribers that panicked
//! mid-delivery, lifecycle events violating their invocation's causal
//! order, and streams emitting after their terminal signal.
//!
//! Embedders with no subscriber of their own can install the minimal setup
//! here; applications that already initialize `tracing` should not.

use std::io;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directive: only this crate's warnings and errors.
const DEFAULT_DIRECTIVE: &str = "llmtap=warn";

/// How llmtap's own diagnostics are surfaced.
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    /// Filter directive for the installed subscriber. `RUST_LOG` takes
    /// precedence when set in the environment.
    pub directive: String,

    /// Whether to use ANSI colors in output.
    pub ansi_colors: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            directive: DEFAULT_DIRECTIVE.to_string(),
            ansi_colors: true,
        }
    }
}

impl DiagnosticsConfig {
    /// Surface per-invocation detail too: dropped-event reasons, stream
    /// phase transitions, span hand-offs.
    pub fn verbose() -> Self {
        Self {
            directive: "llmtap=trace".to_string(),
            ..Self::default()
        }
    }

    /// Replace the filter directive.
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = directive.into();
        self
    }

    /// Enable or disable ANSI colors.
    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi_colors = ansi;
        self
    }
}

/// Install a minimal global subscriber for llmtap diagnostics.
///
/// # Errors
///
/// Fails if a global subscriber is already installed - this function never
/// replaces the host application's own tracing setup.
pub fn init_diagnostics(config: &DiagnosticsConfig) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .compact()
                .with_target(true)
                .with_ansi(config.ansi_colors),
        )
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_config_default() {
        let config = DiagnosticsConfig::default();
        assert_eq!(config.directive, "llmtap=warn");
        assert!(config.ansi_colors);
    }

    #[test]
    fn test_diagnostics_config_verbose() {
        let config = DiagnosticsConfig::verbose();
        assert_eq!(config.directive, "llmtap=trace");
    }

    #[test]
    fn test_diagnostics_config_builder() {
        let config = DiagnosticsConfig::default()
            .with_directive("llmtap=debug")
            .with_ansi(false);

        assert_eq!(config.directive, "llmtap=debug");
        assert!(!config.ansi_colors);
    }

    #[test]
    fn test_init_refuses_second_install() {
        let config = DiagnosticsConfig::default().with_ansi(false);
        assert!(init_diagnostics(&config).is_ok());
        // The host's subscriber is never replaced
        assert!(init_diagnostics(&config).is_err());
    }
}
