// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core types for llmtap.
//!
//! This module defines the data model shared by every layer of the crate:
//! the lifecycle events emitted at instrumented call sites, the captured
//! call inputs and outcomes, and the envelope the channel bus delivers to
//! subscribers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::correlate::InvocationId;
use crate::streaming::StreamHandle;

// ============================================================================
// Call Kind
// ============================================================================

/// How an instrumented function completes.
///
/// Resolved once per instrumentation config at registration time so the
/// per-call hot path never has to sniff the return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    /// Returns synchronously.
    Sync,
    /// Returns a future; the result arrives on resolution.
    Async,
    /// Returns a live stream; the call's own completion only marks stream
    /// creation, not stream completion.
    AsyncStream,
}

impl CallKind {
    /// Check if calls of this kind produce a stream handle.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::AsyncStream)
    }
}

// ============================================================================
// Captured Inputs
// ============================================================================

/// Inputs captured at an instrumented call site.
///
/// `arguments` are the call's positional arguments; `self_context` is the
/// receiver (e.g. the SDK client's configuration) when the matched function
/// is a method.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub arguments: Vec<Value>,
    pub self_context: Option<Value>,
}

impl CallArgs {
    /// Create an empty argument capture.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture a single-argument call.
    pub fn single(argument: Value) -> Self {
        Self {
            arguments: vec![argument],
            self_context: None,
        }
    }

    /// Append a positional argument.
    pub fn with_argument(mut self, argument: Value) -> Self {
        self.arguments.push(argument);
        self
    }

    /// Attach the receiver context.
    pub fn with_self_context(mut self, context: Value) -> Self {
        self.self_context = Some(context);
        self
    }
}

// ============================================================================
// Captured Outcomes
// ============================================================================

/// Error details captured from a failed call.
///
/// The message is preserved verbatim from the original error so downstream
/// consumers see exactly what the caller saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    pub kind: String,
}

impl ErrorInfo {
    /// Create error info from explicit parts.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Capture an error's display message and type name.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        Self {
            message: err.to_string(),
            kind: short_type_name(std::any::type_name::<E>()),
        }
    }
}

fn short_type_name(full: &str) -> String {
    // "openai::error::ApiError" -> "ApiError"; generic arguments kept
    let base = full.split('<').next().unwrap_or(full);
    match base.rfind("::") {
        Some(idx) => full[idx + 2..].to_string(),
        None => full.to_string(),
    }
}

/// The value produced by a completed call.
///
/// Most calls resolve to a plain value; stream-returning calls resolve to a
/// handle on the still-live stream.
#[derive(Debug, Clone)]
pub enum CallResult {
    Value(Value),
    Stream(StreamHandle),
}

impl CallResult {
    /// Wrap a plain value.
    pub fn value(value: Value) -> Self {
        Self::Value(value)
    }

    /// Wrap a stream handle.
    pub fn stream(handle: StreamHandle) -> Self {
        Self::Stream(handle)
    }

    /// Get the plain value, if any.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Stream(_) => None,
        }
    }

    /// Get the stream handle, if any.
    pub fn as_stream(&self) -> Option<&StreamHandle> {
        match self {
            Self::Value(_) => None,
            Self::Stream(h) => Some(h),
        }
    }

    /// Check if this result is a live stream.
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

// ============================================================================
// Lifecycle Events
// ============================================================================

/// Discriminant for [`LifecycleEvent`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    AsyncStart,
    End,
    AsyncEnd,
    Error,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::AsyncStart => write!(f, "asyncStart"),
            Self::End => write!(f, "end"),
            Self::AsyncEnd => write!(f, "asyncEnd"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One lifecycle event for a single logical invocation.
///
/// For any invocation, `Start` precedes every other event, `AsyncStart`
/// appears at most once and only between `Start` and the terminal event,
/// and exactly one of `End` / `AsyncEnd` / `Error` is terminal.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// The call began; captured synchronously at entry.
    Start { args: CallArgs, timestamp: Instant },

    /// The call's continuation began (async kinds only).
    AsyncStart { result: CallResult, timestamp: Instant },

    /// The call returned synchronously.
    End { result: CallResult, timestamp: Instant },

    /// The call's future resolved.
    AsyncEnd { result: CallResult, timestamp: Instant },

    /// The call threw or rejected.
    Error { error: ErrorInfo, timestamp: Instant },
}

impl LifecycleEvent {
    /// Create a start event stamped now.
    pub fn start(args: CallArgs) -> Self {
        Self::Start {
            args,
            timestamp: Instant::now(),
        }
    }

    /// Create an asyncStart event stamped now.
    pub fn async_start(result: CallResult) -> Self {
        Self::AsyncStart {
            result,
            timestamp: Instant::now(),
        }
    }

    /// Create an end event stamped now.
    pub fn end(result: CallResult) -> Self {
        Self::End {
            result,
            timestamp: Instant::now(),
        }
    }

    /// Create an asyncEnd event stamped now.
    pub fn async_end(result: CallResult) -> Self {
        Self::AsyncEnd {
            result,
            timestamp: Instant::now(),
        }
    }

    /// Create an error event stamped now.
    pub fn error(error: ErrorInfo) -> Self {
        Self::Error {
            error,
            timestamp: Instant::now(),
        }
    }

    /// Get this event's discriminant.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Start { .. } => EventKind::Start,
            Self::AsyncStart { .. } => EventKind::AsyncStart,
            Self::End { .. } => EventKind::End,
            Self::AsyncEnd { .. } => EventKind::AsyncEnd,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// Get the emission timestamp.
    pub fn timestamp(&self) -> Instant {
        match self {
            Self::Start { timestamp, .. }
            | Self::AsyncStart { timestamp, .. }
            | Self::End { timestamp, .. }
            | Self::AsyncEnd { timestamp, .. }
            | Self::Error { timestamp, .. } => *timestamp,
        }
    }

    /// Check if this event terminates its invocation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::End { .. } | Self::AsyncEnd { .. } | Self::Error { .. }
        )
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// A lifecycle event bound to the invocation that produced it.
///
/// The binding is stamped at emission time from the continuation-local
/// invocation context; the bus delivers envelopes without interpreting them.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub invocation: InvocationId,
    pub channel: Arc<str>,
    pub event: LifecycleEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_args_builder() {
        let args = CallArgs::new()
            .with_argument(json!({"model": "gpt-4"}))
            .with_self_context(json!({"base_url": "https://api.openai.com"}));

        assert_eq!(args.arguments.len(), 1);
        assert_eq!(args.arguments[0]["model"], "gpt-4");
        assert!(args.self_context.is_some());
    }

    #[test]
    fn test_call_args_single() {
        let args = CallArgs::single(json!(42));
        assert_eq!(args.arguments, vec![json!(42)]);
        assert!(args.self_context.is_none());
    }

    #[test]
    fn test_error_info_from_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "connection reset");
        let info = ErrorInfo::from_error(&io_err);
        assert_eq!(info.message, "connection reset");
        assert_eq!(info.kind, "Error");
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name("crate::module::MyError"), "MyError");
        assert_eq!(short_type_name("MyError"), "MyError");
    }

    #[test]
    fn test_call_result_value() {
        let result = CallResult::value(json!("hello"));
        assert!(!result.is_stream());
        assert_eq!(result.as_value(), Some(&json!("hello")));
        assert!(result.as_stream().is_none());
    }

    #[test]
    fn test_event_kind_display() {
        assert_eq!(EventKind::Start.to_string(), "start");
        assert_eq!(EventKind::AsyncStart.to_string(), "asyncStart");
        assert_eq!(EventKind::AsyncEnd.to_string(), "asyncEnd");
    }

    #[test]
    fn test_lifecycle_event_terminal() {
        let start = LifecycleEvent::start(CallArgs::new());
        let end = LifecycleEvent::end(CallResult::value(json!(null)));
        let error = LifecycleEvent::error(ErrorInfo::new("TestError", "boom"));

        assert!(!start.is_terminal());
        assert!(end.is_terminal());
        assert!(error.is_terminal());

        assert_eq!(start.kind(), EventKind::Start);
        assert_eq!(end.kind(), EventKind::End);
        assert_eq!(error.kind(), EventKind::Error);
    }

    #[test]
    fn test_event_timestamps_ordered() {
        let first = LifecycleEvent::start(CallArgs::new());
        let second = LifecycleEvent::end(CallResult::value(json!(null)));
        assert!(first.timestamp() <= second.timestamp());
    }

    #[test]
    fn test_call_kind_streaming() {
        assert!(!CallKind::Sync.is_streaming());
        assert!(!CallKind::Async.is_streaming());
        assert!(CallKind::AsyncStream.is_streaming());
    }

    #[test]
    fn test_call_kind_serde() {
        assert_eq!(
            serde_json::to_string(&CallKind::AsyncStream).unwrap(),
            "\"async_stream\""
        );
        let kind: CallKind = serde_json::from_str("\"sync\"").unwrap();
        assert_eq!(kind, CallKind::Sync);
    }
}
