// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Span backends for the lifecycle adapter.
//!
//! The adapter drives spans through the narrow [`Tracer`] / [`SpanHandle`]
//! seam so any tracing system can sit behind it. Two backends ship here:
//!
//! - [`TracingTracer`] - emits through the `tracing` crate (spans with
//!   empty fields recorded as the invocation progresses).
//! - [`RecordingTracer`] - in-memory capture for tests and diagnostics.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::info_span;

use crate::types::ErrorInfo;

// ============================================================================
// Span Records
// ============================================================================

/// A partial record merged into a span's accumulated state.
///
/// Spans are built up incrementally: input and receiver metadata at open,
/// output or error at the terminal transition, metrics whenever they become
/// known (e.g. time-to-first-token mid-stream).
#[derive(Debug, Clone, Default)]
pub struct SpanRecord {
    pub input: Option<Vec<Value>>,
    pub output: Option<Value>,
    pub metadata: Option<Value>,
    pub error: Option<ErrorInfo>,
    pub metrics: Vec<(String, f64)>,
}

impl SpanRecord {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the captured call arguments.
    pub fn with_input(mut self, input: Vec<Value>) -> Self {
        self.input = Some(input);
        self
    }

    /// Set the call's output value.
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Set receiver/client metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the captured error.
    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    /// Append a named metric.
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.push((name.into(), value));
        self
    }

    /// Merge another record into this one; set fields win, metrics append.
    pub fn merge(&mut self, other: SpanRecord) {
        if other.input.is_some() {
            self.input = other.input;
        }
        if other.output.is_some() {
            self.output = other.output;
        }
        if other.metadata.is_some() {
            self.metadata = other.metadata;
        }
        if other.error.is_some() {
            self.error = other.error;
        }
        self.metrics.extend(other.metrics);
    }
}

// ============================================================================
// Tracer Seam
// ============================================================================

/// One open span owned by exactly one invocation.
pub trait SpanHandle: Send {
    /// Merge additional fields into the span.
    fn log(&mut self, record: SpanRecord);

    /// Close the span. Implementations may assume the adapter calls this
    /// exactly once per logical invocation.
    fn end(&mut self);
}

/// Creates spans for correlated invocations.
#[cfg_attr(test, mockall::automock)]
pub trait Tracer: Send + Sync {
    /// Open a span with its initial record (input and metadata).
    fn start_span(&self, name: &str, initial: SpanRecord) -> Box<dyn SpanHandle>;
}

/// Arc-wrapped tracer for shared ownership.
pub type SharedTracer = Arc<dyn Tracer>;

// ============================================================================
// tracing Backend
// ============================================================================

/// Span backend emitting through the `tracing` crate.
pub struct TracingTracer;

impl TracingTracer {
    /// Create a new tracing backend.
    pub fn new() -> Self {
        Self
    }
}

impl Default for TracingTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer for TracingTracer {
    fn start_span(&self, name: &str, initial: SpanRecord) -> Box<dyn SpanHandle> {
        let span = info_span!(
            "llm.call",
            channel = %name,
            input = tracing::field::Empty,
            output = tracing::field::Empty,
            metadata = tracing::field::Empty,
            error.kind = tracing::field::Empty,
            error.message = tracing::field::Empty,
            ttft_ms = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );

        let mut handle = TracingSpan {
            span,
            start: Instant::now(),
            ended: false,
        };
        handle.log(initial);
        Box::new(handle)
    }
}

struct TracingSpan {
    span: tracing::Span,
    start: Instant,
    ended: bool,
}

impl SpanHandle for TracingSpan {
    fn log(&mut self, record: SpanRecord) {
        if let Some(input) = &record.input {
            if let Ok(json) = serde_json::to_string(input) {
                self.span.record("input", json.as_str());
            }
        }
        if let Some(output) = &record.output {
            if let Ok(json) = serde_json::to_string(output) {
                self.span.record("output", json.as_str());
            }
        }
        if let Some(metadata) = &record.metadata {
            if let Ok(json) = serde_json::to_string(metadata) {
                self.span.record("metadata", json.as_str());
            }
        }
        if let Some(error) = &record.error {
            self.span.record("error.kind", error.kind.as_str());
            self.span.record("error.message", error.message.as_str());
        }
        for (name, value) in &record.metrics {
            if name == "ttft_ms" {
                self.span.record("ttft_ms", *value);
            } else {
                tracing::debug!(parent: &self.span, metric = %name, value = *value, "Span metric");
            }
        }
    }

    fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        let duration_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.span.record("duration_ms", duration_ms);
        tracing::info!(parent: &self.span, "Instrumented call complete");
    }
}

// ============================================================================
// Recording Backend
// ============================================================================

/// A finished or in-flight span captured by [`RecordingTracer`].
#[derive(Debug, Clone)]
pub struct RecordedSpan {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub record: SpanRecord,
    pub ended: bool,
    /// How many times `end` was invoked; the adapter's close-once guard
    /// should keep this at 1.
    pub end_calls: u32,
}

/// In-memory span backend for tests and diagnostics.
#[derive(Clone, Default)]
pub struct RecordingTracer {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl RecordingTracer {
    /// Create a new recording backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all spans, open and closed, in creation order.
    pub fn spans(&self) -> Vec<RecordedSpan> {
        self.spans.lock().unwrap().clone()
    }

    /// Snapshot of closed spans only.
    pub fn finished(&self) -> Vec<RecordedSpan> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.ended)
            .cloned()
            .collect()
    }

    /// Number of spans still open.
    pub fn open_count(&self) -> usize {
        self.spans.lock().unwrap().iter().filter(|s| !s.ended).count()
    }
}

impl Tracer for RecordingTracer {
    fn start_span(&self, name: &str, initial: SpanRecord) -> Box<dyn SpanHandle> {
        let mut spans = self.spans.lock().unwrap();
        let index = spans.len();
        spans.push(RecordedSpan {
            name: name.to_string(),
            started_at: Utc::now(),
            record: initial,
            ended: false,
            end_calls: 0,
        });

        Box::new(RecordingSpan {
            spans: Arc::clone(&self.spans),
            index,
        })
    }
}

struct RecordingSpan {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
    index: usize,
}

impl SpanHandle for RecordingSpan {
    fn log(&mut self, record: SpanRecord) {
        let mut spans = self.spans.lock().unwrap();
        let span = &mut spans[self.index];
        if span.ended {
            // No mutation after close
            return;
        }
        span.record.merge(record);
    }

    fn end(&mut self) {
        let mut spans = self.spans.lock().unwrap();
        let span = &mut spans[self.index];
        span.end_calls += 1;
        span.ended = true;
    }
}
