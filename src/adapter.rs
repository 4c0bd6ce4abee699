// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Span lifecycle driving: one span per correlated invocation.
//!
//! The adapter subscribes to a channel through the correlator and walks
//! each invocation through its span:
//!
//! - `start` opens the span and logs the captured arguments and receiver
//!   metadata.
//! - `asyncStart` is a diagnostic hook only; the span is not touched.
//! - `end`/`asyncEnd` with a plain value logs the output and closes.
//! - `error` logs the error and closes. The correlator guarantees no
//!   further events arrive for the invocation after that.
//! - `end`/`asyncEnd` with a stream handle transfers span ownership to a
//!   stream observer instead of closing: the span stays open across the
//!   live stream, logs a single time-to-first-token metric on the first
//!   chunk, and closes once on the stream's own end or error signal.
//!
//! Span closing is guarded to happen exactly once per invocation even when
//! terminal signals race (e.g. a stream end and a stream error); the second
//! attempt is a no-op, not an error. A stream that never signals a terminal
//! leaves its span open - that leak is documented behavior, not a timeout
//! candidate.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, warn};

#[cfg(feature = "metrics")]
use crate::metrics::GLOBAL_METRICS;

use crate::bus::ChannelBus;
use crate::correlate::{Correlator, InvocationId, InvocationObserver};
use crate::streaming::{StreamHandle, StreamSignal};
use crate::tracer::{SharedTracer, SpanHandle, SpanRecord};
use crate::types::{CallArgs, CallResult, ErrorInfo};

// ============================================================================
// Close-Once Span Slot
// ============================================================================

/// Wraps a span handle so closing is idempotent.
struct SpanSlot {
    handle: Box<dyn SpanHandle>,
    opened: Instant,
    closed: bool,
}

impl SpanSlot {
    fn new(handle: Box<dyn SpanHandle>) -> Self {
        Self {
            handle,
            opened: Instant::now(),
            closed: false,
        }
    }

    fn log(&mut self, record: SpanRecord) {
        if self.closed {
            debug!("Span already closed; dropping late record");
            return;
        }
        self.handle.log(record);
    }

    /// Close the span. Returns false if it was already closed.
    fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.handle.end();
        true
    }
}

type SharedSlot = Arc<Mutex<SpanSlot>>;

// ============================================================================
// Adapter
// ============================================================================

struct AdapterCore {
    channel: String,
    tracer: SharedTracer,
    open: Mutex<HashMap<InvocationId, SharedSlot>>,
}

impl AdapterCore {
    fn take_slot(&self, invocation: InvocationId, kind: &str) -> Option<SharedSlot> {
        let slot = self.open.lock().unwrap().remove(&invocation);
        if slot.is_none() {
            warn!(
                channel = %self.channel,
                invocation = %invocation.short(),
                kind,
                "Terminal event for invocation with no open span; dropping"
            );
        }
        slot
    }

    fn finish_value(&self, slot: &SharedSlot, output: Value, success: bool) {
        let mut slot = slot.lock().unwrap();
        if success {
            slot.log(SpanRecord::new().with_output(output));
        }
        let closed = slot.close();

        #[cfg(feature = "metrics")]
        if closed {
            GLOBAL_METRICS.record_invocation(&self.channel, slot.opened.elapsed(), success);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = closed;
    }
}

impl InvocationObserver for AdapterCore {
    fn on_start(&self, invocation: InvocationId, args: &CallArgs, _at: Instant) {
        let mut record = SpanRecord::new().with_input(args.arguments.clone());
        if let Some(context) = &args.self_context {
            record = record.with_metadata(context.clone());
        }

        let handle = self.tracer.start_span(&self.channel, record);
        let slot = Arc::new(Mutex::new(SpanSlot::new(handle)));
        self.open.lock().unwrap().insert(invocation, slot);
    }

    fn on_async_start(&self, invocation: InvocationId, _result: &CallResult, _at: Instant) {
        debug!(
            channel = %self.channel,
            invocation = %invocation.short(),
            "Invocation continuation began"
        );
    }

    fn on_end(&self, invocation: InvocationId, result: &CallResult, _at: Instant) {
        let Some(slot) = self.take_slot(invocation, "end") else {
            return;
        };
        self.complete(invocation, slot, result);
    }

    fn on_async_end(&self, invocation: InvocationId, result: &CallResult, _at: Instant) {
        let Some(slot) = self.take_slot(invocation, "asyncEnd") else {
            return;
        };
        self.complete(invocation, slot, result);
    }

    fn on_error(&self, invocation: InvocationId, error: &ErrorInfo, _at: Instant) {
        let Some(slot) = self.take_slot(invocation, "error") else {
            return;
        };
        {
            let mut slot = slot.lock().unwrap();
            slot.log(SpanRecord::new().with_error(error.clone()));
        }
        self.finish_value(&slot, Value::Null, false);
    }
}

impl AdapterCore {
    fn complete(&self, invocation: InvocationId, slot: SharedSlot, result: &CallResult) {
        match result {
            CallResult::Value(value) => {
                self.finish_value(&slot, value.clone(), true);
            }
            CallResult::Stream(handle) => {
                debug!(
                    channel = %self.channel,
                    invocation = %invocation.short(),
                    "Call returned a live stream; keeping span open"
                );
                StreamSpanObserver::observe(self.channel.clone(), handle, slot);
            }
        }
    }
}

/// Drives exactly one span per logical invocation on a channel.
pub struct SpanLifecycleAdapter {
    core: Arc<AdapterCore>,
    correlator: Correlator,
}

impl SpanLifecycleAdapter {
    /// Attach an adapter to a channel.
    ///
    /// All invocations observed on the channel from this point on produce
    /// one span each through the given tracer.
    pub fn attach(bus: &ChannelBus, channel: impl Into<String>, tracer: SharedTracer) -> Self {
        let channel = channel.into();
        let core = Arc::new(AdapterCore {
            channel: channel.clone(),
            tracer,
            open: Mutex::new(HashMap::new()),
        });

        let correlator = Correlator::attach(bus, channel, Arc::clone(&core) as _);
        Self { core, correlator }
    }

    /// The channel this adapter listens on.
    pub fn channel(&self) -> &str {
        &self.core.channel
    }

    /// Number of invocations whose span is open and not yet handed to a
    /// stream observer.
    pub fn open_spans(&self) -> usize {
        self.core.open.lock().unwrap().len()
    }

    /// Number of invocations the correlator still considers live.
    pub fn live_invocations(&self) -> usize {
        self.correlator.live_invocations()
    }
}

// ============================================================================
// Streaming Extension
// ============================================================================

/// Per-stream span state: open span, creation time, first-data mark, and
/// the buffered chunks for terminal aggregation.
struct StreamSpanObserver {
    channel: String,
    slot: SharedSlot,
    created: Instant,
    first_data: Option<Instant>,
    chunks: Vec<Value>,
}

impl StreamSpanObserver {
    /// Attach the span-driving listener to a live stream.
    fn observe(channel: String, handle: &StreamHandle, slot: SharedSlot) {
        let state = Mutex::new(Self {
            channel,
            slot,
            created: Instant::now(),
            first_data: None,
            chunks: Vec::new(),
        });

        handle.on_event(move |signal| {
            let mut state = state.lock().unwrap();
            state.on_signal(signal);
        });
    }

    fn on_signal(&mut self, signal: &StreamSignal) {
        match signal {
            StreamSignal::Item(chunk) => {
                if self.first_data.is_none() {
                    let now = Instant::now();
                    self.first_data = Some(now);
                    let ttft = now.duration_since(self.created);

                    self.slot.lock().unwrap().log(
                        SpanRecord::new().with_metric("ttft_ms", ttft.as_secs_f64() * 1000.0),
                    );

                    #[cfg(feature = "metrics")]
                    GLOBAL_METRICS.record_first_token(&self.channel, ttft);
                }
                self.chunks.push(chunk.clone());
            }
            StreamSignal::End => {
                let output = aggregate_output(&self.chunks);
                self.finish(Some(output), None);
            }
            StreamSignal::Error(error) => {
                let partial = if self.chunks.is_empty() {
                    None
                } else {
                    Some(aggregate_output(&self.chunks))
                };
                self.finish(partial, Some(error.clone()));
            }
        }
    }

    fn finish(&mut self, output: Option<Value>, error: Option<ErrorInfo>) {
        let success = error.is_none();
        debug!(
            channel = %self.channel,
            success,
            chunks = self.chunks.len(),
            "Stream reached terminal state"
        );

        let mut record = SpanRecord::new();
        if let Some(output) = output {
            record = record.with_output(output);
        }
        if let Some(error) = error {
            record = record.with_error(error);
        }

        let mut slot = self.slot.lock().unwrap();
        slot.log(record);
        let closed = slot.close();

        #[cfg(feature = "metrics")]
        if closed {
            GLOBAL_METRICS.record_invocation(&self.channel, slot.opened.elapsed(), success);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = closed;
    }
}

/// Aggregate buffered chunks into the span's output value: text deltas are
/// concatenated, anything else is kept as the raw chunk list.
fn aggregate_output(chunks: &[Value]) -> Value {
    if chunks.is_empty() {
        return Value::Null;
    }
    if chunks.iter().all(|c| c.is_string()) {
        Value::String(
            chunks
                .iter()
                .filter_map(|c| c.as_str())
                .collect::<String>(),
        )
    } else {
        Value::Array(chunks.to_vec())
    }
}
