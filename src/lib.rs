// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! llmtap - zero-touch observability for LLM SDK calls.
//!
//! llmtap turns fire-and-forget lifecycle events emitted at instrumented
//! call sites into correctly-scoped observability spans with accurate
//! timing, inputs, outputs, and error state - even when many concurrent
//! invocations of the same function interleave, and even when a call
//! returns a live stream that outlives the call itself.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`types`] - Core type definitions (lifecycle events, call captures, envelopes)
//! - [`error`] - Error types and result aliases
//! - [`registry`] - Declarative instrumentation configs and channel naming
//! - [`bus`] - Process-wide named publish/subscribe for lifecycle events
//! - [`correlate`] - Continuation-local invocation identity and event grouping
//! - [`instrument`] - Call-site decorators (sync, async, streaming)
//! - [`streaming`] - Stream observation (emitter and async-iterable shapes)
//! - [`tracer`] - Span backends behind the `Tracer`/`SpanHandle` seam
//! - [`adapter`] - Span lifecycle driving, one span per invocation
//! - [`collector`] - Per-channel event buckets for tests and diagnostics
//! - [`telemetry`] - Diagnostic logging initialization
//! - [`metrics`] - In-process per-channel metrics
//!
//! Data flows one way: an instrumented call site publishes events onto the
//! [`bus`], the [`correlate`] layer attaches each event to its logical
//! invocation, and the [`adapter`] drives exactly one span per invocation
//! through whatever [`tracer::Tracer`] backend is attached.
//!
//! # Example
//!
//! ```rust,ignore
//! use llmtap::adapter::SpanLifecycleAdapter;
//! use llmtap::instrument::Instrumented;
//! use llmtap::registry::{FunctionQuery, InstrumentationConfig, ModuleTarget, Registry};
//! use llmtap::tracer::TracingTracer;
//! use llmtap::types::{CallArgs, CallKind};
//! use std::sync::Arc;
//!
//! let registry = Registry::new();
//! let config = registry.register(InstrumentationConfig::new(
//!     "chat.completions.create",
//!     ModuleTarget::new("openai", ">=4.0.0 <6", "dist/resources/chat/completions.js"),
//!     FunctionQuery::method("Completions", "create", CallKind::Async),
//! ))?;
//!
//! let bus = llmtap::bus::global();
//! let channel = config.channel_for(registry.namespace());
//! let _adapter = SpanLifecycleAdapter::attach(bus, &channel, Arc::new(TracingTracer::new()));
//!
//! let wrapped = Instrumented::new(bus, &config, registry.namespace());
//! let response = wrapped
//!     .call_async(CallArgs::single(request_json), || client.create(request))
//!     .await?;
//! ```
//!
//! Instrumentation is strictly additive: removing the adapter, the
//! subscribers, or the whole crate never changes a wrapped call's return
//! value or error.

pub mod adapter;
pub mod bus;
pub mod collector;
pub mod correlate;
pub mod error;
pub mod instrument;
pub mod metrics;
pub mod registry;
pub mod streaming;
pub mod telemetry;
pub mod tracer;
pub mod types;

// Re-export commonly used types at crate root
pub use adapter::SpanLifecycleAdapter;
pub use bus::{ChannelBus, Subscription};
pub use collector::ChannelCollector;
pub use correlate::{Correlator, InvocationContext, InvocationId, InvocationObserver};
pub use error::{CorrelationError, RegistryError, Result};
pub use instrument::Instrumented;
pub use registry::{FunctionQuery, InstrumentationConfig, ModuleTarget, Registry};
pub use streaming::{InstrumentedStream, StreamEmitter, StreamHandle, StreamSignal};
pub use tracer::{RecordingTracer, SpanHandle, SpanRecord, Tracer, TracingTracer};
pub use types::{
    // Event types
    CallArgs, CallKind, CallResult, ErrorInfo, EventEnvelope, EventKind, LifecycleEvent,
};

/// llmtap version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
