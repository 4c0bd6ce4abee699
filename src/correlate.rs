// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-invocation context correlation.
//!
//! A channel is shared by every concurrent call to the same instrumented
//! function, and the emitted events carry no explicit correlation id. This
//! module solves both halves of that problem:
//!
//! - **Emission side**: a fresh [`InvocationContext`] is established
//!   synchronously at call entry and propagated through the call's own
//!   continuation with a task-local scope ([`sync_scope`] / [`scope`]).
//!   [`stamp`] reads the current context at event-emission time and binds
//!   the event to its invocation. Because the binding lives in the call's
//!   own execution chain - not in ambient global state - N interleaved
//!   concurrent invocations cannot cross-contaminate, regardless of how
//!   their awaits and completions interleave.
//! - **Subscriber side**: [`Correlator`] groups bus envelopes by invocation,
//!   enforces the causal invariants (start first, at most one asyncStart,
//!   exactly one terminal, nothing after the terminal), and drives an
//!   [`InvocationObserver`] with a per-invocation ordered view.
//!
//! Known limitation: work handed to `tokio::spawn` inside a wrapped call
//! runs outside the invocation's scope. Events emitted there fail to stamp
//! and are dropped with a diagnostic - never attached to a guessed
//! invocation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::bus::{ChannelBus, Subscription};
use crate::error::CorrelationError;
use crate::types::{CallArgs, CallResult, ErrorInfo, EventEnvelope, LifecycleEvent};

// ============================================================================
// Invocation Identity
// ============================================================================

/// A unique identifier for one logical invocation of an instrumented
/// function.
///
/// Minted when the invocation context is established; never reused, and
/// never derived from anything the instrumented code emits - identity comes
/// from the continuation, not from a side channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationId(Uuid);

impl InvocationId {
    /// Mint a fresh id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short hex form for log fields.
    pub fn short(&self) -> String {
        self.0.as_simple().to_string()[..8].to_string()
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.as_simple(), f)
    }
}

impl fmt::Debug for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InvocationId").field(&self.short()).finish()
    }
}

// ============================================================================
// Invocation Context
// ============================================================================

/// The continuation-local identity of one in-flight invocation.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub id: InvocationId,
    pub channel: Arc<str>,
    pub entered: Instant,
}

impl InvocationContext {
    /// Mint a fresh context for a call on the given channel.
    pub fn new(channel: impl Into<Arc<str>>) -> Self {
        Self {
            id: InvocationId::new(),
            channel: channel.into(),
            entered: Instant::now(),
        }
    }
}

tokio::task_local! {
    static CURRENT_INVOCATION: InvocationContext;
}

/// Read the invocation context of the current execution chain, if any.
pub fn current() -> Option<InvocationContext> {
    CURRENT_INVOCATION.try_with(|ctx| ctx.clone()).ok()
}

/// Run a synchronous closure inside an invocation scope.
///
/// Nested scopes shadow the outer one: a recursive call to the same
/// instrumented function gets its own independent context.
pub fn sync_scope<R>(ctx: InvocationContext, f: impl FnOnce() -> R) -> R {
    CURRENT_INVOCATION.sync_scope(ctx, f)
}

/// Run a future inside an invocation scope.
///
/// The scope survives every await point of the future, so events emitted
/// after resumption still stamp against the right invocation even when
/// other calls to the same function interleave.
pub async fn scope<F: std::future::Future>(ctx: InvocationContext, fut: F) -> F::Output {
    CURRENT_INVOCATION.scope(ctx, fut).await
}

/// Bind an event to the current invocation.
///
/// # Errors
///
/// Fails when no invocation scope is active on the current execution chain.
/// Callers must drop the event with a diagnostic in that case.
pub fn stamp(event: LifecycleEvent) -> Result<EventEnvelope, CorrelationError> {
    let ctx = current().ok_or(CorrelationError::NoActiveInvocation)?;
    Ok(EventEnvelope {
        invocation: ctx.id,
        channel: ctx.channel,
        event,
    })
}

/// Bind an event to the current invocation, verifying it belongs to the
/// expected channel.
///
/// # Errors
///
/// Fails when no scope is active, or when the active scope belongs to a
/// different channel (an emission escaped into foreign instrumentation).
pub fn stamp_on(channel: &str, event: LifecycleEvent) -> Result<EventEnvelope, CorrelationError> {
    let ctx = current().ok_or(CorrelationError::NoActiveInvocation)?;
    if ctx.channel.as_ref() != channel {
        return Err(CorrelationError::ChannelMismatch {
            current: ctx.channel.to_string(),
            event: channel.to_string(),
        });
    }
    Ok(EventEnvelope {
        invocation: ctx.id,
        channel: ctx.channel,
        event,
    })
}

// ============================================================================
// Subscriber-Side Grouping
// ============================================================================

/// Receives the causally-ordered view of each invocation on a channel.
///
/// `on_async_start` is a diagnostic hook only and defaults to a no-op; span
/// construction needs nothing from it.
pub trait InvocationObserver: Send + Sync {
    fn on_start(&self, invocation: InvocationId, args: &CallArgs, at: Instant);

    fn on_async_start(&self, _invocation: InvocationId, _result: &CallResult, _at: Instant) {}

    fn on_end(&self, invocation: InvocationId, result: &CallResult, at: Instant);

    fn on_async_end(&self, invocation: InvocationId, result: &CallResult, at: Instant);

    fn on_error(&self, invocation: InvocationId, error: &ErrorInfo, at: Instant);
}

#[derive(Debug, Clone, Copy)]
struct OpenPhase {
    async_started: bool,
}

struct CorrelatorInner {
    channel: String,
    live: Mutex<HashMap<InvocationId, OpenPhase>>,
    observer: Arc<dyn InvocationObserver>,
}

impl CorrelatorInner {
    fn handle(&self, env: &EventEnvelope) {
        match &env.event {
            LifecycleEvent::Start { args, timestamp } => {
                {
                    let mut live = self.live.lock().unwrap();
                    if live.contains_key(&env.invocation) {
                        warn!(
                            channel = %self.channel,
                            invocation = %env.invocation.short(),
                            "Duplicate start for live invocation; dropping"
                        );
                        return;
                    }
                    live.insert(env.invocation, OpenPhase {
                        async_started: false,
                    });
                }
                self.observer.on_start(env.invocation, args, *timestamp);
            }
            LifecycleEvent::AsyncStart { result, timestamp } => {
                {
                    let mut live = self.live.lock().unwrap();
                    match live.get_mut(&env.invocation) {
                        Some(phase) if !phase.async_started => {
                            phase.async_started = true;
                        }
                        Some(_) => {
                            warn!(
                                channel = %self.channel,
                                invocation = %env.invocation.short(),
                                "Second asyncStart for invocation; dropping"
                            );
                            return;
                        }
                        None => {
                            self.warn_uncorrelated(env, "asyncStart");
                            return;
                        }
                    }
                }
                self.observer.on_async_start(env.invocation, result, *timestamp);
            }
            LifecycleEvent::End { result, timestamp } => {
                if !self.close(env, "end") {
                    return;
                }
                self.observer.on_end(env.invocation, result, *timestamp);
            }
            LifecycleEvent::AsyncEnd { result, timestamp } => {
                if !self.close(env, "asyncEnd") {
                    return;
                }
                self.observer.on_async_end(env.invocation, result, *timestamp);
            }
            LifecycleEvent::Error { error, timestamp } => {
                if !self.close(env, "error") {
                    return;
                }
                self.observer.on_error(env.invocation, error, *timestamp);
            }
        }
    }

    /// Retire a live invocation on its terminal event. Returns false (and
    /// warns) when the invocation is unknown or already terminated - this is
    /// also what rejects an `end` arriving after an `error`.
    fn close(&self, env: &EventEnvelope, kind: &str) -> bool {
        let removed = self.live.lock().unwrap().remove(&env.invocation);
        if removed.is_none() {
            self.warn_uncorrelated(env, kind);
            return false;
        }
        true
    }

    fn warn_uncorrelated(&self, env: &EventEnvelope, kind: &str) {
        warn!(
            channel = %self.channel,
            invocation = %env.invocation.short(),
            kind,
            "Event has no live invocation (missing start or already terminated); dropping"
        );
    }
}

/// Groups a channel's events by invocation and enforces their causal order.
///
/// Invalid events - a terminal without a start, anything after the
/// terminal, a second asyncStart - are dropped with a diagnostic and never
/// reach the observer.
pub struct Correlator {
    inner: Arc<CorrelatorInner>,
    _sub: Subscription,
}

impl Correlator {
    /// Subscribe an observer to a channel through the correlator.
    pub fn attach(
        bus: &ChannelBus,
        channel: impl Into<String>,
        observer: Arc<dyn InvocationObserver>,
    ) -> Self {
        let channel = channel.into();
        let inner = Arc::new(CorrelatorInner {
            channel: channel.clone(),
            live: Mutex::new(HashMap::new()),
            observer,
        });

        let handler = Arc::clone(&inner);
        let sub = bus.subscribe(channel, move |env| handler.handle(env));

        Self { inner, _sub: sub }
    }

    /// The channel this correlator listens on.
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Number of invocations that have started but not yet terminated.
    ///
    /// Streams that never signal completion keep their invocation retired
    /// but their span open; this count only covers the event-level window.
    pub fn live_invocations(&self) -> usize {
        self.inner.live.lock().unwrap().len()
    }
}
