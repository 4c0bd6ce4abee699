// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Call-site wrappers for instrumented functions.
//!
//! An [`Instrumented`] decorator is constructed once per matched function
//! from its instrumentation config; the injected call-site code routes every
//! invocation through the entry point matching the config's call kind. Each
//! invocation:
//!
//! 1. establishes a fresh continuation-local context synchronously at entry,
//! 2. publishes `start` with the captured arguments before the wrapped
//!    function runs,
//! 3. publishes the terminal event (`end`, `asyncStart` + `asyncEnd`, or
//!    `error`) from within the same context, and
//! 4. returns the wrapped function's own result or error unchanged.
//!
//! Instrumentation is strictly additive: with or without subscribers the
//! caller observes the same return value, the same error, and the same
//! stream items.

use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use crate::bus::ChannelBus;
use crate::correlate::{self, InvocationContext};
use crate::registry::InstrumentationConfig;
use crate::streaming::{InstrumentedStream, StreamEmitter};
use crate::types::{CallArgs, CallKind, CallResult, ErrorInfo, LifecycleEvent};

/// Decorator for one instrumented function.
///
/// Cheap to clone; the channel name and call kind are resolved once at
/// construction so the per-call path never inspects config.
#[derive(Clone)]
pub struct Instrumented {
    channel: Arc<str>,
    kind: CallKind,
    bus: ChannelBus,
}

impl Instrumented {
    /// Build a decorator from a registered config.
    pub fn new(bus: &ChannelBus, config: &InstrumentationConfig, namespace: &str) -> Self {
        Self {
            channel: Arc::from(config.channel_for(namespace)),
            kind: config.function_query.kind,
            bus: bus.clone(),
        }
    }

    /// Build a decorator directly from a channel name and call kind.
    pub fn with_channel(bus: &ChannelBus, channel: impl Into<Arc<str>>, kind: CallKind) -> Self {
        Self {
            channel: channel.into(),
            kind,
            bus: bus.clone(),
        }
    }

    /// The namespaced channel this decorator publishes on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The call kind resolved from the config.
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// Stamp an event against the current invocation and publish it.
    ///
    /// An event that cannot be stamped is dropped with a diagnostic; it is
    /// never attached to another invocation.
    fn emit(&self, event: LifecycleEvent) {
        match correlate::stamp_on(&self.channel, event) {
            Ok(envelope) => self.bus.publish(&envelope),
            Err(err) => warn!(
                channel = %self.channel,
                error = %err,
                "Dropping uncorrelatable lifecycle event"
            ),
        }
    }

    /// Wrap a synchronous call.
    pub fn call<R, E, F>(&self, args: CallArgs, f: F) -> Result<R, E>
    where
        F: FnOnce() -> Result<R, E>,
        R: Serialize,
        E: std::error::Error,
    {
        let ctx = InvocationContext::new(Arc::clone(&self.channel));
        correlate::sync_scope(ctx, || {
            self.emit(LifecycleEvent::start(args));
            match f() {
                Ok(value) => {
                    let captured = serde_json::to_value(&value).unwrap_or(Value::Null);
                    self.emit(LifecycleEvent::end(CallResult::value(captured)));
                    Ok(value)
                }
                Err(err) => {
                    self.emit(LifecycleEvent::error(ErrorInfo::from_error(&err)));
                    Err(err)
                }
            }
        })
    }

    /// Wrap an asynchronous call.
    ///
    /// The context is established and `start` published synchronously, before
    /// the returned future is first polled; the terminal event is published
    /// from the call's own continuation, so interleaved awaits of concurrent
    /// invocations cannot mix their events up.
    pub fn call_async<'a, R, E, F, Fut>(
        &'a self,
        args: CallArgs,
        f: F,
    ) -> impl Future<Output = Result<R, E>> + 'a
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>> + 'a,
        R: Serialize + 'a,
        E: std::error::Error + 'a,
    {
        let ctx = InvocationContext::new(Arc::clone(&self.channel));
        let fut = correlate::sync_scope(ctx.clone(), || {
            self.emit(LifecycleEvent::start(args));
            f()
        });

        async move {
            correlate::scope(ctx, async move {
                match fut.await {
                    Ok(value) => {
                        let captured = serde_json::to_value(&value).unwrap_or(Value::Null);
                        self.emit(LifecycleEvent::async_start(CallResult::value(
                            captured.clone(),
                        )));
                        self.emit(LifecycleEvent::async_end(CallResult::value(captured)));
                        Ok(value)
                    }
                    Err(err) => {
                        self.emit(LifecycleEvent::error(ErrorInfo::from_error(&err)));
                        Err(err)
                    }
                }
            })
            .await
        }
    }

    /// Wrap an asynchronous call that resolves to a stream.
    ///
    /// The call's own `asyncEnd` carries a handle on the still-live stream -
    /// stream creation, not stream completion. The returned
    /// [`InstrumentedStream`] passes items through to the consumer unchanged
    /// while subscribers observe them through the handle.
    pub fn call_stream<'a, S, E, F, Fut>(
        &'a self,
        args: CallArgs,
        f: F,
    ) -> impl Future<Output = Result<InstrumentedStream<S>, E>> + 'a
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S, E>> + 'a,
        S: 'a,
        E: std::error::Error + 'a,
    {
        let ctx = InvocationContext::new(Arc::clone(&self.channel));
        let fut = correlate::sync_scope(ctx.clone(), || {
            self.emit(LifecycleEvent::start(args));
            f()
        });

        async move {
            correlate::scope(ctx, async move {
                match fut.await {
                    Ok(stream) => {
                        let wrapped = InstrumentedStream::new(stream);
                        let handle = wrapped.handle();
                        self.emit(LifecycleEvent::async_start(CallResult::stream(
                            handle.clone(),
                        )));
                        self.emit(LifecycleEvent::async_end(CallResult::stream(handle)));
                        Ok(wrapped)
                    }
                    Err(err) => {
                        self.emit(LifecycleEvent::error(ErrorInfo::from_error(&err)));
                        Err(err)
                    }
                }
            })
            .await
        }
    }

    /// Wrap a synchronous call that returns an emitter-like stream.
    ///
    /// The call's `end` carries the stream handle; the emitter is returned
    /// to the caller untouched, so consumer listeners attach exactly as they
    /// would without instrumentation.
    pub fn call_emitter<E, F>(&self, args: CallArgs, f: F) -> Result<StreamEmitter, E>
    where
        F: FnOnce() -> Result<StreamEmitter, E>,
        E: std::error::Error,
    {
        let ctx = InvocationContext::new(Arc::clone(&self.channel));
        correlate::sync_scope(ctx, || {
            self.emit(LifecycleEvent::start(args));
            match f() {
                Ok(emitter) => {
                    self.emit(LifecycleEvent::end(CallResult::stream(emitter.handle())));
                    Ok(emitter)
                }
                Err(err) => {
                    self.emit(LifecycleEvent::error(ErrorInfo::from_error(&err)));
                    Err(err)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlate::InvocationId;
    use crate::types::{EventEnvelope, EventKind};
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder(
        bus: &ChannelBus,
        channel: &str,
    ) -> (
        Arc<Mutex<Vec<(InvocationId, EventKind)>>>,
        crate::bus::Subscription,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sub = bus.subscribe(channel, move |env: &EventEnvelope| {
            seen_clone
                .lock()
                .unwrap()
                .push((env.invocation, env.event.kind()));
        });
        (seen, sub)
    }

    #[test]
    fn test_sync_call_emits_start_and_end() {
        let bus = ChannelBus::new();
        let inst = Instrumented::with_channel(&bus, "llmtap:openai:chat", CallKind::Sync);
        let (seen, _sub) = recorder(&bus, "llmtap:openai:chat");

        let result: Result<String, std::io::Error> =
            inst.call(CallArgs::single(json!({"model": "gpt-4"})), || {
                Ok("response".to_string())
            });
        assert_eq!(result.unwrap(), "response");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, EventKind::Start);
        assert_eq!(seen[1].1, EventKind::End);
        // Both events stamped with the same invocation
        assert_eq!(seen[0].0, seen[1].0);
    }

    #[test]
    fn test_sync_call_error_is_terminal_and_verbatim() {
        let bus = ChannelBus::new();
        let inst = Instrumented::with_channel(&bus, "ch", CallKind::Sync);

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let _sub = bus.subscribe("ch", move |env: &EventEnvelope| {
            let message = match &env.event {
                LifecycleEvent::Error { error, .. } => Some(error.message.clone()),
                _ => None,
            };
            events_clone.lock().unwrap().push((env.event.kind(), message));
        });

        let result: Result<String, std::io::Error> = inst.call(CallArgs::new(), || {
            Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "invalid api key",
            ))
        });

        // The caller sees the original error unchanged
        let err = result.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);
        assert_eq!(err.to_string(), "invalid api key");

        let events = events.lock().unwrap();
        let kinds: Vec<_> = events.iter().map(|(k, _)| *k).collect();
        // Error is the sole terminal; no end event follows it
        assert_eq!(kinds, vec![EventKind::Start, EventKind::Error]);
        assert_eq!(events[1].1.as_deref(), Some("invalid api key"));
    }

    #[test]
    fn test_call_without_subscribers_is_transparent() {
        let bus = ChannelBus::new();
        let inst = Instrumented::with_channel(&bus, "ch", CallKind::Sync);

        let result: Result<i32, std::io::Error> = inst.call(CallArgs::new(), || Ok(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_nested_calls_get_independent_invocations() {
        let bus = ChannelBus::new();
        let inst = Instrumented::with_channel(&bus, "ch", CallKind::Sync);
        let (seen, _sub) = recorder(&bus, "ch");

        let inst_inner = inst.clone();
        let result: Result<i32, std::io::Error> = inst.call(CallArgs::new(), || {
            let inner: Result<i32, std::io::Error> =
                inst_inner.call(CallArgs::new(), || Ok(1));
            inner.map(|v| v + 1)
        });
        assert_eq!(result.unwrap(), 2);

        let seen = seen.lock().unwrap();
        // outer start, inner start, inner end, outer end
        assert_eq!(
            seen.iter().map(|(_, k)| *k).collect::<Vec<_>>(),
            vec![
                EventKind::Start,
                EventKind::Start,
                EventKind::End,
                EventKind::End
            ]
        );
        let outer = seen[0].0;
        let inner = seen[1].0;
        assert_ne!(outer, inner);
        assert_eq!(seen[2].0, inner);
        assert_eq!(seen[3].0, outer);
    }

    #[tokio::test]
    async fn test_async_call_lifecycle() {
        let bus = ChannelBus::new();
        let inst = Instrumented::with_channel(&bus, "ch", CallKind::Async);
        let (seen, _sub) = recorder(&bus, "ch");

        let result: Result<String, std::io::Error> = inst
            .call_async(CallArgs::single(json!({"model": "gpt-4"})), || async {
                tokio::task::yield_now().await;
                Ok("done".to_string())
            })
            .await;
        assert_eq!(result.unwrap(), "done");

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.iter().map(|(_, k)| *k).collect::<Vec<_>>(),
            vec![EventKind::Start, EventKind::AsyncStart, EventKind::AsyncEnd]
        );
        assert!(seen.iter().all(|(id, _)| *id == seen[0].0));
    }

    #[tokio::test]
    async fn test_async_call_start_fires_before_poll() {
        let bus = ChannelBus::new();
        let inst = Instrumented::with_channel(&bus, "ch", CallKind::Async);
        let (seen, _sub) = recorder(&bus, "ch");

        let fut = inst.call_async(CallArgs::new(), || async {
            Ok::<_, std::io::Error>(1)
        });
        // Start is published synchronously at entry, before the await
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap()[0].1, EventKind::Start);

        let _ = fut.await;
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_async_call_rejection_emits_error_only() {
        let bus = ChannelBus::new();
        let inst = Instrumented::with_channel(&bus, "ch", CallKind::Async);
        let (seen, _sub) = recorder(&bus, "ch");

        let result: Result<i32, std::io::Error> = inst
            .call_async(CallArgs::new(), || async {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "request timed out",
                ))
            })
            .await;
        assert_eq!(result.unwrap_err().to_string(), "request timed out");

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.iter().map(|(_, k)| *k).collect::<Vec<_>>(),
            vec![EventKind::Start, EventKind::Error]
        );
    }

    #[test]
    fn test_emitter_call_carries_stream_handle() {
        let bus = ChannelBus::new();
        let inst = Instrumented::with_channel(&bus, "ch", CallKind::AsyncStream);

        let handles = Arc::new(Mutex::new(Vec::new()));
        let handles_clone = Arc::clone(&handles);
        let _sub = bus.subscribe("ch", move |env: &EventEnvelope| {
            if let LifecycleEvent::End { result, .. } = &env.event {
                assert!(result.is_stream());
                handles_clone
                    .lock()
                    .unwrap()
                    .push(result.as_stream().unwrap().clone());
            }
        });

        let emitter = inst
            .call_emitter::<std::io::Error, _>(CallArgs::new(), || Ok(StreamEmitter::new()))
            .unwrap();

        assert_eq!(handles.lock().unwrap().len(), 1);
        // The subscriber's handle observes the same stream the caller drives
        let seen = Arc::new(Mutex::new(0usize));
        let seen_clone = Arc::clone(&seen);
        handles.lock().unwrap()[0].on_event(move |_| {
            *seen_clone.lock().unwrap() += 1;
        });
        emitter.emit(json!("chunk"));
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_from_config() {
        let config = InstrumentationConfig::new(
            "chat.completions.create",
            crate::registry::ModuleTarget::new("openai", "*", "chat.js"),
            crate::registry::FunctionQuery::method("Completions", "create", CallKind::Async),
        );
        let bus = ChannelBus::new();
        let inst = Instrumented::new(&bus, &config, "llmtap");

        assert_eq!(inst.channel(), "llmtap:openai:chat.completions.create");
        assert_eq!(inst.kind(), CallKind::Async);
    }
}
