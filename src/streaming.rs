// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Stream observation for instrumented calls that return live streams.
//!
//! A stream-returning call completes when the stream is *created*, not when
//! it finishes; its span must stay open until the stream itself terminates.
//! This module provides the two stream shapes the instrumentation supports,
//! both feeding the same listener fan-out:
//!
//! - [`StreamEmitter`] - an emitter-like object. The producer pushes chunks
//!   and a terminal signal; any number of consumers attach listeners via
//!   the cloneable [`StreamHandle`].
//! - [`InstrumentedStream`] - wraps a `futures::Stream` of
//!   `Result<chunk, error>` items. Polling passes items through to the
//!   consumer unchanged while notifying listeners on the side.
//!
//! The instrumentation's own listener is just another listener: attaching
//! it never prevents, delays, or duplicates delivery to consumer listeners.
//! Terminal signals latch - once a stream has ended or failed, further
//! signals are ignored with a diagnostic, which is what resolves an
//! end/error race into a single terminal transition.
//!
//! Every emitted or yielded `Ok` item counts as content-bearing for
//! first-data detection; producers that interleave control frames should
//! filter before emitting.

use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tracing::{debug, error};

use crate::types::ErrorInfo;

/// Signals observed from a live stream.
#[derive(Debug, Clone)]
pub enum StreamSignal {
    /// A content-bearing chunk.
    Item(Value),
    /// End of stream; terminal success.
    End,
    /// Stream failure; terminal.
    Error(ErrorInfo),
}

impl StreamSignal {
    /// Check if this signal terminates the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Error(_))
    }
}

type Listener = Arc<dyn Fn(&StreamSignal) + Send + Sync>;

struct StreamShared {
    listeners: Mutex<Vec<Listener>>,
    terminated: AtomicBool,
}

impl StreamShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(Vec::new()),
            terminated: AtomicBool::new(false),
        })
    }

    fn notify(&self, signal: &StreamSignal) {
        if self.terminated.load(Ordering::SeqCst) {
            debug!("Stream already terminated; ignoring signal");
            return;
        }
        if signal.is_terminal() {
            self.terminated.store(true, Ordering::SeqCst);
        }

        let snapshot: Vec<Listener> = self.listeners.lock().unwrap().clone();
        for listener in snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| listener(signal)));
            if result.is_err() {
                error!("Stream listener panicked; continuing delivery");
            }
        }
    }
}

/// Cloneable handle for observing a live stream.
///
/// Carried inside the `end`/`asyncEnd` event of a stream-returning call so
/// subscribers can attach their own listeners. Listeners attached after a
/// signal was delivered never see that past signal.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<StreamShared>,
}

impl StreamHandle {
    /// Attach a listener to this stream.
    pub fn on_event(&self, listener: impl Fn(&StreamSignal) + Send + Sync + 'static) {
        self.shared.listeners.lock().unwrap().push(Arc::new(listener));
    }

    /// Check if the stream has reached a terminal signal.
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    /// Number of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.lock().unwrap().len()
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("listeners", &self.listener_count())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

// ============================================================================
// Emitter Shape
// ============================================================================

/// Emitter-like stream: the producer pushes chunks, consumers listen.
///
/// Emissions after the terminal signal are ignored with a diagnostic.
pub struct StreamEmitter {
    shared: Arc<StreamShared>,
}

impl StreamEmitter {
    /// Create a new emitter.
    pub fn new() -> Self {
        Self {
            shared: StreamShared::new(),
        }
    }

    /// Get an observation handle for this emitter.
    pub fn handle(&self) -> StreamHandle {
        StreamHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Push a content chunk to all listeners.
    pub fn emit(&self, chunk: Value) {
        self.shared.notify(&StreamSignal::Item(chunk));
    }

    /// Signal end-of-stream.
    pub fn finish(&self) {
        self.shared.notify(&StreamSignal::End);
    }

    /// Signal stream failure.
    pub fn fail(&self, error: ErrorInfo) {
        self.shared.notify(&StreamSignal::Error(error));
    }
}

impl Default for StreamEmitter {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Async-Iterable Shape
// ============================================================================

/// Wraps a `futures::Stream` so its items are observed while passing
/// through to the consumer unchanged.
///
/// Exhaustion notifies end-of-stream; the first `Err` item notifies the
/// terminal error but is still yielded to the consumer. A stream the
/// consumer abandons without exhausting never produces a terminal signal,
/// and its span stays open - this layer does not time anything out.
pub struct InstrumentedStream<S> {
    inner: S,
    shared: Arc<StreamShared>,
}

impl<S> InstrumentedStream<S> {
    /// Wrap a stream for observation.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            shared: StreamShared::new(),
        }
    }

    /// Get an observation handle for this stream.
    pub fn handle(&self) -> StreamHandle {
        StreamHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Consume the wrapper, returning the inner stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> fmt::Debug for InstrumentedStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedStream")
            .field("listeners", &self.handle().listener_count())
            .field("terminated", &self.handle().is_terminated())
            .finish_non_exhaustive()
    }
}

impl<S, T, E> Stream for InstrumentedStream<S>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    T: Serialize,
    E: std::error::Error,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => {
                let value = serde_json::to_value(&item).unwrap_or(Value::Null);
                this.shared.notify(&StreamSignal::Item(value));
                Poll::Ready(Some(Ok(item)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.shared.notify(&StreamSignal::Error(ErrorInfo::from_error(&err)));
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.shared.notify(&StreamSignal::End);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn collecting_listener() -> (Arc<StdMutex<Vec<StreamSignal>>>, impl Fn(&StreamSignal) + Send + Sync)
    {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        (seen, move |signal: &StreamSignal| {
            seen_clone.lock().unwrap().push(signal.clone());
        })
    }

    #[test]
    fn test_emitter_fan_out() {
        let emitter = StreamEmitter::new();
        let (first, listener_a) = collecting_listener();
        let (second, listener_b) = collecting_listener();

        emitter.handle().on_event(listener_a);
        emitter.handle().on_event(listener_b);

        emitter.emit(json!("hello"));
        emitter.finish();

        for seen in [&first, &second] {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 2);
            assert!(matches!(&seen[0], StreamSignal::Item(v) if v == "hello"));
            assert!(matches!(seen[1], StreamSignal::End));
        }
    }

    #[test]
    fn test_emitter_no_replay_for_late_listener() {
        let emitter = StreamEmitter::new();
        emitter.emit(json!("early"));

        let (seen, listener) = collecting_listener();
        emitter.handle().on_event(listener);
        emitter.emit(json!("late"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], StreamSignal::Item(v) if v == "late"));
    }

    #[test]
    fn test_emitter_latches_after_finish() {
        let emitter = StreamEmitter::new();
        let (seen, listener) = collecting_listener();
        emitter.handle().on_event(listener);

        emitter.finish();
        emitter.emit(json!("ignored"));
        emitter.fail(ErrorInfo::new("StreamError", "ignored too"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], StreamSignal::End));
        assert!(emitter.handle().is_terminated());
    }

    #[test]
    fn test_emitter_error_is_terminal() {
        let emitter = StreamEmitter::new();
        let (seen, listener) = collecting_listener();
        emitter.handle().on_event(listener);

        emitter.emit(json!("chunk"));
        emitter.fail(ErrorInfo::new("StreamError", "connection reset"));
        emitter.finish();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(&seen[1], StreamSignal::Error(e) if e.message == "connection reset"));
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let emitter = StreamEmitter::new();
        emitter.handle().on_event(|_| panic!("broken listener"));
        let (seen, listener) = collecting_listener();
        emitter.handle().on_event(listener);

        emitter.emit(json!("chunk"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_instrumented_stream_passes_through() {
        let items: Vec<Result<String, std::io::Error>> =
            vec![Ok("a".to_string()), Ok("b".to_string())];
        let wrapped = InstrumentedStream::new(futures::stream::iter(items));

        let (seen, listener) = collecting_listener();
        wrapped.handle().on_event(listener);

        let collected: Vec<_> = wrapped.collect().await;
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].as_ref().unwrap(), "a");
        assert_eq!(collected[1].as_ref().unwrap(), "b");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(matches!(&seen[0], StreamSignal::Item(v) if v == "a"));
        assert!(matches!(&seen[1], StreamSignal::Item(v) if v == "b"));
        assert!(matches!(seen[2], StreamSignal::End));
    }

    #[tokio::test]
    async fn test_instrumented_stream_error_reaches_consumer() {
        let items: Vec<Result<String, std::io::Error>> = vec![
            Ok("partial".to_string()),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "mid-flight failure",
            )),
        ];
        let mut wrapped = InstrumentedStream::new(futures::stream::iter(items));

        let (seen, listener) = collecting_listener();
        wrapped.handle().on_event(listener);

        assert!(wrapped.next().await.unwrap().is_ok());
        let err = wrapped.next().await.unwrap().unwrap_err();
        // The consumer still sees the original error
        assert_eq!(err.to_string(), "mid-flight failure");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(&seen[1], StreamSignal::Error(e) if e.message == "mid-flight failure"));
        assert!(wrapped.handle().is_terminated());
    }
}
