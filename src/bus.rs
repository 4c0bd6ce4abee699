// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process-wide named publish/subscribe for lifecycle events.
//!
//! Instrumented call sites publish [`EventEnvelope`]s onto channels named
//! after their instrumentation config; any number of subscribers listen per
//! channel without affecting each other or the publisher.
//!
//! Delivery semantics:
//!
//! - `publish` is fire-and-forget and never fails. With no subscriber the
//!   event is dropped - there is no buffering, and a subscriber added later
//!   never sees past events.
//! - Delivery happens synchronously on the publisher's stack, so the events
//!   of one publisher arrive at every subscriber in publish order.
//! - The subscriber list is snapshotted before dispatch, so subscribing or
//!   unsubscribing while a publish is in flight never corrupts delivery.
//! - A panicking subscriber is isolated: the panic is caught and logged,
//!   the remaining subscribers still receive the event, and the publisher
//!   never observes the failure.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{error, trace};

use crate::types::EventEnvelope;

/// Handler invoked for every event published on a subscribed channel.
pub type EventHandler = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    handler: EventHandler,
}

#[derive(Default)]
struct BusInner {
    channels: RwLock<HashMap<String, Vec<HandlerEntry>>>,
    next_id: AtomicU64,
}

/// The event channel bus.
///
/// Cheap to clone; clones share the same subscriber state. Most callers use
/// the process-wide [`global`] instance.
#[derive(Clone)]
pub struct ChannelBus {
    inner: Arc<BusInner>,
}

/// Global bus instance.
static GLOBAL_BUS: Lazy<ChannelBus> = Lazy::new(ChannelBus::new);

/// Get the process-wide bus.
pub fn global() -> &'static ChannelBus {
    &GLOBAL_BUS
}

impl ChannelBus {
    /// Create an isolated bus (useful for tests; production code usually
    /// shares [`global`]).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner::default()),
        }
    }

    /// Publish an event to all current subscribers of its channel.
    ///
    /// Never fails and never panics outward; observability must not break
    /// the instrumented call's own control flow.
    pub fn publish(&self, envelope: &EventEnvelope) {
        let snapshot: Vec<HandlerEntry> = {
            let channels = self.inner.channels.read().unwrap();
            match channels.get(envelope.channel.as_ref()) {
                Some(entries) => entries.clone(),
                None => {
                    trace!(
                        channel = %envelope.channel,
                        kind = %envelope.event.kind(),
                        "No subscribers; dropping event"
                    );
                    return;
                }
            }
        };

        for entry in snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| (entry.handler)(envelope)));
            if result.is_err() {
                error!(
                    channel = %envelope.channel,
                    kind = %envelope.event.kind(),
                    subscriber = entry.id,
                    "Subscriber panicked while handling event; continuing delivery"
                );
            }
        }
    }

    /// Subscribe a handler to a channel.
    ///
    /// Returns a [`Subscription`] that removes the handler when explicitly
    /// unsubscribed or dropped.
    pub fn subscribe(
        &self,
        channel: impl Into<String>,
        handler: impl Fn(&EventEnvelope) + Send + Sync + 'static,
    ) -> Subscription {
        let channel = channel.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let entry = HandlerEntry {
            id,
            handler: Arc::new(handler),
        };

        let mut channels = self.inner.channels.write().unwrap();
        channels.entry(channel.clone()).or_default().push(entry);

        Subscription {
            bus: Arc::downgrade(&self.inner),
            channel,
            id,
            active: true,
        }
    }

    /// Number of subscribers currently attached to a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .read()
            .unwrap()
            .get(channel)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for an active subscription.
///
/// Unsubscribes on [`Subscription::unsubscribe`] or on drop. Dropping after
/// an explicit unsubscribe is a no-op.
pub struct Subscription {
    bus: Weak<BusInner>,
    channel: String,
    id: u64,
    active: bool,
}

impl Subscription {
    /// The channel this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Remove the handler from the bus.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        let mut channels = inner.channels.write().unwrap();
        if let Some(entries) = channels.get_mut(&self.channel) {
            entries.retain(|e| e.id != self.id);
            if entries.is_empty() {
                channels.remove(&self.channel);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
