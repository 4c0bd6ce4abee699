// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Channel collectors for tests and diagnostics.
//!
//! A [`ChannelCollector`] subscribes to one channel and keeps every observed
//! lifecycle event in per-kind buckets, ordered as published. Collectors are
//! independent: attaching one never affects other subscribers on the channel
//! or the publishers.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::bus::{ChannelBus, Subscription};
use crate::correlate::InvocationId;
use crate::types::{CallArgs, CallResult, ErrorInfo, EventEnvelope, LifecycleEvent};

/// A collected `start` event.
#[derive(Debug, Clone)]
pub struct CollectedStart {
    pub invocation: InvocationId,
    pub args: CallArgs,
    pub timestamp: Instant,
}

/// A collected result-bearing event (`end`, `asyncStart`, or `asyncEnd`).
#[derive(Debug, Clone)]
pub struct CollectedResult {
    pub invocation: InvocationId,
    pub result: CallResult,
    pub timestamp: Instant,
}

/// A collected `error` event.
#[derive(Debug, Clone)]
pub struct CollectedError {
    pub invocation: InvocationId,
    pub error: ErrorInfo,
    pub timestamp: Instant,
}

/// Per-kind event counts for quick assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub starts: usize,
    pub async_starts: usize,
    pub ends: usize,
    pub async_ends: usize,
    pub errors: usize,
}

impl EventCounts {
    /// Total events observed.
    pub fn total(&self) -> usize {
        self.starts + self.async_starts + self.ends + self.async_ends + self.errors
    }

    /// Terminal events observed (`end` + `asyncEnd` + `error`).
    pub fn terminals(&self) -> usize {
        self.ends + self.async_ends + self.errors
    }
}

#[derive(Default)]
struct Buckets {
    starts: Vec<CollectedStart>,
    async_starts: Vec<CollectedResult>,
    ends: Vec<CollectedResult>,
    async_ends: Vec<CollectedResult>,
    errors: Vec<CollectedError>,
}

/// Collects a channel's lifecycle events into ordered per-kind buckets.
pub struct ChannelCollector {
    channel: String,
    buckets: Arc<Mutex<Buckets>>,
    _sub: Subscription,
}

impl ChannelCollector {
    /// Attach a collector to a channel. Only events published after the
    /// attach are observed.
    pub fn attach(bus: &ChannelBus, channel: impl Into<String>) -> Self {
        let channel = channel.into();
        let buckets = Arc::new(Mutex::new(Buckets::default()));

        let sink = Arc::clone(&buckets);
        let sub = bus.subscribe(channel.clone(), move |env: &EventEnvelope| {
            let mut buckets = sink.lock().unwrap();
            match &env.event {
                LifecycleEvent::Start { args, timestamp } => buckets.starts.push(CollectedStart {
                    invocation: env.invocation,
                    args: args.clone(),
                    timestamp: *timestamp,
                }),
                LifecycleEvent::AsyncStart { result, timestamp } => {
                    buckets.async_starts.push(CollectedResult {
                        invocation: env.invocation,
                        result: result.clone(),
                        timestamp: *timestamp,
                    })
                }
                LifecycleEvent::End { result, timestamp } => {
                    buckets.ends.push(CollectedResult {
                        invocation: env.invocation,
                        result: result.clone(),
                        timestamp: *timestamp,
                    })
                }
                LifecycleEvent::AsyncEnd { result, timestamp } => {
                    buckets.async_ends.push(CollectedResult {
                        invocation: env.invocation,
                        result: result.clone(),
                        timestamp: *timestamp,
                    })
                }
                LifecycleEvent::Error { error, timestamp } => {
                    buckets.errors.push(CollectedError {
                        invocation: env.invocation,
                        error: error.clone(),
                        timestamp: *timestamp,
                    })
                }
            }
        });

        Self {
            channel,
            buckets,
            _sub: sub,
        }
    }

    /// The channel this collector listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Collected `start` events in publish order.
    pub fn starts(&self) -> Vec<CollectedStart> {
        self.buckets.lock().unwrap().starts.clone()
    }

    /// Collected `asyncStart` events in publish order.
    pub fn async_starts(&self) -> Vec<CollectedResult> {
        self.buckets.lock().unwrap().async_starts.clone()
    }

    /// Collected `end` events in publish order.
    pub fn ends(&self) -> Vec<CollectedResult> {
        self.buckets.lock().unwrap().ends.clone()
    }

    /// Collected `asyncEnd` events in publish order.
    pub fn async_ends(&self) -> Vec<CollectedResult> {
        self.buckets.lock().unwrap().async_ends.clone()
    }

    /// Collected `error` events in publish order.
    pub fn errors(&self) -> Vec<CollectedError> {
        self.buckets.lock().unwrap().errors.clone()
    }

    /// Per-kind counts.
    pub fn counts(&self) -> EventCounts {
        let buckets = self.buckets.lock().unwrap();
        EventCounts {
            starts: buckets.starts.len(),
            async_starts: buckets.async_starts.len(),
            ends: buckets.ends.len(),
            async_ends: buckets.async_ends.len(),
            errors: buckets.errors.len(),
        }
    }

    /// Discard everything collected so far.
    pub fn clear(&self) {
        let mut buckets = self.buckets.lock().unwrap();
        *buckets = Buckets::default();
    }
}
