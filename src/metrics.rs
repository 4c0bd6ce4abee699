// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Metrics collection for instrumented channels.
//!
//! Provides lightweight metrics collection without external dependencies.
//! Suitable for embedding in applications where a full observability stack
//! is overkill: per-channel invocation counters, latency distribution, and
//! time-to-first-token tracking for streaming calls.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

/// Global metrics instance.
pub static GLOBAL_METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Central metrics collection.
#[derive(Debug)]
pub struct Metrics {
    /// Invocation metrics by channel name.
    channels: RwLock<HashMap<String, ChannelMetrics>>,

    /// First-token latency by channel name (streaming calls only).
    first_token: RwLock<HashMap<String, LatencyHistogram>>,

    /// Start time for calculating uptime.
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            first_token: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Record a completed invocation.
    pub fn record_invocation(&self, channel: &str, duration: Duration, success: bool) {
        let mut channels = self.channels.write().unwrap();
        let metrics = channels
            .entry(channel.to_string())
            .or_insert_with(ChannelMetrics::new);
        metrics.record(duration, success);
    }

    /// Record a stream's time-to-first-token.
    pub fn record_first_token(&self, channel: &str, latency: Duration) {
        let mut first_token = self.first_token.write().unwrap();
        let histogram = first_token
            .entry(channel.to_string())
            .or_insert_with(LatencyHistogram::new);
        histogram.observe(latency);
    }

    /// Get metrics for a specific channel.
    pub fn channel_metrics(&self, channel: &str) -> Option<ChannelMetrics> {
        self.channels.read().unwrap().get(channel).cloned()
    }

    /// Get the first-token latency distribution for a channel.
    pub fn first_token_latency(&self, channel: &str) -> Option<LatencyHistogram> {
        self.first_token.read().unwrap().get(channel).cloned()
    }

    /// Get uptime since metrics were initialized.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Take a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            channels: self.channels.read().unwrap().clone(),
            first_token: self.first_token.read().unwrap().clone(),
            uptime: self.uptime(),
        }
    }

    /// Reset all metrics.
    pub fn reset(&self) {
        self.channels.write().unwrap().clear();
        self.first_token.write().unwrap().clear();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics for a specific channel.
#[derive(Debug, Clone)]
pub struct ChannelMetrics {
    /// Total number of invocations.
    pub invocations: u64,

    /// Number of successful invocations.
    pub successes: u64,

    /// Number of failed invocations.
    pub failures: u64,

    /// Total time spent in calls on this channel.
    pub total_duration: Duration,

    /// Minimum call duration.
    pub min_duration: Duration,

    /// Maximum call duration.
    pub max_duration: Duration,

    /// Call duration distribution.
    pub latency: LatencyHistogram,
}

impl ChannelMetrics {
    /// Create new empty channel metrics.
    pub fn new() -> Self {
        Self {
            invocations: 0,
            successes: 0,
            failures: 0,
            total_duration: Duration::ZERO,
            min_duration: Duration::MAX,
            max_duration: Duration::ZERO,
            latency: LatencyHistogram::new(),
        }
    }

    /// Record an invocation.
    pub fn record(&mut self, duration: Duration, success: bool) {
        self.invocations += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_duration += duration;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
        self.latency.observe(duration);
    }

    /// Calculate average call duration.
    pub fn avg_duration(&self) -> Duration {
        if self.invocations == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.invocations as u32
        }
    }

    /// Calculate success rate (0.0 to 1.0).
    pub fn success_rate(&self) -> f64 {
        if self.invocations == 0 {
            1.0
        } else {
            self.successes as f64 / self.invocations as f64
        }
    }
}

impl Default for ChannelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Upper bucket bounds in milliseconds; the final bucket is open-ended.
///
/// Tuned for the two latencies this crate observes: time-to-first-token
/// lands in the tens-to-hundreds of milliseconds, full completions in the
/// hundreds of milliseconds to tens of seconds.
const LATENCY_BOUNDS_MS: [u64; 9] = [1, 5, 25, 100, 250, 500, 1_000, 2_500, 10_000];

/// Latency distribution over LLM-scale buckets.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    counts: [u64; LATENCY_BOUNDS_MS.len() + 1],
    samples: u64,
    total: Duration,
}

impl LatencyHistogram {
    /// Create an empty distribution.
    pub fn new() -> Self {
        Self {
            counts: [0; LATENCY_BOUNDS_MS.len() + 1],
            samples: 0,
            total: Duration::ZERO,
        }
    }

    /// Add one observation.
    pub fn observe(&mut self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let idx = LATENCY_BOUNDS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BOUNDS_MS.len());
        self.counts[idx] += 1;
        self.samples += 1;
        self.total += latency;
    }

    /// Number of observations.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Mean latency across all observations.
    pub fn mean(&self) -> Duration {
        if self.samples == 0 {
            Duration::ZERO
        } else {
            self.total / self.samples as u32
        }
    }

    /// Per-bucket counts, one per bound plus the open-ended tail.
    pub fn bucket_counts(&self) -> &[u64] {
        &self.counts
    }

    /// Upper bound of the bucket containing the given quantile (0.0-1.0).
    ///
    /// Observations in the open-ended tail report four times the largest
    /// bound.
    pub fn quantile(&self, q: f64) -> Duration {
        if self.samples == 0 {
            return Duration::ZERO;
        }

        let rank = ((self.samples as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0u64;
        for (idx, &count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                let bound = LATENCY_BOUNDS_MS
                    .get(idx)
                    .copied()
                    .unwrap_or(LATENCY_BOUNDS_MS[LATENCY_BOUNDS_MS.len() - 1] * 4);
                return Duration::from_millis(bound);
            }
        }

        Duration::from_millis(LATENCY_BOUNDS_MS[LATENCY_BOUNDS_MS.len() - 1] * 4)
    }

    /// Median latency.
    pub fn p50(&self) -> Duration {
        self.quantile(0.50)
    }

    /// 95th percentile latency.
    pub fn p95(&self) -> Duration {
        self.quantile(0.95)
    }

    /// 99th percentile latency.
    pub fn p99(&self) -> Duration {
        self.quantile(0.99)
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Channel metrics by name.
    pub channels: HashMap<String, ChannelMetrics>,

    /// First-token latency distributions by channel name.
    pub first_token: HashMap<String, LatencyHistogram>,

    /// Uptime when snapshot was taken.
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Format as a human-readable report.
    pub fn format_report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Instrumentation Metrics ===\n\n");
        report.push_str(&format!("Uptime: {:.2?}\n\n", self.uptime));

        if !self.channels.is_empty() {
            report.push_str("Channel Metrics:\n");
            for (name, metrics) in &self.channels {
                report.push_str(&format!(
                    "  {}: {} calls, {:.1}% success, avg {:.2?}, p99 {:.2?}\n",
                    name,
                    metrics.invocations,
                    metrics.success_rate() * 100.0,
                    metrics.avg_duration(),
                    metrics.latency.p99()
                ));
            }
            report.push('\n');
        }

        if !self.first_token.is_empty() {
            report.push_str("Time To First Token:\n");
            for (name, latency) in &self.first_token {
                report.push_str(&format!(
                    "  {}: {} streams, p50 {:.2?}, p99 {:.2?}\n",
                    name,
                    latency.samples(),
                    latency.p50(),
                    latency.p99()
                ));
            }
        }

        report
    }
}

/// Convenience function to record an invocation to global metrics.
pub fn record_invocation(channel: &str, duration: Duration, success: bool) {
    GLOBAL_METRICS.record_invocation(channel, duration, success);
}

/// Convenience function to record a first-token latency to global metrics.
pub fn record_first_token(channel: &str, latency: Duration) {
    GLOBAL_METRICS.record_first_token(channel, latency);
}
