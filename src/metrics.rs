//! Metrics collection and export module

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::time::Instant;

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Counters
    pub attestations_total: IntCounter,
    pub attestations_success: IntCounter,
    pub attestations_failed: IntCounter,
    pub attestations_retried: IntCounter,
    pub oracle_rejections: IntCounter,
    pub validator_reselections: IntCounter,
    pub cycle_errors: IntCounter,

    // Gauges
    pub cursor_starting_block: IntGauge,
    pub cursor_offset: IntGauge,
    pub backlog_queue_len: IntGauge,

    // Histograms
    pub claim_latency: Histogram,
    pub batch_latency: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let attestations_total = IntCounter::with_opts(Opts::new(
            "attestations_total",
            "Total number of claim attestation attempts",
        ))?;

        let attestations_success = IntCounter::with_opts(Opts::new(
            "attestations_success",
            "Number of claims disbursed",
        ))?;

        let attestations_failed = IntCounter::with_opts(Opts::new(
            "attestations_failed",
            "Number of claims given up on",
        ))?;

        let attestations_retried = IntCounter::with_opts(Opts::new(
            "attestations_retried",
            "Number of retryable claim failures",
        ))?;

        let oracle_rejections = IntCounter::with_opts(Opts::new(
            "oracle_rejections",
            "Number of claims rejected by the oracle",
        ))?;

        let validator_reselections = IntCounter::with_opts(Opts::new(
            "validator_reselections",
            "Number of validator set reselections",
        ))?;

        let cycle_errors = IntCounter::with_opts(Opts::new(
            "cycle_errors",
            "Number of failed attester cycles",
        ))?;

        let cursor_starting_block = IntGauge::with_opts(Opts::new(
            "cursor_starting_block",
            "Backlog cursor starting block",
        ))?;

        let cursor_offset =
            IntGauge::with_opts(Opts::new("cursor_offset", "Backlog cursor offset"))?;

        let backlog_queue_len = IntGauge::with_opts(Opts::new(
            "backlog_queue_len",
            "Claims waiting in the local backlog queue",
        ))?;

        let claim_latency = Histogram::with_opts(
            HistogramOpts::new("claim_latency_seconds", "submit_and_evaluate latency per claim")
                .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        )?;

        let batch_latency = Histogram::with_opts(
            HistogramOpts::new("batch_latency_seconds", "Latency of one batch including retries")
                .buckets(vec![0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        )?;

        // Register all metrics
        registry.register(Box::new(attestations_total.clone()))?;
        registry.register(Box::new(attestations_success.clone()))?;
        registry.register(Box::new(attestations_failed.clone()))?;
        registry.register(Box::new(attestations_retried.clone()))?;
        registry.register(Box::new(oracle_rejections.clone()))?;
        registry.register(Box::new(validator_reselections.clone()))?;
        registry.register(Box::new(cycle_errors.clone()))?;
        registry.register(Box::new(cursor_starting_block.clone()))?;
        registry.register(Box::new(cursor_offset.clone()))?;
        registry.register(Box::new(backlog_queue_len.clone()))?;
        registry.register(Box::new(claim_latency.clone()))?;
        registry.register(Box::new(batch_latency.clone()))?;

        Ok(Self {
            registry,
            attestations_total,
            attestations_success,
            attestations_failed,
            attestations_retried,
            oracle_rejections,
            validator_reselections,
            cycle_errors,
            cursor_starting_block,
            cursor_offset,
            backlog_queue_len,
            claim_latency,
            batch_latency,
        })
    }

    /// Render every registered metric in the Prometheus text format
    pub fn gather_text(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.elapsed_secs());
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
