//! ---
//! hydra_section: "04-runtime-core"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Presence, dispatch, queueing and correlation runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

/// Prometheus handles for runtime activity. Opt-in via [`crate::Hydra::with_metrics`].
pub struct HydraMetrics {
    sent: IntCounterVec,
    received: IntCounter,
    dropped: IntCounter,
    handler_errors: IntCounter,
    queue_ops: IntCounterVec,
    presence_failures: IntCounter,
    response_latency: Histogram,
}

impl HydraMetrics {
    /// Create the collectors and register them with `registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sent = IntCounterVec::new(
            Opts::new("hydra_messages_sent_total", "Envelopes published by this instance"),
            &["mode"],
        )?;
        let received = IntCounter::with_opts(Opts::new(
            "hydra_messages_received_total",
            "Envelopes delivered on this instance's channels",
        ))?;
        let dropped = IntCounter::with_opts(Opts::new(
            "hydra_messages_dropped_total",
            "Inbound payloads that could not be decoded or sends that reached nobody",
        ))?;
        let handler_errors = IntCounter::with_opts(Opts::new(
            "hydra_handler_errors_total",
            "Failures raised by message or queue handlers",
        ))?;
        let queue_ops = IntCounterVec::new(
            Opts::new("hydra_queue_operations_total", "Durable queue operations"),
            &["op"],
        )?;
        let presence_failures = IntCounter::with_opts(Opts::new(
            "hydra_presence_tick_failures_total",
            "Presence or health writes that failed",
        ))?;
        let response_latency = Histogram::with_opts(HistogramOpts::new(
            "hydra_response_latency_seconds",
            "Time between sending a request and receiving its correlated response",
        ))?;

        registry.register(Box::new(sent.clone()))?;
        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(handler_errors.clone()))?;
        registry.register(Box::new(queue_ops.clone()))?;
        registry.register(Box::new(presence_failures.clone()))?;
        registry.register(Box::new(response_latency.clone()))?;

        Ok(Self {
            sent,
            received,
            dropped,
            handler_errors,
            queue_ops,
            presence_failures,
            response_latency,
        })
    }

    /// `mode` is `direct` or `broadcast`.
    pub fn observe_sent(&self, mode: &str) {
        self.sent.with_label_values(&[mode]).inc();
    }

    /// Count one decoded inbound message.
    pub fn observe_received(&self) {
        self.received.inc();
    }

    /// Count one message that was dropped undelivered or undecodable.
    pub fn observe_dropped(&self) {
        self.dropped.inc();
    }

    /// Count one failed message handler invocation.
    pub fn observe_handler_error(&self) {
        self.handler_errors.inc();
    }

    /// `op` is `enqueue`, `dequeue`, `complete` or `requeue`.
    pub fn observe_queue(&self, op: &str) {
        self.queue_ops.with_label_values(&[op]).inc();
    }

    /// Count one failed presence or health write.
    pub fn observe_presence_failure(&self) {
        self.presence_failures.inc();
    }

    /// Record the time from request send to correlated reply.
    pub fn observe_response_latency(&self, duration: Duration) {
        self.response_latency.observe(duration.as_secs_f64());
    }
}
