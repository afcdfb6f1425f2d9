//! Admission outcome recording.
//!
//! The limiter itself keeps no counters. Whoever wraps it is handed an
//! [`OutcomeRecorder`] and reports each decision there.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{Result, WindowGuardError};

/// Final outcome of a rate-limited request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allowed,
    Blocked,
}

impl Outcome {
    pub fn as_label(self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::Blocked => "blocked",
        }
    }
}

/// Sink for per-request outcomes.
pub trait OutcomeRecorder: Send + Sync {
    fn record(&self, outcome: Outcome);

    /// The store could not be consulted for this request.
    fn record_store_failure(&self) {}
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

impl OutcomeRecorder for NoopRecorder {
    fn record(&self, _outcome: Outcome) {}
}

/// Prometheus counters held in a registry owned by the recorder.
#[derive(Clone)]
pub struct PrometheusRecorder {
    registry: Registry,
    requests: IntCounterVec,
    store_failures: IntCounter,
}

impl PrometheusRecorder {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(
                "ratelimiter_requests_total",
                "Total number of requests processed by the rate limiter",
            ),
            &["status"],
        )
        .map_err(metrics_error)?;
        let store_failures = IntCounter::new(
            "ratelimiter_store_failures_total",
            "Requests decided without the window store",
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(requests.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(store_failures.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            requests,
            store_failures,
        })
    }

    pub fn count(&self, outcome: Outcome) -> u64 {
        self.requests.with_label_values(&[outcome.as_label()]).get()
    }

    pub fn store_failures(&self) -> u64 {
        self.store_failures.get()
    }

    /// Render every registered metric in the text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| WindowGuardError::Server(e.to_string()))
    }
}

impl OutcomeRecorder for PrometheusRecorder {
    fn record(&self, outcome: Outcome) {
        self.requests.with_label_values(&[outcome.as_label()]).inc();
    }

    fn record_store_failure(&self) {
        self.store_failures.inc();
    }
}

fn metrics_error(e: prometheus::Error) -> WindowGuardError {
    WindowGuardError::Server(format!("metrics: {}", e))
}
