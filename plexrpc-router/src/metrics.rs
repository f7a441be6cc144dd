//! Router counters.
//!
//! The cheap counters are always on: atomics owned by the router
//! instance, never a process singleton. Prometheus counters come alive
//! only when the host registers the router into a registry; from then on
//! both are bumped together.

use prometheus::{IntCounter, Opts, Registry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

struct PrometheusCounters {
    requests_total: IntCounter,
    errors_total: IntCounter,
    handler_errors_total: IntCounter,
    connections_total: IntCounter,
}

impl PrometheusCounters {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let requests_total = IntCounter::with_opts(Opts::new(
            "plexrpc_requests_total",
            "Total requests dispatched",
        ))?;
        registry.register(Box::new(requests_total.clone()))?;

        let errors_total = IntCounter::with_opts(Opts::new(
            "plexrpc_errors_total",
            "Total requests that failed",
        ))?;
        registry.register(Box::new(errors_total.clone()))?;

        let handler_errors_total = IntCounter::with_opts(Opts::new(
            "plexrpc_handler_errors_total",
            "Total requests whose handler failed",
        ))?;
        registry.register(Box::new(handler_errors_total.clone()))?;

        let connections_total = IntCounter::with_opts(Opts::new(
            "plexrpc_connections_total",
            "Total connections attached",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        Ok(Self {
            requests_total,
            errors_total,
            handler_errors_total,
            connections_total,
        })
    }
}

/// Aggregate counters for one router instance.
#[derive(Default)]
pub struct RouterStats {
    requests: AtomicU64,
    errors: AtomicU64,
    handler_errors: AtomicU64,
    connections: AtomicU64,
    prometheus: OnceLock<PrometheusCounters>,
}

impl RouterStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        let counters = PrometheusCounters::register(registry)?;
        let _ = self.prometheus.set(counters);
        Ok(())
    }

    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if let Some(counters) = self.prometheus.get() {
            counters.requests_total.inc();
        }
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if let Some(counters) = self.prometheus.get() {
            counters.errors_total.inc();
        }
    }

    pub(crate) fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
        if let Some(counters) = self.prometheus.get() {
            counters.handler_errors_total.inc();
        }
    }

    pub(crate) fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        if let Some(counters) = self.prometheus.get() {
            counters.connections_total.inc();
        }
    }

    /// Total requests dispatched.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Total requests that surfaced an error to the peer.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Total requests whose handler failed. Decode, encode and
    /// middleware failures count toward [`errors`](Self::errors) only.
    pub fn handler_errors(&self) -> u64 {
        self.handler_errors.load(Ordering::Relaxed)
    }

    /// Total connections attached.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}
