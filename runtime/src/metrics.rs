//! Prometheus metrics for observability and monitoring.
//!
//! Every primitive reports into the `metrics` facade through the recorders below. When no
//! recorder is installed the calls are no-ops, so instrumentation never blocks or fails
//! the guarded call.
//!
//! # Example
//!
//! ```rust,no_run
//! use pos_resilience_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve metrics on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.serve()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::CircuitState;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Either installs a recorder whose output is rendered on demand ([`MetricsServer::start`])
/// or also exposes it on an HTTP endpoint for scraping ([`MetricsServer::serve`]).
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the Prometheus recorder without an HTTP listener.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the existing recorder
    /// is kept and [`MetricsServer::render`] returns `None`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        match builder()?.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Metrics recorder installed");
                Ok(())
            }
            Err(e) => tolerate_existing(&e.to_string()),
        }
    }

    /// Install the recorder and serve `/metrics` on the configured address.
    ///
    /// Must be called from within a Tokio runtime; the listener runs as a spawned task.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    pub fn serve(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = builder()?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                self.handle = Some(handle);
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!("Metrics HTTP listener stopped");
                    }
                });
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => tolerate_existing(&e.to_string()),
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))
}

fn tolerate_existing(err_msg: &str) -> Result<(), MetricsError> {
    if err_msg.contains("already") {
        tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
        Ok(())
    } else {
        Err(MetricsError::Install(err_msg.to_string()))
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        // Circuit Breaker Metrics
        describe_gauge!(
            "circuit_breaker_state",
            "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
        );
        describe_counter!(
            "circuit_breaker_calls_total",
            "Total number of calls through circuit breaker"
        );
        describe_counter!(
            "circuit_breaker_successes_total",
            "Total number of successful calls"
        );
        describe_counter!(
            "circuit_breaker_failures_total",
            "Total number of failed calls"
        );
        describe_counter!(
            "circuit_breaker_rejections_total",
            "Total number of rejected calls (circuit open)"
        );
        describe_counter!(
            "circuit_breaker_transitions_total",
            "Total number of state transitions"
        );

        // Bulkhead Metrics
        describe_gauge!("bulkhead_in_flight", "Calls currently holding a bulkhead slot");
        describe_counter!("bulkhead_admitted_total", "Total number of admitted calls");
        describe_counter!(
            "bulkhead_rejected_total",
            "Total number of calls rejected because the bulkhead was full"
        );
        describe_histogram!(
            "bulkhead_call_duration_seconds",
            "Time admitted calls held their slot"
        );

        // Worker Pool Metrics
        describe_gauge!("worker_pool_queue_depth", "Tasks waiting in the queue");
        describe_counter!(
            "worker_pool_tasks_submitted_total",
            "Total number of tasks accepted by the pool"
        );
        describe_counter!(
            "worker_pool_tasks_completed_total",
            "Total number of tasks that ran to completion"
        );
        describe_counter!(
            "worker_pool_task_panics_total",
            "Total number of tasks that panicked"
        );

        // Rate Limiter Metrics
        describe_counter!("rate_limiter_allowed_total", "Total number of allowed requests");
        describe_counter!("rate_limiter_denied_total", "Total number of denied requests");
        describe_counter!(
            "rate_limiter_fail_open_total",
            "Requests allowed because the shared store was unavailable"
        );

        // Coalescer Metrics
        describe_counter!("coalescer_cache_hits_total", "Total number of cache hits");
        describe_counter!("coalescer_cache_misses_total", "Total number of cache misses");
        describe_counter!(
            "coalescer_coalesced_total",
            "Calls that joined an in-flight execution"
        );
        describe_counter!(
            "coalescer_fallback_calls_total",
            "Total number of fallback executions"
        );
        describe_counter!(
            "coalescer_cache_set_failures_total",
            "Fallback results that could not be cached"
        );
    });
}

/// Circuit breaker metrics recorder.
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    /// Record circuit breaker state.
    pub fn record_state(breaker: &str, state: CircuitState) {
        gauge!("circuit_breaker_state", "breaker" => breaker.to_owned()).set(state.as_gauge());
    }

    /// Record a call attempt.
    pub fn record_call(breaker: &str) {
        counter!("circuit_breaker_calls_total", "breaker" => breaker.to_owned()).increment(1);
    }

    /// Record a successful call.
    pub fn record_success(breaker: &str) {
        counter!("circuit_breaker_successes_total", "breaker" => breaker.to_owned()).increment(1);
    }

    /// Record a failed call.
    pub fn record_failure(breaker: &str) {
        counter!("circuit_breaker_failures_total", "breaker" => breaker.to_owned()).increment(1);
    }

    /// Record a rejected call (circuit open).
    pub fn record_rejection(breaker: &str) {
        counter!("circuit_breaker_rejections_total", "breaker" => breaker.to_owned())
            .increment(1);
    }

    /// Record a state transition.
    pub fn record_transition(breaker: &str, from: CircuitState, to: CircuitState) {
        counter!(
            "circuit_breaker_transitions_total",
            "breaker" => breaker.to_owned(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        Self::record_state(breaker, to);
    }
}

/// Bulkhead metrics recorder.
pub struct BulkheadMetrics;

impl BulkheadMetrics {
    /// Record an admitted call.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_admitted(bulkhead: &str, in_flight: usize) {
        counter!("bulkhead_admitted_total", "bulkhead" => bulkhead.to_owned()).increment(1);
        gauge!("bulkhead_in_flight", "bulkhead" => bulkhead.to_owned()).set(in_flight as f64);
    }

    /// Record a released slot.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_released(bulkhead: &str, in_flight: usize, held: Duration) {
        gauge!("bulkhead_in_flight", "bulkhead" => bulkhead.to_owned()).set(in_flight as f64);
        histogram!("bulkhead_call_duration_seconds", "bulkhead" => bulkhead.to_owned())
            .record(held.as_secs_f64());
    }

    /// Record a rejected call (bulkhead full).
    pub fn record_rejected(bulkhead: &str) {
        counter!("bulkhead_rejected_total", "bulkhead" => bulkhead.to_owned()).increment(1);
    }
}

/// Worker pool metrics recorder.
pub struct WorkerPoolMetrics;

impl WorkerPoolMetrics {
    /// Record an accepted submission.
    pub fn record_submitted(pool: &str) {
        counter!("worker_pool_tasks_submitted_total", "pool" => pool.to_owned()).increment(1);
    }

    /// Record a task that finished normally.
    pub fn record_completed(pool: &str) {
        counter!("worker_pool_tasks_completed_total", "pool" => pool.to_owned()).increment(1);
    }

    /// Record a task that panicked.
    pub fn record_panic(pool: &str) {
        counter!("worker_pool_task_panics_total", "pool" => pool.to_owned()).increment(1);
    }

    /// Record the number of queued tasks.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_queue_depth(pool: &str, depth: usize) {
        gauge!("worker_pool_queue_depth", "pool" => pool.to_owned()).set(depth as f64);
    }
}

/// Rate limiter metrics recorder.
pub struct RateLimiterMetrics;

impl RateLimiterMetrics {
    /// Record an allowed request.
    pub fn record_allowed(limiter: &str) {
        counter!("rate_limiter_allowed_total", "limiter" => limiter.to_owned()).increment(1);
    }

    /// Record a denied request.
    pub fn record_denied(limiter: &str) {
        counter!("rate_limiter_denied_total", "limiter" => limiter.to_owned()).increment(1);
    }

    /// Record a request allowed because the store was unavailable.
    pub fn record_fail_open(limiter: &str) {
        counter!("rate_limiter_fail_open_total", "limiter" => limiter.to_owned()).increment(1);
    }
}

/// Request coalescer metrics recorder.
pub struct CoalescerMetrics;

impl CoalescerMetrics {
    /// Record a cache hit.
    pub fn record_hit(coalescer: &str) {
        counter!("coalescer_cache_hits_total", "coalescer" => coalescer.to_owned()).increment(1);
    }

    /// Record a cache miss.
    pub fn record_miss(coalescer: &str) {
        counter!("coalescer_cache_misses_total", "coalescer" => coalescer.to_owned())
            .increment(1);
    }

    /// Record a caller joining an in-flight execution.
    pub fn record_coalesced(coalescer: &str) {
        counter!("coalescer_coalesced_total", "coalescer" => coalescer.to_owned()).increment(1);
    }

    /// Record a fallback execution.
    pub fn record_fallback(coalescer: &str) {
        counter!("coalescer_fallback_calls_total", "coalescer" => coalescer.to_owned())
            .increment(1);
    }

    /// Record a failed cache write.
    pub fn record_set_failure(coalescer: &str) {
        counter!("coalescer_cache_set_failures_total", "coalescer" => coalescer.to_owned())
            .increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn test_recorders_without_installed_recorder_are_noops() {
        CircuitBreakerMetrics::record_call("db");
        BulkheadMetrics::record_rejected("db");
        WorkerPoolMetrics::record_queue_depth("pool", 3);
        RateLimiterMetrics::record_fail_open("gateway");
        CoalescerMetrics::record_set_failure("orders");
    }

    #[test]
    fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        CircuitBreakerMetrics::record_transition("db", CircuitState::Closed, CircuitState::Open);
        RateLimiterMetrics::record_allowed("gateway");

        // If another test installed the recorder first, handle is None. Metrics are
        // still recorded globally.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("circuit_breaker_transitions_total"));
            assert!(rendered.contains("circuit_breaker_state"));
            assert!(rendered.contains("rate_limiter_allowed_total"));
        }
    }
}
