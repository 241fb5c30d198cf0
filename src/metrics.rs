use std::time::Duration;

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    request_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    active_sessions: IntGauge,
    session_outcomes_total: IntCounterVec,
    session_duration_seconds: HistogramVec,
    fallback_total: IntCounterVec,
    upstream_errors_total: IntCounterVec,
}

/// Keeps the active-session gauge raised for as long as a relay stream lives.
pub struct ActiveSessionGuard {
    gauge: IntGauge,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_total = IntCounterVec::new(
            opts!("relay_http_requests_total", "Total HTTP requests processed by the relay"),
            &["path", "method", "status"],
        )
        .expect("valid request_total metric");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "relay_http_request_duration_seconds",
                "Time until the response head was produced, in seconds",
            ),
            &["path", "method"],
        )
        .expect("valid request_duration_seconds metric");

        let active_sessions = IntGauge::new(
            "relay_active_sessions",
            "Streaming sessions currently relaying events",
        )
        .expect("valid active_sessions metric");

        let session_outcomes_total = IntCounterVec::new(
            opts!(
                "relay_session_outcomes_total",
                "Finished streaming sessions by backend and final state"
            ),
            &["backend", "outcome"],
        )
        .expect("valid session_outcomes_total metric");

        let session_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "relay_session_duration_seconds",
                "Wall-clock lifetime of streaming sessions, in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["backend"],
        )
        .expect("valid session_duration_seconds metric");

        let fallback_total = IntCounterVec::new(
            opts!(
                "relay_fallback_total",
                "Non-streaming fallback calls by backend and result"
            ),
            &["backend", "result"],
        )
        .expect("valid fallback_total metric");

        let upstream_errors_total = IntCounterVec::new(
            opts!(
                "relay_upstream_errors_total",
                "Upstream failures by backend, call phase and error kind"
            ),
            &["backend", "phase", "kind"],
        )
        .expect("valid upstream_errors_total metric");

        registry
            .register(Box::new(request_total.clone()))
            .expect("register request_total");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("register request_duration_seconds");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("register active_sessions");
        registry
            .register(Box::new(session_outcomes_total.clone()))
            .expect("register session_outcomes_total");
        registry
            .register(Box::new(session_duration_seconds.clone()))
            .expect("register session_duration_seconds");
        registry
            .register(Box::new(fallback_total.clone()))
            .expect("register fallback_total");
        registry
            .register(Box::new(upstream_errors_total.clone()))
            .expect("register upstream_errors_total");

        Self {
            registry,
            request_total,
            request_duration_seconds,
            active_sessions,
            session_outcomes_total,
            session_duration_seconds,
            fallback_total,
            upstream_errors_total,
        }
    }

    pub fn active_session(&self) -> ActiveSessionGuard {
        self.active_sessions.inc();
        ActiveSessionGuard {
            gauge: self.active_sessions.clone(),
        }
    }

    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.get()
    }

    pub fn observe_request(&self, path: &str, method: &str, status: u16, duration: Duration) {
        let status_label = status.to_string();
        self.request_total
            .with_label_values(&[path, method, &status_label])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[path, method])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_session(&self, backend: &str, outcome: &str, duration: Duration) {
        self.session_outcomes_total
            .with_label_values(&[backend, outcome])
            .inc();
        self.session_duration_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_fallback(&self, backend: &str, result: &str) {
        self.fallback_total.with_label_values(&[backend, result]).inc();
    }

    pub fn observe_upstream_error(&self, backend: &str, phase: &str, kind: &str) {
        self.upstream_errors_total
            .with_label_values(&[backend, phase, kind])
            .inc();
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
