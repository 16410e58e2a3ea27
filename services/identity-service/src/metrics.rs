use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct AuthMetrics {
    registry: Registry,
    login_attempts: IntCounterVec,
    token_events: IntCounterVec,
    cleanup_sweeps: IntCounterVec,
    purged_rows: IntCounterVec,
}

impl AuthMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let login_attempts = IntCounterVec::new(
            Opts::new(
                "auth_login_attempts_total",
                "Count of login attempts grouped by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(login_attempts.clone()))?;

        let token_events = IntCounterVec::new(
            Opts::new(
                "auth_token_events_total",
                "Token lifecycle events (issued, rotated, revoked, blacklisted, reuse_detected, ...)",
            ),
            &["event"],
        )?;
        registry.register(Box::new(token_events.clone()))?;

        let cleanup_sweeps = IntCounterVec::new(
            Opts::new(
                "auth_cleanup_sweeps_total",
                "Credential cleanup sweeps grouped by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(cleanup_sweeps.clone()))?;

        let purged_rows = IntCounterVec::new(
            Opts::new(
                "auth_cleanup_purged_rows_total",
                "Rows deleted by the cleanup sweep",
            ),
            &["table"],
        )?;
        registry.register(Box::new(purged_rows.clone()))?;

        Ok(Self {
            registry,
            login_attempts,
            token_events,
            cleanup_sweeps,
            purged_rows,
        })
    }

    pub fn login_attempt(&self, outcome: &str) {
        self.login_attempts.with_label_values(&[outcome]).inc();
    }

    pub fn token_event(&self, event: &str) {
        self.token_events.with_label_values(&[event]).inc();
    }

    pub fn cleanup_sweep(&self, outcome: &str) {
        self.cleanup_sweeps.with_label_values(&[outcome]).inc();
    }

    pub fn purged(&self, table: &str, rows: u64) {
        self.purged_rows.with_label_values(&[table]).inc_by(rows);
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
