use std::sync::Arc;

use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use common_auth::{AccessTokenValidator, TenantResolver};
use tracing::error;

use crate::config::AuthConfig;
use crate::metrics::AuthMetrics;
use crate::session_handlers::{login, logout, refresh_session, session_context};
use crate::tokens::TokenManager;

#[derive(Clone)]
pub struct AppState {
    pub tokens: Arc<TokenManager>,
    pub tenant_resolver: Arc<TenantResolver>,
    pub config: Arc<AuthConfig>,
    pub metrics: Arc<AuthMetrics>,
}

impl FromRef<AppState> for Arc<dyn AccessTokenValidator> {
    fn from_ref(state: &AppState) -> Self {
        state.tokens.clone()
    }
}

impl FromRef<AppState> for Arc<TenantResolver> {
    fn from_ref(state: &AppState) -> Self {
        state.tenant_resolver.clone()
    }
}

impl FromRef<AppState> for Arc<AuthConfig> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

impl AppState {
    pub fn record_login_metric(&self, outcome: &str) {
        self.metrics.login_attempt(outcome);
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/login", post(login))
        .route("/session/refresh", post(refresh_session))
        .route("/logout", post(logout))
        .route("/session", get(session_context))
        .route("/tenants/:tenant_id/session", get(session_context))
        .with_state(state)
}
