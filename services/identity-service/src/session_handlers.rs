use std::collections::BTreeSet;

use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use common_auth::{
    bearer_token, cookie_value, ensure_tenant_membership, AuthError, GuardError, TenantCollection,
    TenantContext, TenantSource,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{CookieConfig, CookieSameSite};
use crate::tokens::IssuedTokens;
use crate::AppState;

const EXPIRED_COOKIE_DATE: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

#[derive(Deserialize)]
pub struct LoginRequest {
    pub identifier: String,
    pub secret: String,
}

#[derive(Deserialize, Default)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub user_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub refresh_expires_in: i64,
    pub access_token_expires_at: String,
    pub refresh_token_expires_at: String,
}

impl From<IssuedTokens> for TokenResponse {
    fn from(issued: IssuedTokens) -> Self {
        Self {
            user_id: issued.user_id,
            access_token: issued.access_token,
            refresh_token: issued.refresh_token,
            token_type: issued.token_type,
            expires_in: issued.access_expires_in,
            refresh_expires_in: issued.refresh_expires_in,
            access_token_expires_at: issued
                .access_expires_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            refresh_token_expires_at: issued
                .refresh_expires_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub user_id: Uuid,
    pub role: Option<String>,
    pub tenant_id: Uuid,
    pub tenant_source: TenantSource,
    pub admin_tenant_ids: BTreeSet<Uuid>,
    pub teacher_tenant_ids: BTreeSet<Uuid>,
    pub student_tenant_ids: BTreeSet<Uuid>,
    pub tenant_ids: BTreeSet<Uuid>,
    pub is_owner: bool,
    pub is_admin: bool,
    pub is_teacher: bool,
    pub is_student: bool,
    pub expires_at: DateTime<Utc>,
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Response, AuthError> {
    let LoginRequest { identifier, secret } = request;

    let user_id = match state
        .tokens
        .directory()
        .verify_credentials(&identifier, &secret)
        .await
    {
        Ok(Some(user_id)) => user_id,
        Ok(None) => {
            state.record_login_metric("invalid_credentials");
            return Err(AuthError::Authentication);
        }
        Err(err) => {
            error!(error = %err, "credential verification failed");
            state.record_login_metric("error");
            return Err(err.into());
        }
    };

    let issued = match state.tokens.issue_token_pair(user_id).await {
        Ok(issued) => issued,
        Err(err) => {
            let outcome = match err {
                AuthError::Authentication => "inactive",
                _ => "error",
            };
            state.record_login_metric(outcome);
            return Err(err);
        }
    };

    state.record_login_metric("success");
    info!(user_id = %user_id, "login succeeded");
    Ok(token_response(&state.config.refresh_cookie, issued))
}

pub async fn refresh_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> Result<Response, AuthError> {
    let cookie_config = &state.config.refresh_cookie;
    let from_body = body.and_then(|Json(request)| request.refresh_token);
    let presented = cookie_value(&headers, &cookie_config.name)
        .map(str::to_owned)
        .or(from_body)
        .ok_or_else(|| AuthError::InvalidToken("refresh token missing".to_string()))?;

    let issued = state.tokens.rotate(&presented).await?;
    Ok(token_response(cookie_config, issued))
}

/// Blacklists the caller's access token, then revokes the refresh token
/// from the cookie. Always answers 204 and clears the cookie unless the
/// store is unavailable.
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AuthError> {
    if let Ok(access_token) = bearer_token(&headers) {
        match state.tokens.validate(&access_token).await {
            Ok(claims) => {
                let ttl = chrono::Duration::from_std(state.config.blacklist_retention)
                    .unwrap_or_else(|_| chrono::Duration::minutes(15));
                state.tokens.blacklist(&access_token, ttl).await?;
                info!(user_id = %claims.subject, "logged out");
            }
            Err(err @ AuthError::Storage(_)) => return Err(err),
            Err(err) => debug!(error = %err, "logout with unusable access token"),
        }
    }

    let cookie_config = &state.config.refresh_cookie;
    if let Some(refresh_token) = cookie_value(&headers, &cookie_config.name) {
        state.tokens.revoke(refresh_token).await?;
    }

    Ok((
        StatusCode::NO_CONTENT,
        [(SET_COOKIE, clear_refresh_cookie(cookie_config))],
    )
        .into_response())
}

/// Resolved tenant and role summary for the caller. The caller must belong
/// to the resolved tenant.
pub async fn session_context(context: TenantContext) -> Result<Json<SessionView>, GuardError> {
    let claims = &context.auth.claims;
    let tenant_id = context.tenant_id();
    ensure_tenant_membership(claims, tenant_id, TenantCollection::All)?;

    Ok(Json(SessionView {
        user_id: claims.subject,
        role: claims.role.map(|role| role.as_str().to_string()),
        tenant_id,
        tenant_source: context.tenant.source,
        admin_tenant_ids: claims.tenant_ids(TenantCollection::Admin).clone(),
        teacher_tenant_ids: claims.tenant_ids(TenantCollection::Teacher).clone(),
        student_tenant_ids: claims.tenant_ids(TenantCollection::Student).clone(),
        tenant_ids: claims.tenant_ids(TenantCollection::All).clone(),
        is_owner: claims.is_owner(),
        is_admin: claims.is_admin(),
        is_teacher: claims.is_teacher(),
        is_student: claims.is_student(),
        expires_at: claims.expires_at,
    }))
}

fn token_response(cookie_config: &CookieConfig, issued: IssuedTokens) -> Response {
    let cookie = refresh_cookie(cookie_config, &issued.refresh_token, issued.refresh_expires_in);
    (
        [(SET_COOKIE, cookie)],
        Json(TokenResponse::from(issued)),
    )
        .into_response()
}

fn cookie_attributes(config: &CookieConfig) -> String {
    let mut attributes = format!(
        "Path={}; HttpOnly; SameSite={}",
        config.path,
        config.same_site.as_str()
    );
    if config.secure || config.same_site == CookieSameSite::None {
        attributes.push_str("; Secure");
    }
    if let Some(domain) = &config.domain {
        attributes.push_str("; Domain=");
        attributes.push_str(domain);
    }
    attributes
}

pub fn refresh_cookie(config: &CookieConfig, value: &str, max_age_seconds: i64) -> String {
    format!(
        "{}={}; {}; Max-Age={}",
        config.name,
        value,
        cookie_attributes(config),
        max_age_seconds.max(0)
    )
}

pub fn clear_refresh_cookie(config: &CookieConfig) -> String {
    format!(
        "{}=; {}; Max-Age=0; Expires={}",
        config.name,
        cookie_attributes(config),
        EXPIRED_COOKIE_DATE
    )
}
