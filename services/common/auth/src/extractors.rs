use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::{header::AUTHORIZATION, request::Parts, HeaderMap, HeaderValue};
use uuid::Uuid;

use crate::claims::{self, ClaimSet, TenantCollection};
use crate::error::{AuthError, AuthResult};
use crate::roles::Role;
use crate::verifier::AccessTokenValidator;

/// Authenticated request context: the validated claim set plus the raw bearer
/// token it came from (needed at logout to blacklist it).
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub claims: ClaimSet,
    pub token: String,
}

impl AuthContext {
    pub fn user_id(&self) -> Uuid {
        self.claims.subject
    }

    pub fn role(&self) -> Option<Role> {
        claims::extract_role(&self.claims)
    }

    pub fn tenant_ids(&self, collection: TenantCollection) -> BTreeSet<Uuid> {
        claims::extract_tenant_ids(&self.claims, collection)
    }

    pub fn has_any_tenant_claim(&self, collection: TenantCollection) -> bool {
        claims::has_any_tenant_claim(&self.claims, collection)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    Arc<dyn AccessTokenValidator>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let validator = Arc::<dyn AccessTokenValidator>::from_ref(state);
        let token = bearer_token(&parts.headers)?;
        let claims = validator.validate(&token).await?;
        Ok(Self { claims, token })
    }
}

/// Pulls the bearer token out of the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> AuthResult<String> {
    let header_value = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingAuthorization)?;
    parse_bearer(header_value)
}

fn parse_bearer(value: &HeaderValue) -> AuthResult<String> {
    let raw = value
        .to_str()
        .map_err(|_| AuthError::InvalidAuthorization)?
        .trim();

    let (scheme, token) = raw
        .split_once(' ')
        .ok_or(AuthError::InvalidAuthorization)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthorization);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::InvalidAuthorization);
    }

    Ok(token.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::tests::claim_set;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    #[test]
    fn parse_bearer_accepts_valid_token() {
        let header = HeaderValue::from_static("Bearer abc.def.ghi");
        let token = parse_bearer(&header).expect("token");
        assert_eq!(token, "abc.def.ghi");
    }

    #[test]
    fn parse_bearer_accepts_lowercase_scheme() {
        let header = HeaderValue::from_static("bearer abc.def.ghi");
        assert_eq!(parse_bearer(&header).expect("token"), "abc.def.ghi");
    }

    #[test]
    fn parse_bearer_rejects_wrong_scheme() {
        let header = HeaderValue::from_static("Basic credentials");
        let err = parse_bearer(&header).expect_err("should reject");
        assert!(matches!(err, AuthError::InvalidAuthorization));
    }

    #[test]
    fn parse_bearer_rejects_empty_value() {
        let header = HeaderValue::from_static("Bearer    ");
        let err = parse_bearer(&header).expect_err("should reject empty token");
        assert!(matches!(err, AuthError::InvalidAuthorization));
    }

    struct FixedValidator(ClaimSet);

    #[async_trait]
    impl AccessTokenValidator for FixedValidator {
        async fn validate(&self, token: &str) -> AuthResult<ClaimSet> {
            if token == "good" {
                Ok(self.0.clone())
            } else {
                Err(AuthError::RevokedToken)
            }
        }
    }

    #[derive(Clone)]
    struct TestState {
        validator: Arc<dyn AccessTokenValidator>,
    }

    impl FromRef<TestState> for Arc<dyn AccessTokenValidator> {
        fn from_ref(state: &TestState) -> Self {
            state.validator.clone()
        }
    }

    async fn whoami(auth: AuthContext) -> impl IntoResponse {
        auth.role().map(|role| role.to_string()).unwrap_or_default()
    }

    fn app() -> Router {
        let state = TestState {
            validator: Arc::new(FixedValidator(claim_set(Some(Role::Admin)))),
        };
        Router::new().route("/me", get(whoami)).with_state(state)
    }

    #[tokio::test]
    async fn extractor_passes_validated_claims_to_handler() {
        let request = Request::builder()
            .uri("/me")
            .header(AUTHORIZATION, "Bearer good")
            .body(Body::empty())
            .expect("request");
        let response = app().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn extractor_rejects_missing_and_revoked_tokens() {
        let missing = Request::builder().uri("/me").body(Body::empty()).expect("request");
        let response = app().oneshot(missing).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let revoked = Request::builder()
            .uri("/me")
            .header(AUTHORIZATION, "Bearer stale")
            .body(Body::empty())
            .expect("request");
        let response = app().oneshot(revoked).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
