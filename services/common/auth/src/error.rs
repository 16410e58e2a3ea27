use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Bad credentials or inactive account. Deliberately says nothing about which.
    #[error("invalid credentials")]
    Authentication,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token has been revoked")]
    RevokedToken,
    #[error("tenant context required: provide {required}")]
    TenantNotResolved { required: String },
    #[error("credential store unavailable: {0}")]
    Storage(String),
    #[error("invalid claim '{0}' with value '{1}'")]
    InvalidClaim(&'static str, String),
    #[error("malformed claim payload: {0}")]
    InvalidJson(String),
    #[error("failed to parse signing key '{0}': {1}")]
    KeyParse(String, String),
    #[error("failed to sign token with key '{0}': {1}")]
    Signing(String, String),
    #[error("authorization header missing")]
    MissingAuthorization,
    #[error("authorization header malformed")]
    InvalidAuthorization,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Authentication
            | AuthError::InvalidToken(_)
            | AuthError::RevokedToken
            | AuthError::MissingAuthorization
            | AuthError::InvalidAuthorization => StatusCode::UNAUTHORIZED,
            AuthError::TenantNotResolved { .. } => StatusCode::BAD_REQUEST,
            AuthError::InvalidClaim(_, _) | AuthError::InvalidJson(_) => StatusCode::UNAUTHORIZED,
            AuthError::Storage(_) | AuthError::KeyParse(_, _) | AuthError::Signing(_, _) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Authentication => "INVALID_CREDENTIALS",
            AuthError::InvalidToken(_) => "AUTH_TOKEN",
            AuthError::RevokedToken => "AUTH_TOKEN_REVOKED",
            AuthError::TenantNotResolved { .. } => "TENANT_REQUIRED",
            AuthError::Storage(_) | AuthError::KeyParse(_, _) | AuthError::Signing(_, _) => "SERVER_ERROR",
            AuthError::InvalidClaim(_, _) | AuthError::InvalidJson(_) => "AUTH_CLAIMS",
            AuthError::MissingAuthorization | AuthError::InvalidAuthorization => "AUTH_HEADER",
        }
    }

    /// Client-facing message. Internal failures are not described.
    fn public_message(&self) -> String {
        match self {
            AuthError::Storage(_) | AuthError::KeyParse(_, _) | AuthError::Signing(_, _) => {
                "Authentication is temporarily unavailable.".to_string()
            }
            AuthError::InvalidClaim(_, _) | AuthError::InvalidJson(_) => {
                "invalid token: malformed claims".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        Self::InvalidToken(value.to_string())
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code(),
            message: self.public_message(),
        };
        (self.status(), Json(body)).into_response()
    }
}
