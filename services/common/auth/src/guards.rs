use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;
use uuid::Uuid;

use crate::claims::{ClaimSet, TenantCollection};
use crate::roles::Role;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    Forbidden { required: Vec<Role> },
    NotMember { tenant_id: Uuid, collection: TenantCollection },
}

impl GuardError {
    pub fn into_status(self) -> (StatusCode, String) {
        match self {
            GuardError::Forbidden { required } => (
                StatusCode::FORBIDDEN,
                if required.is_empty() {
                    "Insufficient role".to_string()
                } else {
                    let names = required.iter().map(Role::as_str).collect::<Vec<_>>();
                    format!("Insufficient role. Required one of: {}", names.join(", "))
                },
            ),
            GuardError::NotMember {
                tenant_id,
                collection,
            } => (
                StatusCode::FORBIDDEN,
                format!("Caller has no {collection} grant for tenant {tenant_id}"),
            ),
        }
    }
}

impl From<GuardError> for (StatusCode, String) {
    fn from(value: GuardError) -> Self {
        value.into_status()
    }
}

impl IntoResponse for GuardError {
    fn into_response(self) -> Response {
        self.into_status().into_response()
    }
}

pub fn ensure_role(claims: &ClaimSet, allowed: &[Role]) -> Result<(), GuardError> {
    if allowed.is_empty() {
        return Ok(());
    }

    match claims.role {
        Some(role) if allowed.contains(&role) => Ok(()),
        _ => {
            warn!(subject = %claims.subject, role = ?claims.role, ?allowed, "role_check_failed");
            Err(GuardError::Forbidden {
                required: allowed.to_vec(),
            })
        }
    }
}

/// Checks that the caller holds a grant of the given kind for `tenant_id`.
///
/// Owners pass for every tenant. Organisation admins pass any check on a
/// tenant they are a member of.
pub fn ensure_tenant_membership(
    claims: &ClaimSet,
    tenant_id: Uuid,
    collection: TenantCollection,
) -> Result<(), GuardError> {
    let granted = match claims.role {
        Some(Role::Owner) => true,
        Some(Role::Admin) => claims.tenant_ids(TenantCollection::All).contains(&tenant_id),
        Some(Role::Teacher | Role::Student | Role::Parent) | None => false,
    } || claims.tenant_ids(collection).contains(&tenant_id);

    if granted {
        Ok(())
    } else {
        warn!(subject = %claims.subject, %tenant_id, %collection, "tenant_membership_check_failed");
        Err(GuardError::NotMember {
            tenant_id,
            collection,
        })
    }
}
