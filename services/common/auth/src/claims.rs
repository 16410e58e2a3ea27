use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::roles::Role;

/// The four tenant-membership collections carried by an access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TenantCollection {
    Admin,
    Teacher,
    Student,
    All,
}

impl TenantCollection {
    /// JWT claim name holding this collection.
    pub fn claim_key(&self) -> &'static str {
        match self {
            TenantCollection::Admin => "admin_tenant_ids",
            TenantCollection::Teacher => "teacher_tenant_ids",
            TenantCollection::Student => "student_tenant_ids",
            TenantCollection::All => "tenant_ids",
        }
    }
}

impl fmt::Display for TenantCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.claim_key())
    }
}

/// Verified, request-scoped view of an access token.
///
/// Produced once per request by token validation and passed explicitly to
/// whatever needs role or tenant facts. `tenant_ids` always contains every id
/// of the three scoped collections.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimSet {
    pub subject: Uuid,
    pub role: Option<Role>,
    pub admin_tenant_ids: BTreeSet<Uuid>,
    pub teacher_tenant_ids: BTreeSet<Uuid>,
    pub student_tenant_ids: BTreeSet<Uuid>,
    pub tenant_ids: BTreeSet<Uuid>,
    pub token_id: Option<Uuid>,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub issuer: String,
    pub audience: Vec<String>,
}

impl ClaimSet {
    pub fn tenant_ids(&self, collection: TenantCollection) -> &BTreeSet<Uuid> {
        match collection {
            TenantCollection::Admin => &self.admin_tenant_ids,
            TenantCollection::Teacher => &self.teacher_tenant_ids,
            TenantCollection::Student => &self.student_tenant_ids,
            TenantCollection::All => &self.tenant_ids,
        }
    }

    pub fn has_any_tenant(&self, collection: TenantCollection) -> bool {
        !self.tenant_ids(collection).is_empty()
    }

    pub fn is_owner(&self) -> bool {
        is_owner(self)
    }

    pub fn is_admin(&self) -> bool {
        is_admin(self)
    }

    pub fn is_teacher(&self) -> bool {
        is_teacher(self)
    }

    pub fn is_student(&self) -> bool {
        is_student(self)
    }
}

/// Normalized role of the caller, if the token carries a known one.
pub fn extract_role(claims: &ClaimSet) -> Option<Role> {
    claims.role
}

pub fn extract_tenant_ids(claims: &ClaimSet, collection: TenantCollection) -> BTreeSet<Uuid> {
    claims.tenant_ids(collection).clone()
}

pub fn has_any_tenant_claim(claims: &ClaimSet, collection: TenantCollection) -> bool {
    claims.has_any_tenant(collection)
}

pub fn is_owner(claims: &ClaimSet) -> bool {
    match claims.role {
        Some(Role::Owner) => true,
        Some(Role::Admin | Role::Teacher | Role::Student | Role::Parent) | None => false,
    }
}

/// Admin means the admin or owner role, or any scoped admin grant.
pub fn is_admin(claims: &ClaimSet) -> bool {
    let by_role = match claims.role {
        Some(Role::Owner | Role::Admin) => true,
        Some(Role::Teacher | Role::Student | Role::Parent) | None => false,
    };
    by_role || claims.has_any_tenant(TenantCollection::Admin)
}

pub fn is_teacher(claims: &ClaimSet) -> bool {
    match claims.role {
        Some(Role::Teacher) => true,
        Some(Role::Owner | Role::Admin | Role::Student | Role::Parent) | None => false,
    }
}

pub fn is_student(claims: &ClaimSet) -> bool {
    match claims.role {
        Some(Role::Student) => true,
        Some(Role::Owner | Role::Admin | Role::Teacher | Role::Parent) | None => false,
    }
}

/// Wire shape of the access-token payload, used when signing.
#[derive(Debug, Clone, Serialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub admin_tenant_ids: Vec<String>,
    pub teacher_tenant_ids: Vec<String>,
    pub student_tenant_ids: Vec<String>,
    pub tenant_ids: Vec<String>,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
}

#[derive(Debug, Deserialize)]
struct ClaimsRepr {
    sub: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    admin_tenant_ids: Option<Value>,
    #[serde(default)]
    teacher_tenant_ids: Option<Value>,
    #[serde(default)]
    student_tenant_ids: Option<Value>,
    #[serde(default)]
    tenant_ids: Option<Value>,
    exp: i64,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    jti: Option<String>,
    iss: String,
    #[serde(default)]
    aud: Option<AudienceRepr>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AudienceRepr {
    Single(String),
    Many(Vec<String>),
}

/// Parses one tenant collection. Accepts a JSON array or a comma separated
/// string; entries that are not well-formed UUIDs are dropped.
fn parse_tenant_collection(key: &'static str, value: Option<&Value>) -> BTreeSet<Uuid> {
    let mut ids = BTreeSet::new();
    let mut push = |raw: &str| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return;
        }
        match Uuid::parse_str(trimmed) {
            Ok(id) => {
                ids.insert(id);
            }
            Err(_) => debug!(claim = key, "skipping malformed tenant id"),
        }
    };

    match value {
        Some(Value::Array(items)) => {
            for item in items {
                match item {
                    Value::String(raw) => push(raw.as_str()),
                    _ => debug!(claim = key, "skipping non-string tenant id"),
                }
            }
        }
        Some(Value::String(raw)) => raw.split(',').for_each(&mut push),
        Some(Value::Null) | None => {}
        Some(_) => debug!(claim = key, "ignoring tenant collection of unexpected type"),
    }

    ids
}

impl TryFrom<ClaimsRepr> for ClaimSet {
    type Error = AuthError;

    fn try_from(value: ClaimsRepr) -> AuthResult<Self> {
        let subject = Uuid::parse_str(&value.sub)
            .map_err(|_| AuthError::InvalidClaim("sub", value.sub.clone()))?;

        let role = match value.role.as_deref().map(str::trim) {
            Some("") | None => None,
            Some(raw) => {
                let parsed = Role::parse(raw);
                if parsed.is_none() {
                    debug!(role = raw, "token carries unrecognised role");
                }
                parsed
            }
        };

        let expires_at = Utc
            .timestamp_opt(value.exp, 0)
            .single()
            .ok_or_else(|| AuthError::InvalidClaim("exp", value.exp.to_string()))?;

        let issued_at = match value.iat {
            Some(iat) => Some(
                Utc.timestamp_opt(iat, 0)
                    .single()
                    .ok_or_else(|| AuthError::InvalidClaim("iat", iat.to_string()))?,
            ),
            None => None,
        };

        let token_id = value
            .jti
            .as_deref()
            .and_then(|raw| Uuid::parse_str(raw).ok());

        let admin_tenant_ids = parse_tenant_collection(
            TenantCollection::Admin.claim_key(),
            value.admin_tenant_ids.as_ref(),
        );
        let teacher_tenant_ids = parse_tenant_collection(
            TenantCollection::Teacher.claim_key(),
            value.teacher_tenant_ids.as_ref(),
        );
        let student_tenant_ids = parse_tenant_collection(
            TenantCollection::Student.claim_key(),
            value.student_tenant_ids.as_ref(),
        );
        let mut tenant_ids =
            parse_tenant_collection(TenantCollection::All.claim_key(), value.tenant_ids.as_ref());
        tenant_ids.extend(admin_tenant_ids.iter().copied());
        tenant_ids.extend(teacher_tenant_ids.iter().copied());
        tenant_ids.extend(student_tenant_ids.iter().copied());

        let audience = match value.aud {
            Some(AudienceRepr::Single(item)) => vec![item],
            Some(AudienceRepr::Many(items)) => items,
            None => Vec::new(),
        };

        Ok(Self {
            subject,
            role,
            admin_tenant_ids,
            teacher_tenant_ids,
            student_tenant_ids,
            tenant_ids,
            token_id,
            issued_at,
            expires_at,
            issuer: value.iss,
            audience,
        })
    }
}

impl TryFrom<Value> for ClaimSet {
    type Error = AuthError;

    fn try_from(value: Value) -> AuthResult<Self> {
        let repr: ClaimsRepr =
            serde_json::from_value(value).map_err(|err| AuthError::InvalidJson(err.to_string()))?;
        ClaimSet::try_from(repr)
    }
}
