pub mod claims;
pub mod config;
pub mod error;
pub mod extractors;
pub mod guards;
pub mod roles;
pub mod tenant;
pub mod verifier;

pub use claims::{
    extract_role, extract_tenant_ids, has_any_tenant_claim, is_admin, is_owner, is_student,
    is_teacher, ClaimSet, TenantCollection, TokenClaims,
};
pub use config::JwtConfig;
pub use error::{AuthError, AuthResult};
pub use extractors::{bearer_token, AuthContext};
pub use guards::{ensure_role, ensure_tenant_membership, GuardError};
pub use roles::Role;
pub use tenant::{
    cookie_value, HostTenantLookup, ResolvedTenant, SubdomainTenantMap, TenantContext,
    TenantRequest, TenantResolver, TenantSource,
};
pub use verifier::{AccessTokenValidator, InMemoryKeyStore, JwtVerifier};
