use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts, Query, RawPathParams};
use axum::http::{header, request::Parts, HeaderMap, Uri};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::claims::{ClaimSet, TenantCollection};
use crate::error::{AuthError, AuthResult};
use crate::extractors::AuthContext;
use crate::verifier::AccessTokenValidator;

pub const DEFAULT_TENANT_HEADER: &str = "X-Tenant-ID";
pub const DEFAULT_TENANT_COOKIE: &str = "tenant_id";
pub const DEFAULT_TENANT_QUERY_PARAM: &str = "tenant_id";
pub const DEFAULT_TENANT_PATH_PARAM: &str = "tenant_id";

/// Where the effective tenant id came from. Variants are listed in
/// resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantSource {
    Path,
    Header,
    Cookie,
    Query,
    Host,
    Claims,
}

impl fmt::Display for TenantSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TenantSource::Path => "path",
            TenantSource::Header => "header",
            TenantSource::Cookie => "cookie",
            TenantSource::Query => "query",
            TenantSource::Host => "host",
            TenantSource::Claims => "claims",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedTenant {
    pub tenant_id: Uuid,
    pub source: TenantSource,
}

/// Maps a request host to a tenant (e.g. `greenwood.example.edu` → Greenwood).
pub trait HostTenantLookup: Send + Sync {
    fn lookup(&self, host: &str) -> Option<Uuid>;
}

/// Static host/subdomain table. Full host names win over first-label matches.
#[derive(Debug, Clone, Default)]
pub struct SubdomainTenantMap {
    entries: HashMap<String, Uuid>,
}

impl SubdomainTenantMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host_or_subdomain: &str, tenant_id: Uuid) {
        self.entries
            .insert(host_or_subdomain.trim().to_ascii_lowercase(), tenant_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Uuid)> for SubdomainTenantMap {
    fn from_iter<I: IntoIterator<Item = (String, Uuid)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (host, tenant_id) in iter {
            map.insert(&host, tenant_id);
        }
        map
    }
}

impl HostTenantLookup for SubdomainTenantMap {
    fn lookup(&self, host: &str) -> Option<Uuid> {
        let host = host.trim().to_ascii_lowercase();
        let host = host.split(':').next().unwrap_or_default();
        if host.is_empty() {
            return None;
        }
        if let Some(id) = self.entries.get(host) {
            return Some(*id);
        }
        let (label, rest) = host.split_once('.')?;
        if rest.is_empty() {
            return None;
        }
        self.entries.get(label).copied()
    }
}

/// Request facts the resolver reads. Borrowed so callers outside axum can
/// build one from whatever request type they hold.
#[derive(Debug, Clone, Copy)]
pub struct TenantRequest<'a> {
    pub path_tenant: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub uri: Option<&'a Uri>,
    pub claims: Option<&'a ClaimSet>,
}

/// Determines the single tenant a request operates on.
///
/// Sources are tried in the order of [`TenantSource`]; a missing or malformed
/// value falls through to the next one. Authorization against the resolved
/// tenant is left to the caller (see `guards`).
#[derive(Clone)]
pub struct TenantResolver {
    header_name: String,
    cookie_name: String,
    query_param: String,
    host_lookup: Option<Arc<dyn HostTenantLookup>>,
}

impl Default for TenantResolver {
    fn default() -> Self {
        Self {
            header_name: DEFAULT_TENANT_HEADER.to_string(),
            cookie_name: DEFAULT_TENANT_COOKIE.to_string(),
            query_param: DEFAULT_TENANT_QUERY_PARAM.to_string(),
            host_lookup: None,
        }
    }
}

impl TenantResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    pub fn with_query_param(mut self, name: impl Into<String>) -> Self {
        self.query_param = name.into();
        self
    }

    pub fn with_host_lookup(mut self, lookup: Arc<dyn HostTenantLookup>) -> Self {
        self.host_lookup = Some(lookup);
        self
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    pub fn resolve(&self, request: &TenantRequest<'_>) -> AuthResult<ResolvedTenant> {
        let found = self
            .path_tenant(request)
            .map(|id| (id, TenantSource::Path))
            .or_else(|| self.header_tenant(request).map(|id| (id, TenantSource::Header)))
            .or_else(|| self.cookie_tenant(request).map(|id| (id, TenantSource::Cookie)))
            .or_else(|| self.query_tenant(request).map(|id| (id, TenantSource::Query)))
            .or_else(|| self.host_tenant(request).map(|id| (id, TenantSource::Host)))
            .or_else(|| claims_tenant(request).map(|id| (id, TenantSource::Claims)));

        match found {
            Some((tenant_id, source)) => {
                debug!(%tenant_id, %source, "resolved tenant");
                Ok(ResolvedTenant { tenant_id, source })
            }
            None => Err(AuthError::TenantNotResolved {
                required: format!("the {} header", self.header_name),
            }),
        }
    }

    fn path_tenant(&self, request: &TenantRequest<'_>) -> Option<Uuid> {
        request.path_tenant.and_then(parse_tenant)
    }

    fn header_tenant(&self, request: &TenantRequest<'_>) -> Option<Uuid> {
        request
            .headers
            .get(self.header_name.as_str())
            .and_then(|value| value.to_str().ok())
            .and_then(parse_tenant)
    }

    fn cookie_tenant(&self, request: &TenantRequest<'_>) -> Option<Uuid> {
        cookie_value(request.headers, &self.cookie_name).and_then(parse_tenant)
    }

    fn query_tenant(&self, request: &TenantRequest<'_>) -> Option<Uuid> {
        let Query(params) = Query::<HashMap<String, String>>::try_from_uri(request.uri?).ok()?;
        params.get(&self.query_param).and_then(|value| parse_tenant(value))
    }

    fn host_tenant(&self, request: &TenantRequest<'_>) -> Option<Uuid> {
        let lookup = self.host_lookup.as_ref()?;
        let host = request
            .headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())?;
        lookup.lookup(host)
    }
}

/// Teacher memberships take precedence over the general membership union.
fn claims_tenant(request: &TenantRequest<'_>) -> Option<Uuid> {
    let claims = request.claims?;
    claims
        .tenant_ids(TenantCollection::Teacher)
        .iter()
        .next()
        .or_else(|| claims.tenant_ids(TenantCollection::All).iter().next())
        .copied()
}

fn parse_tenant(raw: &str) -> Option<Uuid> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Uuid::parse_str(trimmed).ok()
}

/// Finds a cookie by name across every `Cookie` header.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key.trim() == name).then(|| value.trim())
        })
}

/// Authenticated request bound to a resolved tenant.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub auth: AuthContext,
    pub tenant: ResolvedTenant,
}

impl TenantContext {
    pub fn tenant_id(&self) -> Uuid {
        self.tenant.tenant_id
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    Arc<dyn AccessTokenValidator>: FromRef<S>,
    Arc<TenantResolver>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = AuthContext::from_request_parts(parts, state).await?;
        let resolver = Arc::<TenantResolver>::from_ref(state);

        let path_tenant = match RawPathParams::from_request_parts(parts, state).await {
            Ok(params) => params
                .iter()
                .find(|(key, _)| *key == DEFAULT_TENANT_PATH_PARAM)
                .map(|(_, value)| value.to_owned()),
            Err(_) => None,
        };

        let request = TenantRequest {
            path_tenant: path_tenant.as_deref(),
            headers: &parts.headers,
            uri: Some(&parts.uri),
            claims: Some(&auth.claims),
        };
        let tenant = resolver.resolve(&request)?;

        Ok(Self { auth, tenant })
    }
}
