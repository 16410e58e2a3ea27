use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use common_auth::{SubdomainTenantMap, TenantResolver};

use crate::cleanup::CleanupPolicy;
use crate::tokens::{SigningMaterial, TokenConfig, MAX_TOKEN_TTL_SECONDS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieSameSite {
    Lax,
    Strict,
    None,
}

impl CookieSameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            CookieSameSite::Lax => "Lax",
            CookieSameSite::Strict => "Strict",
            CookieSameSite::None => "None",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CookieConfig {
    pub name: String,
    pub domain: Option<String>,
    pub path: String,
    pub secure: bool,
    pub same_site: CookieSameSite,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "school_refresh".to_string(),
            domain: None,
            path: "/".to_string(),
            secure: false,
            same_site: CookieSameSite::Lax,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub header: Option<String>,
    pub cookie: Option<String>,
    pub query_param: Option<String>,
    pub host_map: Vec<(String, Uuid)>,
}

impl TenantSettings {
    pub fn resolver(&self) -> TenantResolver {
        let mut resolver = TenantResolver::new();
        if let Some(header) = &self.header {
            resolver = resolver.with_header(header.clone());
        }
        if let Some(cookie) = &self.cookie {
            resolver = resolver.with_cookie(cookie.clone());
        }
        if let Some(param) = &self.query_param {
            resolver = resolver.with_query_param(param.clone());
        }
        if !self.host_map.is_empty() {
            let map: SubdomainTenantMap = self.host_map.iter().cloned().collect();
            resolver = resolver.with_host_lookup(std::sync::Arc::new(map));
        }
        resolver
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub tokens: TokenConfig,
    pub blacklist_retention: Duration,
    pub cleanup: CleanupPolicy,
    pub refresh_cookie: CookieConfig,
    pub tenants: TenantSettings,
}

impl AuthConfig {
    /// Defaults used when nothing is configured. Signing material is loaded
    /// separately.
    pub fn with_tokens(tokens: TokenConfig) -> Self {
        Self {
            tokens,
            blacklist_retention: Duration::from_secs(900),
            cleanup: CleanupPolicy::default(),
            refresh_cookie: CookieConfig::default(),
            tenants: TenantSettings {
                header: None,
                cookie: None,
                query_param: None,
                host_map: Vec::new(),
            },
        }
    }
}

pub fn load_auth_config() -> Result<AuthConfig> {
    let issuer = env::var("JWT_ISSUER").unwrap_or_else(|_| "identity-service".to_string());
    let audience = env::var("JWT_AUDIENCE").unwrap_or_else(|_| "school-api".to_string());

    let mut tokens = TokenConfig::new(issuer, audience);
    tokens.access_ttl_seconds = parse_from_env("AUTH_ACCESS_TTL_SECONDS")?.unwrap_or(900);
    tokens.refresh_ttl_seconds =
        parse_from_env("AUTH_REFRESH_TTL_SECONDS")?.unwrap_or(14 * 24 * 60 * 60);
    tokens.store_timeout =
        Duration::from_millis(parse_from_env("AUTH_STORE_TIMEOUT_MS")?.unwrap_or(5_000));
    tokens.reuse_revokes_all = bool_from_env("AUTH_REFRESH_REUSE_REVOKES_ALL").unwrap_or(true);

    check_token_ttls(&tokens)?;

    let blacklist_retention = Duration::from_secs(
        parse_from_env("AUTH_BLACKLIST_RETENTION_SECONDS")?.unwrap_or(900),
    );
    let cleanup = CleanupPolicy::new(
        Duration::from_secs(parse_from_env("AUTH_CLEANUP_INTERVAL_SECONDS")?.unwrap_or(300)),
        Duration::from_secs(parse_from_env("AUTH_REVOKED_RETENTION_SECONDS")?.unwrap_or(86_400)),
    );

    let refresh_cookie = CookieConfig {
        name: env::var("AUTH_REFRESH_COOKIE_NAME")
            .ok()
            .and_then(|value| normalize_optional(&value))
            .unwrap_or_else(|| "school_refresh".to_string()),
        domain: env::var("AUTH_REFRESH_COOKIE_DOMAIN")
            .ok()
            .and_then(|value| normalize_optional(&value)),
        path: env::var("AUTH_REFRESH_COOKIE_PATH")
            .ok()
            .and_then(|value| normalize_optional(&value))
            .unwrap_or_else(|| "/".to_string()),
        secure: bool_from_env("AUTH_REFRESH_COOKIE_SECURE").unwrap_or(false),
        same_site: env::var("AUTH_REFRESH_COOKIE_SAMESITE")
            .ok()
            .map(|value| parse_same_site(&value))
            .transpose()
            .context("Failed to parse AUTH_REFRESH_COOKIE_SAMESITE")?
            .unwrap_or(CookieSameSite::Lax),
    };

    let tenants = TenantSettings {
        header: env::var("TENANT_HEADER")
            .ok()
            .and_then(|value| normalize_optional(&value)),
        cookie: env::var("TENANT_COOKIE")
            .ok()
            .and_then(|value| normalize_optional(&value)),
        query_param: env::var("TENANT_QUERY_PARAM")
            .ok()
            .and_then(|value| normalize_optional(&value)),
        host_map: env::var("TENANT_HOST_MAP")
            .ok()
            .map(|value| parse_host_map(&value))
            .transpose()
            .context("Failed to parse TENANT_HOST_MAP")?
            .unwrap_or_default(),
    };

    Ok(AuthConfig {
        tokens,
        blacklist_retention,
        cleanup,
        refresh_cookie,
        tenants,
    })
}

/// Reads `JWT_SIGNING_SECRET` (HS256) or the `JWT_PRIVATE_KEY_PEM` /
/// `JWT_PUBLIC_KEY_PEM` pair (RS256). The RSA pair wins when both are set.
pub fn load_signing_material() -> Result<SigningMaterial> {
    let kid = env::var("JWT_KEY_ID")
        .ok()
        .and_then(|value| normalize_optional(&value))
        .unwrap_or_else(|| "local-dev".to_string());

    let private_pem = env::var("JWT_PRIVATE_KEY_PEM")
        .ok()
        .and_then(|value| normalize_optional(&value));
    let public_pem = env::var("JWT_PUBLIC_KEY_PEM")
        .ok()
        .and_then(|value| normalize_optional(&value));

    match (private_pem, public_pem) {
        (Some(private_pem), Some(public_pem)) => Ok(SigningMaterial::Rs256 {
            kid,
            private_pem,
            public_pem,
        }),
        (Some(_), None) | (None, Some(_)) => Err(anyhow!(
            "JWT_PRIVATE_KEY_PEM and JWT_PUBLIC_KEY_PEM must be provided together"
        )),
        (None, None) => {
            let secret = env::var("JWT_SIGNING_SECRET")
                .ok()
                .and_then(|value| normalize_optional(&value))
                .ok_or_else(|| {
                    anyhow!("No signing key configured. Provide JWT_SIGNING_SECRET or an RSA PEM pair")
                })?;
            Ok(SigningMaterial::Hs256 {
                kid,
                secret: secret.into_bytes(),
            })
        }
    }
}

fn check_token_ttls(tokens: &TokenConfig) -> Result<()> {
    for (key, value) in [
        ("AUTH_ACCESS_TTL_SECONDS", tokens.access_ttl_seconds),
        ("AUTH_REFRESH_TTL_SECONDS", tokens.refresh_ttl_seconds),
    ] {
        if value <= 0 || value > MAX_TOKEN_TTL_SECONDS {
            bail!("{key} must be between 1 and {MAX_TOKEN_TTL_SECONDS} seconds, got {value}");
        }
    }
    Ok(())
}

fn bool_from_env(key: &str) -> Option<bool> {
    env::var(key).ok().map(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn parse_from_env<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow!("Invalid value for {key}: {err}")),
        _ => Ok(None),
    }
}

fn normalize_optional(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_same_site(value: &str) -> Result<CookieSameSite> {
    match value.trim().to_ascii_lowercase().as_str() {
        "lax" => Ok(CookieSameSite::Lax),
        "strict" => Ok(CookieSameSite::Strict),
        "none" => Ok(CookieSameSite::None),
        other => Err(anyhow!(
            "Unsupported cookie same-site policy '{other}'. Use Lax, Strict, or None."
        )),
    }
}

/// `north=<uuid>,south.example.edu=<uuid>`
fn parse_host_map(value: &str) -> Result<Vec<(String, Uuid)>> {
    let mut entries = Vec::new();
    for item in value.split(|c| c == ',' || c == ';' || c == ' ') {
        let trimmed = item.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (host, tenant) = trimmed
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected host=tenant_uuid, got '{trimmed}'"))?;
        let tenant = Uuid::parse_str(tenant.trim())
            .map_err(|err| anyhow!("Invalid tenant UUID '{tenant}': {err}"))?;
        entries.push((host.trim().to_ascii_lowercase(), tenant));
    }
    Ok(entries)
}
