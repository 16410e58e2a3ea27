use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use tracing::debug;

use crate::claims::ClaimSet;
use crate::config::JwtConfig;
use crate::error::{AuthError, AuthResult};

/// Anything that can turn a presented bearer token into a verified claim set.
///
/// `JwtVerifier` only checks signature and registered claims; the identity
/// service layers its blacklist on top of it.
#[async_trait]
pub trait AccessTokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> AuthResult<ClaimSet>;
}

#[derive(Clone)]
struct VerificationKey {
    algorithm: Algorithm,
    key: DecodingKey,
}

/// Thread-safe store of decoding keys addressed by `kid`.
#[derive(Clone, Default)]
pub struct InMemoryKeyStore {
    inner: Arc<RwLock<HashMap<String, VerificationKey>>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_key(&self, kid: impl Into<String>, algorithm: Algorithm, key: DecodingKey) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(kid.into(), VerificationKey { algorithm, key });
    }

    pub fn insert_secret(&self, kid: impl Into<String>, secret: &[u8]) {
        self.insert_key(kid, Algorithm::HS256, DecodingKey::from_secret(secret));
    }

    pub fn insert_rsa_pem(&self, kid: impl Into<String>, pem: &[u8]) -> AuthResult<()> {
        let kid = kid.into();
        let key = DecodingKey::from_rsa_pem(pem)
            .map_err(|err| AuthError::KeyParse(kid.clone(), err.to_string()))?;
        self.insert_key(kid, Algorithm::RS256, key);
        Ok(())
    }

    fn get(&self, kid: &str) -> Option<VerificationKey> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        guard.get(kid).cloned()
    }

    pub fn contains(&self, kid: &str) -> bool {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        guard.contains_key(kid)
    }
}

/// Stateless signature, issuer, audience and expiry check.
#[derive(Clone)]
pub struct JwtVerifier {
    config: JwtConfig,
    store: InMemoryKeyStore,
}

impl JwtVerifier {
    pub fn with_store(config: JwtConfig, store: InMemoryKeyStore) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &JwtConfig {
        &self.config
    }

    pub fn store(&self) -> &InMemoryKeyStore {
        &self.store
    }

    pub fn verify(&self, token: &str) -> AuthResult<ClaimSet> {
        let header = decode_header(token)?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::InvalidToken("missing kid header".to_string()))?;
        let entry = self
            .store
            .get(&kid)
            .ok_or_else(|| AuthError::InvalidToken(format!("unknown signing key '{kid}'")))?;

        if header.alg != entry.algorithm || !self.config.allows(header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "algorithm {:?} not accepted for key '{kid}'",
                header.alg
            )));
        }

        let mut validation = Validation::new(entry.algorithm);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);
        validation.leeway = self.config.leeway_seconds.into();

        let token_data = decode::<Value>(token, &entry.key, &validation)?;
        let claims = ClaimSet::try_from(token_data.claims)?;
        debug!(kid, subject = %claims.subject, "verified access token");
        Ok(claims)
    }
}

#[async_trait]
impl AccessTokenValidator for JwtVerifier {
    async fn validate(&self, token: &str) -> AuthResult<ClaimSet> {
        self.verify(token)
    }
}
