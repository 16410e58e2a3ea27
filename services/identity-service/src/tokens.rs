use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use common_auth::{
    AccessTokenValidator, AuthError, AuthResult, ClaimSet, InMemoryKeyStore, JwtConfig,
    JwtVerifier, TokenClaims,
};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rand_core::{OsRng, RngCore};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::directory::{Account, AccountDirectory};
use crate::metrics::AuthMetrics;
use crate::store::{CredentialStore, RefreshTokenRecord, StoreError, StoreResult};

/// Upper bound accepted for configured access and refresh lifetimes.
pub const MAX_TOKEN_TTL_SECONDS: i64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub issuer: String,
    pub audience: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub store_timeout: StdDuration,
    /// Replaying a rotated refresh token revokes every refresh token the
    /// user holds.
    pub reuse_revokes_all: bool,
}

impl TokenConfig {
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            access_ttl_seconds: 900,
            refresh_ttl_seconds: 14 * 24 * 60 * 60,
            store_timeout: StdDuration::from_secs(5),
            reuse_revokes_all: true,
        }
    }
}

/// Key used to sign access tokens. The matching verification key is
/// registered under the same `kid`.
#[derive(Clone)]
pub enum SigningMaterial {
    Hs256 {
        kid: String,
        secret: Vec<u8>,
    },
    Rs256 {
        kid: String,
        private_pem: String,
        public_pem: String,
    },
}

impl SigningMaterial {
    pub fn kid(&self) -> &str {
        match self {
            SigningMaterial::Hs256 { kid, .. } | SigningMaterial::Rs256 { kid, .. } => kid,
        }
    }
}

struct SigningKey {
    kid: String,
    algorithm: Algorithm,
    encoding_key: EncodingKey,
}

#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub user_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub access_expires_in: i64,
    pub refresh_expires_in: i64,
    pub token_type: &'static str,
}

/// Issues, rotates and invalidates credentials on top of a
/// [`CredentialStore`].
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    directory: Arc<dyn AccountDirectory>,
    config: TokenConfig,
    signing_key: SigningKey,
    verifier: JwtVerifier,
    metrics: Option<Arc<AuthMetrics>>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        directory: Arc<dyn AccountDirectory>,
        config: TokenConfig,
        material: SigningMaterial,
    ) -> AuthResult<Self> {
        let keys = InMemoryKeyStore::new();
        let signing_key = match material {
            SigningMaterial::Hs256 { kid, secret } => {
                keys.insert_secret(kid.clone(), &secret);
                SigningKey {
                    kid,
                    algorithm: Algorithm::HS256,
                    encoding_key: EncodingKey::from_secret(&secret),
                }
            }
            SigningMaterial::Rs256 {
                kid,
                private_pem,
                public_pem,
            } => {
                let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
                    .map_err(|err| AuthError::KeyParse(kid.clone(), err.to_string()))?;
                keys.insert_rsa_pem(kid.clone(), public_pem.as_bytes())?;
                SigningKey {
                    kid,
                    algorithm: Algorithm::RS256,
                    encoding_key,
                }
            }
        };

        let verifier = JwtVerifier::with_store(
            JwtConfig::new(config.issuer.clone(), config.audience.clone()),
            keys,
        );

        Ok(Self {
            store,
            directory,
            config,
            signing_key,
            verifier,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<AuthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    pub fn verifier(&self) -> &JwtVerifier {
        &self.verifier
    }

    pub fn directory(&self) -> &Arc<dyn AccountDirectory> {
        &self.directory
    }

    pub async fn issue_token_pair(&self, user_id: Uuid) -> AuthResult<IssuedTokens> {
        let account = self.active_account(user_id).await?;
        let now = Utc::now();
        let (refresh_token, record) = self.new_refresh_record(user_id, now);
        let access_token = self.sign_access_token(&account, now)?;

        self.guarded(self.store.insert_refresh_token(&record)).await?;
        self.record_event("issued");
        info!(user_id = %user_id, refresh_id = %record.id, "issued token pair");

        Ok(self.issued(user_id, access_token, refresh_token, now))
    }

    /// Exchanges a refresh token for a new pair. The presented token is
    /// consumed; at most one concurrent caller succeeds.
    pub async fn rotate(&self, presented: &str) -> AuthResult<IssuedTokens> {
        let presented = presented.trim();
        if presented.is_empty() {
            return Err(AuthError::InvalidToken("empty refresh token".to_string()));
        }

        let current_hash = hash_token(presented);
        let now = Utc::now();
        let record = self
            .guarded(self.store.find_refresh_token(&current_hash))
            .await?
            .ok_or_else(|| AuthError::InvalidToken("unknown refresh token".to_string()))?;

        if record.is_revoked() {
            self.handle_reuse(&record, now).await;
            return Err(AuthError::RevokedToken);
        }
        if record.is_expired(now) {
            return Err(AuthError::InvalidToken("refresh token expired".to_string()));
        }

        let account = self.active_account(record.user_id).await?;
        let (refresh_token, successor) = self.new_refresh_record(record.user_id, now);
        let access_token = self.sign_access_token(&account, now)?;

        let rotated = self
            .guarded(
                self.store
                    .rotate_refresh_token(&current_hash, &successor, now),
            )
            .await?;
        if !rotated {
            debug!(refresh_id = %record.id, "lost refresh rotation race");
            self.record_event("rotation_conflict");
            return Err(AuthError::RevokedToken);
        }

        self.record_event("rotated");
        info!(
            user_id = %record.user_id,
            previous = %record.id,
            successor = %successor.id,
            "rotated refresh token"
        );
        Ok(self.issued(record.user_id, access_token, refresh_token, now))
    }

    /// Revokes a refresh token. Unknown or already revoked tokens are not an
    /// error.
    pub async fn revoke(&self, refresh_token: &str) -> AuthResult<()> {
        let refresh_token = refresh_token.trim();
        if refresh_token.is_empty() {
            return Ok(());
        }

        let revoked = self
            .guarded(
                self.store
                    .revoke_refresh_token(&hash_token(refresh_token), Utc::now()),
            )
            .await?;
        if revoked {
            self.record_event("revoked");
        }
        debug!(revoked, "processed refresh token revocation");
        Ok(())
    }

    /// Rejects `access_token` until `now + ttl`, or until the token's own
    /// expiry if that is later.
    pub async fn blacklist(&self, access_token: &str, ttl: Duration) -> AuthResult<()> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut expires_at = now
            .checked_add_signed(ttl.max(Duration::zero()))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if let Some(natural_expiry) = unverified_expiry(access_token) {
            expires_at = expires_at.max(natural_expiry);
        }

        self.guarded(
            self.store
                .insert_blacklist_entry(&hash_token(access_token), expires_at),
        )
        .await?;
        self.record_event("blacklisted");
        debug!(%expires_at, "blacklisted access token");
        Ok(())
    }

    pub async fn validate(&self, access_token: &str) -> AuthResult<ClaimSet> {
        let claims = self.verifier.verify(access_token)?;
        let blacklisted = self
            .guarded(
                self.store
                    .is_blacklisted(&hash_token(access_token), Utc::now()),
            )
            .await?;
        if blacklisted {
            debug!(subject = %claims.subject, "rejected blacklisted access token");
            return Err(AuthError::RevokedToken);
        }
        Ok(claims)
    }

    async fn handle_reuse(&self, record: &RefreshTokenRecord, now: DateTime<Utc>) {
        if record.replaced_by.is_none() {
            return;
        }

        self.record_event("reuse_detected");
        warn!(
            user_id = %record.user_id,
            refresh_id = %record.id,
            "rotated refresh token presented again"
        );

        if !self.config.reuse_revokes_all {
            return;
        }
        match self
            .guarded(self.store.revoke_all_for_user(record.user_id, now))
            .await
        {
            Ok(revoked) => {
                warn!(user_id = %record.user_id, revoked, "revoked all refresh tokens after reuse");
            }
            Err(err) => {
                warn!(user_id = %record.user_id, error = %err, "failed to revoke refresh tokens after reuse");
            }
        }
    }

    async fn active_account(&self, user_id: Uuid) -> AuthResult<Account> {
        match self.guarded(self.directory.load_account(user_id)).await? {
            Some(account) if account.is_active => Ok(account),
            Some(_) => {
                warn!(user_id = %user_id, "token requested for inactive account");
                Err(AuthError::Authentication)
            }
            None => Err(AuthError::Authentication),
        }
    }

    fn sign_access_token(&self, account: &Account, now: DateTime<Utc>) -> AuthResult<String> {
        let claims = TokenClaims {
            sub: account.user_id.to_string(),
            role: account.role.map(|role| role.as_str().to_string()),
            admin_tenant_ids: id_strings(&account.admin_tenant_ids),
            teacher_tenant_ids: id_strings(&account.teacher_tenant_ids),
            student_tenant_ids: id_strings(&account.student_tenant_ids),
            tenant_ids: id_strings(&account.member_tenant_ids),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            exp: expiry_after(now, self.config.access_ttl_seconds).timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let mut header = Header::new(self.signing_key.algorithm);
        header.kid = Some(self.signing_key.kid.clone());
        encode(&header, &claims, &self.signing_key.encoding_key)
            .map_err(|err| AuthError::Signing(self.signing_key.kid.clone(), err.to_string()))
    }

    fn new_refresh_record(&self, user_id: Uuid, now: DateTime<Utc>) -> (String, RefreshTokenRecord) {
        let token = generate_refresh_token();
        let record = RefreshTokenRecord {
            id: Uuid::new_v4(),
            user_id,
            token_hash: hash_token(&token),
            issued_at: now,
            expires_at: expiry_after(now, self.config.refresh_ttl_seconds),
            revoked_at: None,
            replaced_by: None,
        };
        (token, record)
    }

    fn issued(
        &self,
        user_id: Uuid,
        access_token: String,
        refresh_token: String,
        now: DateTime<Utc>,
    ) -> IssuedTokens {
        IssuedTokens {
            user_id,
            access_token,
            refresh_token,
            access_expires_at: expiry_after(now, self.config.access_ttl_seconds),
            refresh_expires_at: expiry_after(now, self.config.refresh_ttl_seconds),
            access_expires_in: self.config.access_ttl_seconds,
            refresh_expires_in: self.config.refresh_ttl_seconds,
            token_type: "Bearer",
        }
    }

    /// Bounds a store call by the configured timeout. Dropping the future
    /// on timeout rolls back any open transaction.
    async fn guarded<T, F>(&self, call: F) -> AuthResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let result = match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.config.store_timeout)),
        };
        result.map_err(|err| {
            warn!(error = %err, "credential store call failed");
            AuthError::from(err)
        })
    }

    fn record_event(&self, event: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.token_event(event);
        }
    }
}

#[async_trait]
impl AccessTokenValidator for TokenManager {
    async fn validate(&self, token: &str) -> AuthResult<ClaimSet> {
        TokenManager::validate(self, token).await
    }
}

pub fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let random = URL_SAFE_NO_PAD.encode(bytes);
    format!("{}.{}", Uuid::new_v4(), random)
}

/// `now + seconds`, saturating at the latest representable instant.
fn expiry_after(now: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    Duration::try_seconds(seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn id_strings(ids: &std::collections::BTreeSet<Uuid>) -> Vec<String> {
    ids.iter().map(Uuid::to_string).collect()
}

#[derive(Deserialize)]
struct ExpiryOnly {
    exp: i64,
}

/// Reads `exp` without checking the signature. Only used to size blacklist
/// entries, never for trust decisions.
fn unverified_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: ExpiryOnly = serde_json::from_slice(&bytes).ok()?;
    Utc.timestamp_opt(claims.exp, 0).single()
}
