use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_auth::AuthError;
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("credential store call exceeded {0:?}")]
    Timeout(Duration),
    #[error("token hash already present")]
    Conflict,
    #[error("password hash unusable: {0}")]
    PasswordHash(String),
}

impl From<StoreError> for AuthError {
    fn from(value: StoreError) -> Self {
        AuthError::Storage(value.to_string())
    }
}

/// Persisted refresh token. Only the SHA-256 hash of the secret is kept.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub replaced_by: Option<Uuid>,
}

impl RefreshTokenRecord {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked() && !self.is_expired(now)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub blacklist_removed: u64,
    pub refresh_tokens_removed: u64,
}

impl PurgeReport {
    pub fn total(&self) -> u64 {
        self.blacklist_removed + self.refresh_tokens_removed
    }
}

/// Refresh-token and blacklist persistence.
///
/// Every mutation is a conditional write; implementations must never decide
/// on a stale read.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn insert_refresh_token(&self, record: &RefreshTokenRecord) -> StoreResult<()>;

    async fn find_refresh_token(&self, token_hash: &[u8])
        -> StoreResult<Option<RefreshTokenRecord>>;

    /// Revokes the active token identified by `current_hash` and inserts
    /// `successor` as a single unit. Returns `false` (and changes nothing)
    /// when the token was no longer active at commit time.
    async fn rotate_refresh_token(
        &self,
        current_hash: &[u8],
        successor: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Returns whether this call revoked the token.
    async fn revoke_refresh_token(&self, token_hash: &[u8], now: DateTime<Utc>)
        -> StoreResult<bool>;

    async fn revoke_all_for_user(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Inserts or extends a blacklist entry; an existing later expiry is kept.
    async fn insert_blacklist_entry(
        &self,
        token_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn is_blacklisted(&self, token_hash: &[u8], now: DateTime<Utc>) -> StoreResult<bool>;

    /// Deletes expired blacklist entries, expired refresh tokens, and refresh
    /// tokens revoked at or before `revoked_before`.
    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        revoked_before: DateTime<Utc>,
    ) -> StoreResult<PurgeReport>;
}

#[derive(Default)]
struct MemoryState {
    refresh: HashMap<Vec<u8>, RefreshTokenRecord>,
    blacklist: HashMap<Vec<u8>, DateTime<Utc>>,
}

/// Process-local store for tests and single-node development. Each operation
/// runs under one lock, which gives the same first-writer-wins behaviour as
/// the conditional updates of the Postgres store.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    state: Mutex<MemoryState>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn refresh_token_count(&self) -> usize {
        self.with_state(|state| state.refresh.len())
    }

    pub fn active_refresh_tokens_for(&self, user_id: Uuid, now: DateTime<Utc>) -> usize {
        self.with_state(|state| {
            state
                .refresh
                .values()
                .filter(|record| record.user_id == user_id && record.is_usable(now))
                .count()
        })
    }

    pub fn blacklist_len(&self) -> usize {
        self.with_state(|state| state.blacklist.len())
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn insert_refresh_token(&self, record: &RefreshTokenRecord) -> StoreResult<()> {
        self.with_state(|state| {
            if state.refresh.contains_key(&record.token_hash) {
                return Err(StoreError::Conflict);
            }
            state
                .refresh
                .insert(record.token_hash.clone(), record.clone());
            Ok(())
        })
    }

    async fn find_refresh_token(
        &self,
        token_hash: &[u8],
    ) -> StoreResult<Option<RefreshTokenRecord>> {
        Ok(self.with_state(|state| state.refresh.get(token_hash).cloned()))
    }

    async fn rotate_refresh_token(
        &self,
        current_hash: &[u8],
        successor: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.with_state(|state| {
            if state.refresh.contains_key(&successor.token_hash) {
                return Err(StoreError::Conflict);
            }
            let Some(current) = state.refresh.get_mut(current_hash) else {
                return Ok(false);
            };
            if !current.is_usable(now) {
                return Ok(false);
            }
            current.revoked_at = Some(now);
            current.replaced_by = Some(successor.id);
            state
                .refresh
                .insert(successor.token_hash.clone(), successor.clone());
            Ok(true)
        })
    }

    async fn revoke_refresh_token(
        &self,
        token_hash: &[u8],
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        Ok(self.with_state(|state| match state.refresh.get_mut(token_hash) {
            Some(record) if record.revoked_at.is_none() => {
                record.revoked_at = Some(now);
                true
            }
            _ => false,
        }))
    }

    async fn revoke_all_for_user(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreResult<u64> {
        Ok(self.with_state(|state| {
            let mut revoked = 0;
            for record in state.refresh.values_mut() {
                if record.user_id == user_id && record.revoked_at.is_none() {
                    record.revoked_at = Some(now);
                    revoked += 1;
                }
            }
            revoked
        }))
    }

    async fn insert_blacklist_entry(
        &self,
        token_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.with_state(|state| {
            let entry = state
                .blacklist
                .entry(token_hash.to_vec())
                .or_insert(expires_at);
            if *entry < expires_at {
                *entry = expires_at;
            }
        });
        Ok(())
    }

    async fn is_blacklisted(&self, token_hash: &[u8], now: DateTime<Utc>) -> StoreResult<bool> {
        Ok(self.with_state(|state| {
            state
                .blacklist
                .get(token_hash)
                .is_some_and(|expires_at| *expires_at > now)
        }))
    }

    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        revoked_before: DateTime<Utc>,
    ) -> StoreResult<PurgeReport> {
        Ok(self.with_state(|state| {
            let blacklist_before = state.blacklist.len();
            state.blacklist.retain(|_, expires_at| *expires_at > now);

            let refresh_before = state.refresh.len();
            state.refresh.retain(|_, record| {
                let revoked_long_ago = record
                    .revoked_at
                    .is_some_and(|revoked_at| revoked_at <= revoked_before);
                !record.is_expired(now) && !revoked_long_ago
            });

            PurgeReport {
                blacklist_removed: (blacklist_before - state.blacklist.len()) as u64,
                refresh_tokens_removed: (refresh_before - state.refresh.len()) as u64,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn record(user_id: Uuid, hash: &[u8], expires_in: ChronoDuration) -> RefreshTokenRecord {
        let now = Utc::now();
        RefreshTokenRecord {
            id: Uuid::new_v4(),
            user_id,
            token_hash: hash.to_vec(),
            issued_at: now,
            expires_at: now + expires_in,
            revoked_at: None,
            replaced_by: None,
        }
    }

    #[tokio::test]
    async fn rotate_only_succeeds_once() {
        let store = InMemoryCredentialStore::new();
        let user = Uuid::new_v4();
        let original = record(user, b"first", ChronoDuration::hours(1));
        store.insert_refresh_token(&original).await.expect("insert");

        let now = Utc::now();
        let second = record(user, b"second", ChronoDuration::hours(1));
        assert!(store.rotate_refresh_token(b"first", &second, now).await.expect("rotate"));

        let third = record(user, b"third", ChronoDuration::hours(1));
        assert!(!store.rotate_refresh_token(b"first", &third, now).await.expect("rotate"));

        let old = store.find_refresh_token(b"first").await.expect("find").expect("row");
        assert_eq!(old.replaced_by, Some(second.id));
        assert!(store.find_refresh_token(b"third").await.expect("find").is_none());
        assert_eq!(store.active_refresh_tokens_for(user, now), 1);
    }

    #[tokio::test]
    async fn duplicate_hash_is_a_conflict() {
        let store = InMemoryCredentialStore::new();
        let first = record(Uuid::new_v4(), b"dup", ChronoDuration::hours(1));
        store.insert_refresh_token(&first).await.expect("insert");
        let err = store
            .insert_refresh_token(&record(Uuid::new_v4(), b"dup", ChronoDuration::hours(1)))
            .await
            .expect_err("conflict");
        assert!(matches!(err, StoreError::Conflict));
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let store = InMemoryCredentialStore::new();
        let row = record(Uuid::new_v4(), b"token", ChronoDuration::hours(1));
        store.insert_refresh_token(&row).await.expect("insert");

        let now = Utc::now();
        assert!(store.revoke_refresh_token(b"token", now).await.expect("revoke"));
        assert!(!store.revoke_refresh_token(b"token", now).await.expect("revoke again"));
        assert!(!store.revoke_refresh_token(b"missing", now).await.expect("revoke unknown"));
    }

    #[tokio::test]
    async fn blacklist_keeps_latest_expiry() {
        let store = InMemoryCredentialStore::new();
        let now = Utc::now();
        store
            .insert_blacklist_entry(b"access", now + ChronoDuration::minutes(10))
            .await
            .expect("insert");
        store
            .insert_blacklist_entry(b"access", now + ChronoDuration::minutes(1))
            .await
            .expect("insert shorter");

        let later = now + ChronoDuration::minutes(5);
        assert!(store.is_blacklisted(b"access", later).await.expect("lookup"));
        assert!(!store
            .is_blacklisted(b"access", now + ChronoDuration::minutes(11))
            .await
            .expect("lookup"));
    }

    #[tokio::test]
    async fn purge_removes_only_elapsed_rows() {
        let store = InMemoryCredentialStore::new();
        let now = Utc::now();
        let user = Uuid::new_v4();

        store
            .insert_refresh_token(&record(user, b"expired", ChronoDuration::seconds(-5)))
            .await
            .expect("insert");
        store
            .insert_refresh_token(&record(user, b"live", ChronoDuration::hours(1)))
            .await
            .expect("insert");
        store
            .insert_refresh_token(&record(user, b"revoked-old", ChronoDuration::hours(1)))
            .await
            .expect("insert");
        store
            .revoke_refresh_token(b"revoked-old", now - ChronoDuration::days(2))
            .await
            .expect("revoke");
        store
            .insert_refresh_token(&record(user, b"revoked-new", ChronoDuration::hours(1)))
            .await
            .expect("insert");
        store
            .revoke_refresh_token(b"revoked-new", now)
            .await
            .expect("revoke");

        store
            .insert_blacklist_entry(b"gone", now - ChronoDuration::seconds(1))
            .await
            .expect("insert");
        store
            .insert_blacklist_entry(b"kept", now + ChronoDuration::minutes(5))
            .await
            .expect("insert");

        let report = store
            .purge_expired(now, now - ChronoDuration::days(1))
            .await
            .expect("purge");
        assert_eq!(
            report,
            PurgeReport {
                blacklist_removed: 1,
                refresh_tokens_removed: 2
            }
        );
        assert!(store.find_refresh_token(b"live").await.expect("find").is_some());
        assert!(store.find_refresh_token(b"revoked-new").await.expect("find").is_some());
        assert!(store.is_blacklisted(b"kept", now).await.expect("lookup"));
        assert_eq!(store.blacklist_len(), 1);
    }
}
