use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::store::{CredentialStore, PurgeReport, RefreshTokenRecord, StoreError, StoreResult};

const UNIQUE_VIOLATION: &str = "23505";

/// Postgres-backed credential store (`auth_refresh_tokens`,
/// `auth_token_blacklist`).
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_insert_error(err: sqlx::Error) -> StoreError {
    let duplicate = err
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION);
    if duplicate {
        StoreError::Conflict
    } else {
        StoreError::Database(err)
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn insert_refresh_token(&self, record: &RefreshTokenRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO auth_refresh_tokens (id, user_id, token_hash, issued_at, expires_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.token_hash.as_slice())
        .bind(record.issued_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(map_insert_error)
    }

    async fn find_refresh_token(
        &self,
        token_hash: &[u8],
    ) -> StoreResult<Option<RefreshTokenRecord>> {
        let row = sqlx::query_as::<_, RefreshTokenRecord>(
            "SELECT id, user_id, token_hash, issued_at, expires_at, revoked_at, replaced_by FROM auth_refresh_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn rotate_refresh_token(
        &self,
        current_hash: &[u8],
        successor: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        // Row lock + re-check of the predicate makes concurrent rotations of
        // the same token serialize; only the first sees an active row.
        let revoked = sqlx::query(
            "UPDATE auth_refresh_tokens SET revoked_at = $2, replaced_by = $3 WHERE token_hash = $1 AND revoked_at IS NULL AND expires_at > $2",
        )
        .bind(current_hash)
        .bind(now)
        .bind(successor.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if revoked == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO auth_refresh_tokens (id, user_id, token_hash, issued_at, expires_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(successor.id)
        .bind(successor.user_id)
        .bind(successor.token_hash.as_slice())
        .bind(successor.issued_at)
        .bind(successor.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(map_insert_error)?;

        tx.commit().await?;
        Ok(true)
    }

    async fn revoke_refresh_token(
        &self,
        token_hash: &[u8],
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let affected = sqlx::query(
            "UPDATE auth_refresh_tokens SET revoked_at = $2 WHERE token_hash = $1 AND revoked_at IS NULL",
        )
        .bind(token_hash)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    async fn revoke_all_for_user(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreResult<u64> {
        let affected = sqlx::query(
            "UPDATE auth_refresh_tokens SET revoked_at = $2 WHERE user_id = $1 AND revoked_at IS NULL",
        )
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    async fn insert_blacklist_entry(
        &self,
        token_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO auth_token_blacklist (token_hash, expires_at) VALUES ($1, $2)
             ON CONFLICT (token_hash) DO UPDATE
             SET expires_at = GREATEST(auth_token_blacklist.expires_at, EXCLUDED.expires_at)",
        )
        .bind(token_hash)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_blacklisted(&self, token_hash: &[u8], now: DateTime<Utc>) -> StoreResult<bool> {
        let found = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM auth_token_blacklist WHERE token_hash = $1 AND expires_at > $2)",
        )
        .bind(token_hash)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
        revoked_before: DateTime<Utc>,
    ) -> StoreResult<PurgeReport> {
        let blacklist_removed =
            sqlx::query("DELETE FROM auth_token_blacklist WHERE expires_at <= $1")
                .bind(now)
                .execute(&self.pool)
                .await?
                .rows_affected();

        let refresh_tokens_removed = sqlx::query(
            "DELETE FROM auth_refresh_tokens WHERE expires_at <= $1 OR (revoked_at IS NOT NULL AND revoked_at <= $2)",
        )
        .bind(now)
        .bind(revoked_before)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(PurgeReport {
            blacklist_removed,
            refresh_tokens_removed,
        })
    }
}
