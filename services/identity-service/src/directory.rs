use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use common_auth::{Role, TenantCollection};
use rand_core::OsRng;
use sqlx::{FromRow, PgPool};
use tracing::warn;
use uuid::Uuid;

use crate::store::{StoreError, StoreResult};

/// A user as seen by the identity service at token-issuance time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub user_id: Uuid,
    pub role: Option<Role>,
    pub is_active: bool,
    pub admin_tenant_ids: BTreeSet<Uuid>,
    pub teacher_tenant_ids: BTreeSet<Uuid>,
    pub student_tenant_ids: BTreeSet<Uuid>,
    /// Every tenant the user belongs to, including the scoped ones.
    pub member_tenant_ids: BTreeSet<Uuid>,
}

impl Account {
    pub fn new(user_id: Uuid, role: Option<Role>) -> Self {
        Self {
            user_id,
            role,
            is_active: true,
            admin_tenant_ids: BTreeSet::new(),
            teacher_tenant_ids: BTreeSet::new(),
            student_tenant_ids: BTreeSet::new(),
            member_tenant_ids: BTreeSet::new(),
        }
    }

    /// Records a membership. `membership_role` decides which scoped
    /// collection (if any) the tenant lands in.
    pub fn with_membership(mut self, tenant_id: Uuid, membership_role: Option<Role>) -> Self {
        self.add_membership(tenant_id, membership_role);
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }

    fn add_membership(&mut self, tenant_id: Uuid, membership_role: Option<Role>) {
        self.member_tenant_ids.insert(tenant_id);
        match membership_role {
            Some(Role::Owner | Role::Admin) => {
                self.admin_tenant_ids.insert(tenant_id);
            }
            Some(Role::Teacher) => {
                self.teacher_tenant_ids.insert(tenant_id);
            }
            Some(Role::Student) => {
                self.student_tenant_ids.insert(tenant_id);
            }
            Some(Role::Parent) | None => {}
        }
    }

    pub fn tenant_ids(&self, collection: TenantCollection) -> &BTreeSet<Uuid> {
        match collection {
            TenantCollection::Admin => &self.admin_tenant_ids,
            TenantCollection::Teacher => &self.teacher_tenant_ids,
            TenantCollection::Student => &self.student_tenant_ids,
            TenantCollection::All => &self.member_tenant_ids,
        }
    }
}

/// External membership store and password check.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Returns the user id when `secret` matches. Unknown identifiers and
    /// wrong secrets are indistinguishable to the caller.
    async fn verify_credentials(&self, identifier: &str, secret: &str) -> StoreResult<Option<Uuid>>;

    async fn load_account(&self, user_id: Uuid) -> StoreResult<Option<Account>>;
}

fn verify_secret(stored_hash: &str, secret: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(err) => {
            warn!(error = %err, "stored password hash is not a valid PHC string");
            false
        }
    }
}

/// Burns roughly the same time as a real verification so response latency
/// does not reveal whether the identifier exists.
fn spend_equivalent_work(secret: &str) {
    let salt = SaltString::generate(&mut OsRng);
    let _ = Argon2::default().hash_password(secret.as_bytes(), &salt);
}

pub fn hash_secret(argon2: &Argon2<'_>, secret: &str) -> StoreResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| StoreError::PasswordHash(err.to_string()))
}

#[derive(FromRow)]
struct CredentialRow {
    id: Uuid,
    password_hash: String,
}

#[derive(FromRow)]
struct AccountRow {
    id: Uuid,
    role: Option<String>,
    is_active: bool,
}

#[derive(FromRow)]
struct MembershipRow {
    tenant_id: Uuid,
    role: String,
}

/// Reads `users` / `tenant_memberships`.
#[derive(Clone)]
pub struct PgAccountDirectory {
    pool: PgPool,
}

impl PgAccountDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountDirectory for PgAccountDirectory {
    async fn verify_credentials(&self, identifier: &str, secret: &str) -> StoreResult<Option<Uuid>> {
        let row = sqlx::query_as::<_, CredentialRow>(
            "SELECT id, password_hash FROM users WHERE lower(email) = lower($1)",
        )
        .bind(identifier.trim())
        .fetch_optional(&self.pool)
        .await?;

        let secret = secret.to_owned();
        let verified = tokio::task::spawn_blocking(move || match row {
            Some(row) => verify_secret(&row.password_hash, &secret).then_some(row.id),
            None => {
                spend_equivalent_work(&secret);
                None
            }
        })
        .await
        .map_err(|err| StoreError::PasswordHash(err.to_string()))?;

        Ok(verified)
    }

    async fn load_account(&self, user_id: Uuid) -> StoreResult<Option<Account>> {
        let Some(row) = sqlx::query_as::<_, AccountRow>(
            "SELECT id, role, is_active FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let memberships = sqlx::query_as::<_, MembershipRow>(
            "SELECT tenant_id, role FROM tenant_memberships WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut account = Account::new(row.id, row.role.as_deref().and_then(Role::parse));
        account.is_active = row.is_active;
        for membership in memberships {
            account.add_membership(membership.tenant_id, Role::parse(&membership.role));
        }
        Ok(Some(account))
    }
}

struct DirectoryEntry {
    password_hash: String,
    account: Account,
}

/// Directory backed by a map; used by tests and local tooling.
pub struct InMemoryAccountDirectory {
    hasher: Argon2<'static>,
    entries: RwLock<HashMap<String, DirectoryEntry>>,
}

impl Default for InMemoryAccountDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAccountDirectory {
    pub fn new() -> Self {
        Self::with_hasher(Argon2::default())
    }

    /// Lets tests trade hash strength for speed.
    pub fn with_hasher(hasher: Argon2<'static>) -> Self {
        Self {
            hasher,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, identifier: &str, secret: &str, account: Account) -> StoreResult<()> {
        let password_hash = hash_secret(&self.hasher, secret)?;
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(
            identifier.trim().to_ascii_lowercase(),
            DirectoryEntry {
                password_hash,
                account,
            },
        );
        Ok(())
    }

    /// Replaces the stored account for `user_id`, keeping its credentials.
    pub fn update_account(&self, account: Account) {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = guard
            .values_mut()
            .find(|entry| entry.account.user_id == account.user_id)
        {
            entry.account = account;
        }
    }
}

#[async_trait]
impl AccountDirectory for InMemoryAccountDirectory {
    async fn verify_credentials(&self, identifier: &str, secret: &str) -> StoreResult<Option<Uuid>> {
        let stored = {
            let guard = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            guard
                .get(&identifier.trim().to_ascii_lowercase())
                .map(|entry| (entry.password_hash.clone(), entry.account.user_id))
        };

        Ok(match stored {
            Some((hash, user_id)) => verify_secret(&hash, secret).then_some(user_id),
            None => None,
        })
    }

    async fn load_account(&self, user_id: Uuid) -> StoreResult<Option<Account>> {
        let guard = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard
            .values()
            .find(|entry| entry.account.user_id == user_id)
            .map(|entry| entry.account.clone()))
    }
}
