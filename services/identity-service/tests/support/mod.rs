#![allow(dead_code)]

use std::{env, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use argon2::{password_hash::SaltString, Argon2, PasswordHasher};
use argon2::{Algorithm, Params, Version};
use common_auth::Role;
use dirs::cache_dir;
use identity_service::config::AuthConfig;
use identity_service::metrics::AuthMetrics;
use identity_service::{
    router, Account, AppState, InMemoryAccountDirectory, InMemoryCredentialStore,
    SigningMaterial, TokenConfig, TokenManager,
};
use pg_embed::pg_enums::PgAuthMethod;
use pg_embed::pg_fetch::{PgFetchSettings, PG_V13};
use pg_embed::postgres::{PgEmbed, PgSettings};
use portpicker::pick_unused_port;
use rand_core::OsRng;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tempfile::{tempdir, TempDir};
use uuid::Uuid;

pub const ISSUER: &str = "identity-test";
pub const AUDIENCE: &str = "school-api";

pub struct TestDatabase {
    pool: PgPool,
    embedded: Option<EmbeddedPg>,
}

impl TestDatabase {
    pub async fn setup() -> Result<Option<Self>> {
        if env::var("AUTH_TEST_DATABASE_URL").is_err() && !env_flag_enabled("AUTH_TEST_USE_EMBED") {
            eprintln!(
                "Skipping identity-service integration tests: set AUTH_TEST_DATABASE_URL or AUTH_TEST_USE_EMBED=1 to run them.",
            );
            return Ok(None);
        }

        let mut embedded = None;
        let database_url = if let Ok(url) = env::var("AUTH_TEST_DATABASE_URL") {
            url
        } else {
            if env_flag_enabled("AUTH_TEST_EMBED_CLEAR_CACHE") {
                if let Some(cache_dir) = cache_dir() {
                    let _ = std::fs::remove_dir_all(cache_dir.join("pg-embed"));
                }
            }

            let temp = tempdir()?;
            let port = pick_unused_port()
                .context("failed to find available port for embedded Postgres")?;

            let mut fetch_settings = PgFetchSettings::default();
            fetch_settings.version = PG_V13;

            let mut pg = PgEmbed::new(
                PgSettings {
                    database_dir: temp.path().to_path_buf(),
                    port,
                    user: "postgres".to_string(),
                    password: "postgres".to_string(),
                    auth_method: PgAuthMethod::Plain,
                    persistent: false,
                    timeout: Some(Duration::from_secs(30)),
                    migration_dir: None,
                },
                fetch_settings,
            )
            .await?;

            pg.setup().await?;
            pg.start_db().await?;

            let uri = format!("{}/postgres", pg.db_uri);
            embedded = Some(EmbeddedPg {
                pg,
                _temp_dir: temp,
            });
            uri
        };

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        if embedded.is_some() || env_flag_enabled("AUTH_TEST_APPLY_MIGRATIONS") {
            run_migrations(&pool).await?;
        }

        Ok(Some(Self { pool, embedded }))
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }

    pub async fn teardown(self) -> Result<()> {
        if let Some(embedded) = self.embedded {
            embedded.shutdown().await;
        }
        Ok(())
    }
}

struct EmbeddedPg {
    pg: PgEmbed,
    _temp_dir: TempDir,
}

impl EmbeddedPg {
    async fn shutdown(mut self) {
        let _ = self.pg.stop_db().await;
    }
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrations_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations");
    let mut entries = std::fs::read_dir(&migrations_dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();

    for path in entries {
        let sql = std::fs::read_to_string(&path)?;
        for statement in sql.split(';') {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                continue;
            }
            sqlx::query(trimmed).execute(pool).await?;
        }
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct SeededUser {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub password: String,
}

pub async fn seed_test_user(pool: &PgPool, role: Role) -> Result<SeededUser> {
    let tenant_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    let email = format!("{}@example.edu", user_id.simple());
    let password = "CorrectHorseBatteryStaple!".to_string();
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string();

    sqlx::query(
        "INSERT INTO users (id, name, email, role, password_hash) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(user_id)
    .bind("Test User")
    .bind(&email)
    .bind(role.as_str())
    .bind(&password_hash)
    .execute(pool)
    .await?;

    sqlx::query("INSERT INTO tenant_memberships (user_id, tenant_id, role) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(tenant_id)
        .bind(role.as_str())
        .execute(pool)
        .await?;

    Ok(SeededUser {
        tenant_id,
        user_id,
        email,
        password,
    })
}

/// Fully wired router over the in-memory store and directory.
pub struct TestApp {
    pub state: AppState,
    pub store: Arc<InMemoryCredentialStore>,
    pub directory: Arc<InMemoryAccountDirectory>,
}

impl TestApp {
    pub fn new() -> Result<Self> {
        let store = Arc::new(InMemoryCredentialStore::new());
        let params = Params::new(1024, 1, 1, None).map_err(|err| anyhow::anyhow!("{err}"))?;
        let directory = Arc::new(InMemoryAccountDirectory::with_hasher(Argon2::new(
            Algorithm::Argon2id,
            Version::V0x13,
            params,
        )));

        let metrics = Arc::new(AuthMetrics::new()?);
        let config = AuthConfig::with_tokens(TokenConfig::new(ISSUER, AUDIENCE));
        let tokens = TokenManager::new(
            store.clone(),
            directory.clone(),
            config.tokens.clone(),
            SigningMaterial::Hs256 {
                kid: "test".to_string(),
                secret: b"integration-secret".to_vec(),
            },
        )?
        .with_metrics(metrics.clone());

        let state = AppState {
            tokens: Arc::new(tokens),
            tenant_resolver: Arc::new(config.tenants.resolver()),
            config: Arc::new(config),
            metrics,
        };

        Ok(Self {
            state,
            store,
            directory,
        })
    }

    pub fn router(&self) -> axum::Router {
        router(self.state.clone())
    }

    pub fn seed(&self, identifier: &str, secret: &str, account: Account) -> Result<()> {
        self.directory.insert(identifier, secret, account)?;
        Ok(())
    }
}

fn env_flag_enabled(key: &str) -> bool {
    matches!(env::var(key), Ok(value) if is_truthy(value.as_str()))
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON")
}
