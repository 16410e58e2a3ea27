pub mod app;
pub mod cleanup;
pub mod config;
pub mod directory;
pub mod metrics;
pub mod pg_store;
pub mod session_handlers;
pub mod store;
pub mod tokens;

pub use app::{router, AppState};
pub use directory::{Account, AccountDirectory, InMemoryAccountDirectory, PgAccountDirectory};
pub use pg_store::PgCredentialStore;
pub use store::{CredentialStore, InMemoryCredentialStore, StoreError};
pub use tokens::{IssuedTokens, SigningMaterial, TokenConfig, TokenManager};
