pub mod config;
pub mod consumers;
pub mod db;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod watchdog;

use std::sync::Arc;

use auth_core::{AuthzConfig, JwtConfig, KeyManager, TokenIssuer, TokenVerifier};
use sqlx::PgPool;
use transactional_outbox::SqlxOutboxStore;

use crate::config::Config;
use crate::db::login_attempts::LoginAttemptRepository;
use crate::db::sagas::SagaRepository;
use crate::db::users::UserRepository;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub users: UserRepository,
    pub login_attempts: LoginAttemptRepository,
    pub sagas: SagaRepository,
    pub outbox: Arc<SqlxOutboxStore>,
    pub keys: Arc<KeyManager>,
    pub issuer: Arc<TokenIssuer>,
    pub verifier: Arc<TokenVerifier>,
    pub authz: Arc<AuthzConfig>,
    pub jwt: Arc<JwtConfig>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn issuer_url(&self) -> &str {
        &self.jwt.issuer
    }
}
