//! User credential and role lookups backing the token endpoint.

use std::collections::HashMap;

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::Result;

/// Everything the issuer needs about a user.
#[derive(Debug, Clone)]
pub struct UserAuthData {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    /// Union of the scopes granted by the user's roles
    pub scopes: Vec<String>,
    /// tenant id -> role names
    pub tenant_roles: HashMap<String, Vec<String>>,
}

#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Case-insensitive username lookup with roles and scopes attached.
    pub async fn find_auth_data(&self, username: &str) -> Result<Option<UserAuthData>> {
        let user = sqlx::query(
            r#"
            SELECT id, username, password_hash
            FROM users
            WHERE LOWER(username) = LOWER($1)
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        let Some(user) = user else {
            return Ok(None);
        };

        let user_id: Uuid = user.try_get("id")?;

        let role_rows = sqlx::query(
            r#"
            SELECT r.name, r.scopes, ur.tenant_id
            FROM user_roles ur
            JOIN roles r ON r.id = ur.role_id
            WHERE ur.user_id = $1
            ORDER BY ur.tenant_id, r.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut scopes: Vec<String> = Vec::new();
        let mut tenant_roles: HashMap<String, Vec<String>> = HashMap::new();
        for row in &role_rows {
            let name: String = row.try_get("name")?;
            let role_scopes: Vec<String> = row.try_get("scopes")?;
            let tenant_id: String = row.try_get("tenant_id")?;

            for scope in role_scopes {
                if !scopes.contains(&scope) {
                    scopes.push(scope);
                }
            }
            tenant_roles.entry(tenant_id).or_default().push(name);
        }

        Ok(Some(UserAuthData {
            id: user_id,
            username: user.try_get("username")?,
            password_hash: user.try_get("password_hash")?,
            scopes,
            tenant_roles,
        }))
    }
}
