//! Login attempt log. The table is range-partitioned by `created_at`;
//! rate limiting counts recent failures per username.

use sqlx::PgPool;

use crate::error::Result;

#[derive(Clone)]
pub struct LoginAttemptRepository {
    pool: PgPool,
}

impl LoginAttemptRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, username: &str, success: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO login_attempts (username, success)
            VALUES (LOWER($1), $2)
            "#,
        )
        .bind(username)
        .bind(success)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Failed attempts for a username within the last `window_secs`.
    pub async fn recent_failures(&self, username: &str, window_secs: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM login_attempts
            WHERE username = LOWER($1)
              AND success = FALSE
              AND created_at > NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(username)
        .bind(window_secs as f64)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}
