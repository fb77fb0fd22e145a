use anyhow::{anyhow, Context, Result};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

use crate::StoragePool;

/// One row per user; columns stay NULL until login binds them.
#[derive(Debug, Clone, FromRow)]
pub struct TokenRow {
    pub user_id: Uuid,
    pub server_id: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("access token already in use")]
    AccessTokenInUse,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct TokenRepository {
    pool: StoragePool,
}

impl TokenRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_user(&self, user_id: Uuid) -> Result<Option<TokenRow>> {
        let row = sqlx::query_as::<_, TokenRow>(
            r#"
            SELECT user_id, server_id, access_token, refresh_token
            FROM tokens
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("querying token row for user '{user_id}'"))?;

        Ok(row)
    }

    pub async fn find_by_access(&self, access_token: &str) -> Result<Option<TokenRow>> {
        let row = sqlx::query_as::<_, TokenRow>(
            r#"
            SELECT user_id, server_id, access_token, refresh_token
            FROM tokens
            WHERE access_token = $1
            "#,
        )
        .bind(access_token)
        .fetch_optional(self.pool.pool())
        .await
        .context("querying token row by access token")?;

        Ok(row)
    }

    pub async fn find_by_refresh(&self, refresh_token: &str) -> Result<Option<TokenRow>> {
        let row = sqlx::query_as::<_, TokenRow>(
            r#"
            SELECT user_id, server_id, access_token, refresh_token
            FROM tokens
            WHERE refresh_token = $1
            "#,
        )
        .bind(refresh_token)
        .fetch_optional(self.pool.pool())
        .await
        .context("querying token row by refresh token")?;

        Ok(row)
    }

    /// Persist a rotated token row. The partial unique index on
    /// `access_token` turns a colliding concurrent write into
    /// [`TokenError::AccessTokenInUse`] so the caller can regenerate.
    pub async fn save(&self, token: &TokenRow) -> Result<(), TokenError> {
        sqlx::query(
            r#"
            UPDATE tokens
            SET server_id = $2,
                access_token = $3,
                refresh_token = $4
            WHERE user_id = $1
            "#,
        )
        .bind(token.user_id)
        .bind(token.server_id.as_deref())
        .bind(token.access_token.as_deref())
        .bind(token.refresh_token.as_deref())
        .execute(self.pool.pool())
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err)
                if matches!(db_err.code(), Some(code) if code.as_ref() == "23505") =>
            {
                TokenError::AccessTokenInUse
            }
            other => TokenError::Other(
                anyhow!(other).context(format!("saving token row for user '{}'", token.user_id)),
            ),
        })?;

        Ok(())
    }
}
