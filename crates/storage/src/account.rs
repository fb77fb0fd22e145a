use anyhow::{anyhow, Context, Result};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::password::{self, PasswordError};

/// Repository utilities for user and credential persistence.
pub struct AccountRepository;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub server_id: String,
    pub localpart: String,
    pub password_pattern: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAccount<'a> {
    pub server_id: &'a str,
    pub localpart: &'a str,
    pub password: &'a str,
    pub display_name: Option<&'a str>,
    pub avatar_url: Option<&'a str>,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("user not found")]
    UserNotFound,
    #[error("invalid credentials")]
    InvalidCredentials,
}

#[derive(Debug, Error)]
pub enum CreateAccountError {
    #[error("localpart already registered on this server")]
    LocalpartTaken,
    #[error("failed to create account: {0}")]
    Other(#[from] anyhow::Error),
}

impl AccountRepository {
    /// Create a user, its credential, and an empty token row in one
    /// transaction. The token row is what login later rotates; without it a
    /// login attempt fails.
    pub async fn create_account(
        pool: &PgPool,
        account: NewAccount<'_>,
    ) -> Result<Uuid, CreateAccountError> {
        let id = Uuid::new_v4();
        let digest = password::hash_password(account.password)
            .map_err(|err| anyhow!("hashing password failed: {err}"))?;

        let mut tx = pool
            .begin()
            .await
            .map_err(|err| CreateAccountError::Other(anyhow!(err)))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO users (id, server_id, localpart, password_pattern, display_name, avatar_url)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(account.server_id)
        .bind(account.localpart)
        .bind(password::DEFAULT_PATTERN)
        .bind(account.display_name)
        .bind(account.avatar_url)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            return Err(match err {
                sqlx::Error::Database(db_err)
                    if matches!(db_err.code(), Some(code) if code.as_ref() == "23505") =>
                {
                    CreateAccountError::LocalpartTaken
                }
                other => CreateAccountError::Other(
                    anyhow!(other).context(format!("creating user '{}'", account.localpart)),
                ),
            });
        }

        sqlx::query("INSERT INTO credentials (user_id, digest) VALUES ($1, $2)")
            .bind(id)
            .bind(&digest)
            .execute(&mut *tx)
            .await
            .map_err(|err| CreateAccountError::Other(anyhow!(err)))?;

        sqlx::query("INSERT INTO tokens (user_id) VALUES ($1)")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|err| CreateAccountError::Other(anyhow!(err)))?;

        tx.commit()
            .await
            .map_err(|err| CreateAccountError::Other(anyhow!(err)))?;

        Ok(id)
    }

    /// Verify credentials and return the user row when successful.
    ///
    /// An unknown user and a wrong password both surface as a
    /// [`CredentialError`] inside the returned `anyhow::Error`; callers that
    /// must not distinguish the two downcast and merge them.
    pub async fn verify_credentials(
        pool: &PgPool,
        server_id: &str,
        localpart: &str,
        plaintext: &str,
    ) -> Result<UserRow> {
        let user = Self::find_user(pool, server_id, localpart).await?;
        let Some(user) = user else {
            return Err(CredentialError::UserNotFound.into());
        };

        let digest = sqlx::query_scalar::<_, String>(
            r#"
            SELECT digest
            FROM credentials
            WHERE user_id = $1
            "#,
        )
        .bind(user.id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("querying credential for '{localpart}'"))?;

        let Some(digest) = digest else {
            return Err(CredentialError::UserNotFound.into());
        };

        match password::verify_password(plaintext, &digest, &user.password_pattern) {
            Ok(()) => Ok(user),
            Err(PasswordError::Mismatch | PasswordError::PatternMismatch { .. }) => {
                Err(CredentialError::InvalidCredentials.into())
            }
            Err(err) => Err(anyhow!("verifying credential for '{localpart}': {err}")),
        }
    }

    pub async fn find_user(
        pool: &PgPool,
        server_id: &str,
        localpart: &str,
    ) -> Result<Option<UserRow>> {
        let user = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, server_id, localpart, password_pattern, display_name, avatar_url
            FROM users
            WHERE server_id = $1 AND localpart = $2
            "#,
        )
        .bind(server_id)
        .bind(localpart)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("querying user '{localpart}' on '{server_id}'"))?;

        Ok(user)
    }

    pub async fn find_user_by_id(pool: &PgPool, id: Uuid) -> Result<Option<UserRow>> {
        let user = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, server_id, localpart, password_pattern, display_name, avatar_url
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("querying user by id '{id}'"))?;

        Ok(user)
    }
}
