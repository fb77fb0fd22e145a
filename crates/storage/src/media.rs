use anyhow::{Context, Result};
use uuid::Uuid;

use crate::StoragePool;

/// Registry mapping content URIs to their owning server.
///
/// Populated when avatar state updates reference a URI; nothing in this
/// server serves the content itself.
#[derive(Clone)]
pub struct MediaRepository {
    pool: StoragePool,
}

impl MediaRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn register(&self, server_id: &str, content_uri: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO medias (id, server_id, content_uri)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(id)
        .bind(server_id)
        .bind(content_uri)
        .execute(self.pool.pool())
        .await
        .with_context(|| format!("registering media '{content_uri}' for '{server_id}'"))?;

        Ok(id)
    }
}
