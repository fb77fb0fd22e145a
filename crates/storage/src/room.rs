use anyhow::{anyhow, Context, Result};
use sqlx::FromRow;
use thiserror::Error;

use crate::StoragePool;

#[derive(Debug, Clone, FromRow)]
pub struct RoomRow {
    pub room_id: String,
    pub server_id: String,
    pub name: String,
    pub topic: Option<String>,
    pub avatar_url: Option<String>,
    pub alias: Option<String>,
    pub creator: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct MemberRow {
    pub room_id: String,
    pub localpart: String,
    pub server_id: String,
    pub state: String,
    pub reason: Option<String>,
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room alias already taken")]
    AliasTaken,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct RoomRepository {
    pool: StoragePool,
}

impl RoomRepository {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    /// Insert a room. Alias uniqueness is enforced by the database, so a
    /// concurrent duplicate surfaces as [`RoomError::AliasTaken`] rather
    /// than corrupting state.
    pub async fn insert_room(&self, room: &RoomRow) -> Result<(), RoomError> {
        sqlx::query(
            r#"
            INSERT INTO rooms (room_id, server_id, name, topic, avatar_url, alias, creator)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&room.room_id)
        .bind(&room.server_id)
        .bind(&room.name)
        .bind(room.topic.as_deref())
        .bind(room.avatar_url.as_deref())
        .bind(room.alias.as_deref())
        .bind(&room.creator)
        .execute(self.pool.pool())
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err)
                if matches!(db_err.code(), Some(code) if code.as_ref() == "23505")
                    && db_err.constraint() == Some("rooms_alias_key") =>
            {
                RoomError::AliasTaken
            }
            other => RoomError::Other(
                anyhow!(other).context(format!("inserting room '{}'", room.room_id)),
            ),
        })?;

        Ok(())
    }

    pub async fn find_room(&self, room_id: &str) -> Result<Option<RoomRow>> {
        let room = sqlx::query_as::<_, RoomRow>(
            r#"
            SELECT room_id, server_id, name, topic, avatar_url, alias, creator
            FROM rooms
            WHERE room_id = $1
            "#,
        )
        .bind(room_id)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("querying room '{room_id}'"))?;

        Ok(room)
    }

    pub async fn update_room(&self, room: &RoomRow) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE rooms
            SET name = $2,
                topic = $3,
                avatar_url = $4
            WHERE room_id = $1
            "#,
        )
        .bind(&room.room_id)
        .bind(&room.name)
        .bind(room.topic.as_deref())
        .bind(room.avatar_url.as_deref())
        .execute(self.pool.pool())
        .await
        .with_context(|| format!("updating room '{}'", room.room_id))?;

        Ok(())
    }

    pub async fn find_member(&self, room_id: &str, localpart: &str) -> Result<Option<MemberRow>> {
        let member = sqlx::query_as::<_, MemberRow>(
            r#"
            SELECT room_id, localpart, server_id, state, reason
            FROM room_members
            WHERE room_id = $1 AND localpart = $2
            "#,
        )
        .bind(room_id)
        .bind(localpart)
        .fetch_optional(self.pool.pool())
        .await
        .with_context(|| format!("querying membership of '{localpart}' in '{room_id}'"))?;

        Ok(member)
    }

    /// Upsert a membership row; at most one per (room, user).
    pub async fn save_member(&self, member: &MemberRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO room_members (room_id, localpart, server_id, state, reason)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (room_id, localpart) DO UPDATE
            SET state = EXCLUDED.state,
                reason = EXCLUDED.reason
            "#,
        )
        .bind(&member.room_id)
        .bind(&member.localpart)
        .bind(&member.server_id)
        .bind(&member.state)
        .bind(member.reason.as_deref())
        .execute(self.pool.pool())
        .await
        .with_context(|| {
            format!(
                "saving membership of '{}' in '{}'",
                member.localpart, member.room_id
            )
        })?;

        Ok(())
    }

    pub async fn list_members(&self, server_id: &str, room_id: &str) -> Result<Vec<MemberRow>> {
        let members = sqlx::query_as::<_, MemberRow>(
            r#"
            SELECT room_id, localpart, server_id, state, reason
            FROM room_members
            WHERE room_id = $1 AND server_id = $2
            ORDER BY localpart
            "#,
        )
        .bind(room_id)
        .bind(server_id)
        .fetch_all(self.pool.pool())
        .await
        .with_context(|| format!("listing members of '{room_id}'"))?;

        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect;
    use std::env;

    // Exercises the alias constraint end to end; skipped without a database,
    // mirroring the other live-Postgres tests in this crate.
    #[tokio::test]
    async fn duplicate_alias_is_rejected_by_the_database() -> anyhow::Result<()> {
        let database_url =
            match env::var("SYNMOCK_TEST_DATABASE_URL").or_else(|_| env::var("DATABASE_URL")) {
                Ok(url) => url,
                Err(_) => {
                    eprintln!(
                        "skipping alias constraint test: set SYNMOCK_TEST_DATABASE_URL or DATABASE_URL"
                    );
                    return Ok(());
                }
            };

        let pool = connect(&database_url).await?;
        let repo = RoomRepository::new(pool.clone());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let alias = format!("#alias-{suffix}:host");

        let first = RoomRow {
            room_id: format!("!first-{suffix}:host"),
            server_id: "s1".into(),
            name: "First".into(),
            topic: None,
            avatar_url: None,
            alias: Some(alias.clone()),
            creator: "alice".into(),
        };
        repo.insert_room(&first).await?;

        let second = RoomRow {
            room_id: format!("!second-{suffix}:host"),
            alias: Some(alias),
            ..first.clone()
        };
        let err = repo.insert_room(&second).await.unwrap_err();
        assert!(matches!(err, RoomError::AliasTaken));

        sqlx::query("DELETE FROM rooms WHERE room_id = $1")
            .bind(&first.room_id)
            .execute(pool.pool())
            .await?;

        Ok(())
    }
}
