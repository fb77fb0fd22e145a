//! Persistence seam for the API services.
//!
//! Handlers talk to the [`AccountStore`], [`TokenStore`] and [`RoomStore`]
//! traits. [`MemoryStore`] backs them for tests and database-less runs;
//! the `Database*` adapters delegate to the repositories in
//! `synmock-storage` when a Postgres pool is configured.

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use synmock_core::MembershipState;
use synmock_storage::{
    password, AccountRepository, CredentialError, MediaRepository, MemberRow, RoomError,
    RoomRepository, RoomRow, StoragePool, TokenError, TokenRepository, TokenRow,
};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AccountIdentity {
    pub id: Uuid,
    pub server_id: String,
    pub localpart: String,
}

#[derive(Debug, Clone, Default)]
pub struct Profile {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Single session slot per user; fields stay `None` until login binds them.
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub user_id: Uuid,
    pub server_id: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub room_id: String,
    pub server_id: String,
    pub name: String,
    pub topic: Option<String>,
    pub avatar_url: Option<String>,
    pub alias: Option<String>,
    pub creator: String,
}

#[derive(Debug, Clone)]
pub struct MemberRecord {
    pub room_id: String,
    pub localpart: String,
    pub server_id: String,
    pub state: MembershipState,
    pub reason: Option<String>,
}

impl MemberRecord {
    pub fn is_joined(&self) -> bool {
        self.state.is_joined()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("room alias already taken")]
    AliasTaken,
    #[error("access token already in use")]
    AccessTokenInUse,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Check a password against the stored credential. Unknown user and
    /// wrong password both come back as `None` so callers cannot tell them
    /// apart.
    async fn authenticate(
        &self,
        server_id: &str,
        localpart: &str,
        password: &str,
    ) -> Result<Option<AccountIdentity>, StoreError>;

    async fn find_identity(&self, user_id: Uuid) -> Result<Option<AccountIdentity>, StoreError>;

    async fn find_profile(
        &self,
        server_id: &str,
        localpart: &str,
    ) -> Result<Option<Profile>, StoreError>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn find_by_user(&self, user_id: Uuid) -> Result<Option<SessionToken>, StoreError>;
    async fn find_by_access(&self, access_token: &str) -> Result<Option<SessionToken>, StoreError>;
    async fn find_by_refresh(&self, refresh_token: &str)
        -> Result<Option<SessionToken>, StoreError>;
    /// Persist the row; a duplicate access token surfaces as
    /// [`StoreError::AccessTokenInUse`] so the caller can regenerate.
    async fn save(&self, token: &SessionToken) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn insert_room(&self, room: &RoomRecord) -> Result<(), StoreError>;
    async fn find_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError>;
    async fn update_room(&self, room: &RoomRecord) -> Result<(), StoreError>;
    async fn find_member(
        &self,
        room_id: &str,
        localpart: &str,
    ) -> Result<Option<MemberRecord>, StoreError>;
    async fn save_member(&self, member: &MemberRecord) -> Result<(), StoreError>;
    async fn list_members(
        &self,
        server_id: &str,
        room_id: &str,
    ) -> Result<Vec<MemberRecord>, StoreError>;
    async fn register_media(&self, server_id: &str, content_uri: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

struct MemoryAccount {
    identity: AccountIdentity,
    digest: String,
    pattern: String,
    profile: Profile,
}

#[derive(Default)]
struct MemoryInner {
    accounts: HashMap<Uuid, MemoryAccount>,
    by_localpart: HashMap<(String, String), Uuid>,
    tokens: HashMap<Uuid, SessionToken>,
    rooms: HashMap<String, RoomRecord>,
    members: HashMap<(String, String), MemberRecord>,
    medias: Vec<(String, String)>,
}

/// All three stores in one lock. Fine for a test fixture; the lock is held
/// for the duration of each operation, which keeps the uniqueness checks
/// atomic without database constraints.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account with a freshly hashed password, mirroring what
    /// the seed CLI does against Postgres.
    pub async fn seed_account(
        &self,
        server_id: &str,
        localpart: &str,
        plaintext: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> anyhow::Result<Uuid> {
        let digest =
            password::hash_password(plaintext).map_err(|err| anyhow!("hashing password: {err}"))?;

        let mut inner = self.inner.write().await;
        let key = (server_id.to_string(), localpart.to_string());
        if inner.by_localpart.contains_key(&key) {
            return Err(anyhow!("'{localpart}' already registered on '{server_id}'"));
        }

        let id = Uuid::new_v4();
        inner.by_localpart.insert(key, id);
        inner.accounts.insert(
            id,
            MemoryAccount {
                identity: AccountIdentity {
                    id,
                    server_id: server_id.to_string(),
                    localpart: localpart.to_string(),
                },
                digest,
                pattern: password::DEFAULT_PATTERN.to_string(),
                profile: Profile {
                    display_name: display_name.map(str::to_string),
                    avatar_url: avatar_url.map(str::to_string),
                },
            },
        );
        inner.tokens.insert(
            id,
            SessionToken {
                user_id: id,
                server_id: None,
                access_token: None,
                refresh_token: None,
            },
        );
        Ok(id)
    }

    #[cfg(test)]
    pub async fn media_uris(&self, server_id: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .medias
            .iter()
            .filter(|(owner, _)| owner == server_id)
            .map(|(_, uri)| uri.clone())
            .collect()
    }

    pub async fn seed_member(&self, server_id: &str, room_id: &str, localpart: &str) {
        let mut inner = self.inner.write().await;
        inner.members.insert(
            (room_id.to_string(), localpart.to_string()),
            MemberRecord {
                room_id: room_id.to_string(),
                localpart: localpart.to_string(),
                server_id: server_id.to_string(),
                state: MembershipState::Join,
                reason: None,
            },
        );
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn authenticate(
        &self,
        server_id: &str,
        localpart: &str,
        plaintext: &str,
    ) -> Result<Option<AccountIdentity>, StoreError> {
        let inner = self.inner.read().await;
        let key = (server_id.to_string(), localpart.to_string());
        let Some(id) = inner.by_localpart.get(&key) else {
            return Ok(None);
        };
        let account = inner
            .accounts
            .get(id)
            .ok_or_else(|| anyhow!("account index out of sync for '{localpart}'"))?;

        match password::verify_password(plaintext, &account.digest, &account.pattern) {
            Ok(()) => Ok(Some(account.identity.clone())),
            Err(password::PasswordError::Mismatch)
            | Err(password::PasswordError::PatternMismatch { .. }) => Ok(None),
            Err(err) => Err(anyhow!("verifying credential for '{localpart}': {err}").into()),
        }
    }

    async fn find_identity(&self, user_id: Uuid) -> Result<Option<AccountIdentity>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .accounts
            .get(&user_id)
            .map(|account| account.identity.clone()))
    }

    async fn find_profile(
        &self,
        server_id: &str,
        localpart: &str,
    ) -> Result<Option<Profile>, StoreError> {
        let inner = self.inner.read().await;
        let key = (server_id.to_string(), localpart.to_string());
        Ok(inner
            .by_localpart
            .get(&key)
            .and_then(|id| inner.accounts.get(id))
            .map(|account| account.profile.clone()))
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn find_by_user(&self, user_id: Uuid) -> Result<Option<SessionToken>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.tokens.get(&user_id).cloned())
    }

    async fn find_by_access(&self, access_token: &str) -> Result<Option<SessionToken>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tokens
            .values()
            .find(|token| token.access_token.as_deref() == Some(access_token))
            .cloned())
    }

    async fn find_by_refresh(
        &self,
        refresh_token: &str,
    ) -> Result<Option<SessionToken>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tokens
            .values()
            .find(|token| token.refresh_token.as_deref() == Some(refresh_token))
            .cloned())
    }

    async fn save(&self, token: &SessionToken) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(access) = token.access_token.as_deref() {
            let collision = inner.tokens.values().any(|other| {
                other.user_id != token.user_id && other.access_token.as_deref() == Some(access)
            });
            if collision {
                return Err(StoreError::AccessTokenInUse);
            }
        }
        inner.tokens.insert(token.user_id, token.clone());
        Ok(())
    }
}

#[async_trait]
impl RoomStore for MemoryStore {
    async fn insert_room(&self, room: &RoomRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(alias) = room.alias.as_deref() {
            let taken = inner
                .rooms
                .values()
                .any(|other| other.alias.as_deref() == Some(alias));
            if taken {
                return Err(StoreError::AliasTaken);
            }
        }
        if inner.rooms.contains_key(&room.room_id) {
            return Err(anyhow!("room '{}' already exists", room.room_id).into());
        }
        inner.rooms.insert(room.room_id.clone(), room.clone());
        Ok(())
    }

    async fn find_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.rooms.get(room_id).cloned())
    }

    async fn update_room(&self, room: &RoomRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.rooms.contains_key(&room.room_id) {
            return Err(anyhow!("room '{}' does not exist", room.room_id).into());
        }
        inner.rooms.insert(room.room_id.clone(), room.clone());
        Ok(())
    }

    async fn find_member(
        &self,
        room_id: &str,
        localpart: &str,
    ) -> Result<Option<MemberRecord>, StoreError> {
        let inner = self.inner.read().await;
        let key = (room_id.to_string(), localpart.to_string());
        Ok(inner.members.get(&key).cloned())
    }

    async fn save_member(&self, member: &MemberRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.members.insert(
            (member.room_id.clone(), member.localpart.clone()),
            member.clone(),
        );
        Ok(())
    }

    async fn list_members(
        &self,
        server_id: &str,
        room_id: &str,
    ) -> Result<Vec<MemberRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut members: Vec<MemberRecord> = inner
            .members
            .values()
            .filter(|member| member.room_id == room_id && member.server_id == server_id)
            .cloned()
            .collect();
        members.sort_by(|a, b| a.localpart.cmp(&b.localpart));
        Ok(members)
    }

    async fn register_media(&self, server_id: &str, content_uri: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .medias
            .push((server_id.to_string(), content_uri.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Postgres adapters
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DatabaseAccountStore {
    pool: StoragePool,
}

impl DatabaseAccountStore {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for DatabaseAccountStore {
    async fn authenticate(
        &self,
        server_id: &str,
        localpart: &str,
        plaintext: &str,
    ) -> Result<Option<AccountIdentity>, StoreError> {
        match AccountRepository::verify_credentials(self.pool.pool(), server_id, localpart, plaintext)
            .await
        {
            Ok(user) => Ok(Some(AccountIdentity {
                id: user.id,
                server_id: user.server_id,
                localpart: user.localpart,
            })),
            Err(err) if err.downcast_ref::<CredentialError>().is_some() => Ok(None),
            Err(err) => Err(StoreError::Backend(err)),
        }
    }

    async fn find_identity(&self, user_id: Uuid) -> Result<Option<AccountIdentity>, StoreError> {
        let user = AccountRepository::find_user_by_id(self.pool.pool(), user_id).await?;
        Ok(user.map(|user| AccountIdentity {
            id: user.id,
            server_id: user.server_id,
            localpart: user.localpart,
        }))
    }

    async fn find_profile(
        &self,
        server_id: &str,
        localpart: &str,
    ) -> Result<Option<Profile>, StoreError> {
        let user = AccountRepository::find_user(self.pool.pool(), server_id, localpart).await?;
        Ok(user.map(|user| Profile {
            display_name: user.display_name,
            avatar_url: user.avatar_url,
        }))
    }
}

#[derive(Clone)]
pub struct DatabaseTokenStore {
    repo: TokenRepository,
}

impl DatabaseTokenStore {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            repo: TokenRepository::new(pool),
        }
    }
}

fn token_from_row(row: TokenRow) -> SessionToken {
    SessionToken {
        user_id: row.user_id,
        server_id: row.server_id,
        access_token: row.access_token,
        refresh_token: row.refresh_token,
    }
}

#[async_trait]
impl TokenStore for DatabaseTokenStore {
    async fn find_by_user(&self, user_id: Uuid) -> Result<Option<SessionToken>, StoreError> {
        Ok(self.repo.find_by_user(user_id).await?.map(token_from_row))
    }

    async fn find_by_access(&self, access_token: &str) -> Result<Option<SessionToken>, StoreError> {
        Ok(self
            .repo
            .find_by_access(access_token)
            .await?
            .map(token_from_row))
    }

    async fn find_by_refresh(
        &self,
        refresh_token: &str,
    ) -> Result<Option<SessionToken>, StoreError> {
        Ok(self
            .repo
            .find_by_refresh(refresh_token)
            .await?
            .map(token_from_row))
    }

    async fn save(&self, token: &SessionToken) -> Result<(), StoreError> {
        let row = TokenRow {
            user_id: token.user_id,
            server_id: token.server_id.clone(),
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
        };
        self.repo.save(&row).await.map_err(|err| match err {
            TokenError::AccessTokenInUse => StoreError::AccessTokenInUse,
            TokenError::Other(err) => StoreError::Backend(err),
        })
    }
}

#[derive(Clone)]
pub struct DatabaseRoomStore {
    rooms: RoomRepository,
    medias: MediaRepository,
}

impl DatabaseRoomStore {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            rooms: RoomRepository::new(pool.clone()),
            medias: MediaRepository::new(pool),
        }
    }
}

fn room_from_row(row: RoomRow) -> RoomRecord {
    RoomRecord {
        room_id: row.room_id,
        server_id: row.server_id,
        name: row.name,
        topic: row.topic,
        avatar_url: row.avatar_url,
        alias: row.alias,
        creator: row.creator,
    }
}

fn member_from_row(row: MemberRow) -> Result<MemberRecord, StoreError> {
    let state = row
        .state
        .parse::<MembershipState>()
        .map_err(|err| anyhow!("row for '{}' in '{}': {err}", row.localpart, row.room_id))?;
    Ok(MemberRecord {
        room_id: row.room_id,
        localpart: row.localpart,
        server_id: row.server_id,
        state,
        reason: row.reason,
    })
}

#[async_trait]
impl RoomStore for DatabaseRoomStore {
    async fn insert_room(&self, room: &RoomRecord) -> Result<(), StoreError> {
        let row = RoomRow {
            room_id: room.room_id.clone(),
            server_id: room.server_id.clone(),
            name: room.name.clone(),
            topic: room.topic.clone(),
            avatar_url: room.avatar_url.clone(),
            alias: room.alias.clone(),
            creator: room.creator.clone(),
        };
        self.rooms.insert_room(&row).await.map_err(|err| match err {
            RoomError::AliasTaken => StoreError::AliasTaken,
            RoomError::Other(err) => StoreError::Backend(err),
        })
    }

    async fn find_room(&self, room_id: &str) -> Result<Option<RoomRecord>, StoreError> {
        Ok(self.rooms.find_room(room_id).await?.map(room_from_row))
    }

    async fn update_room(&self, room: &RoomRecord) -> Result<(), StoreError> {
        let row = RoomRow {
            room_id: room.room_id.clone(),
            server_id: room.server_id.clone(),
            name: room.name.clone(),
            topic: room.topic.clone(),
            avatar_url: room.avatar_url.clone(),
            alias: room.alias.clone(),
            creator: room.creator.clone(),
        };
        self.rooms.update_room(&row).await?;
        Ok(())
    }

    async fn find_member(
        &self,
        room_id: &str,
        localpart: &str,
    ) -> Result<Option<MemberRecord>, StoreError> {
        match self.rooms.find_member(room_id, localpart).await? {
            Some(row) => Ok(Some(member_from_row(row)?)),
            None => Ok(None),
        }
    }

    async fn save_member(&self, member: &MemberRecord) -> Result<(), StoreError> {
        let row = MemberRow {
            room_id: member.room_id.clone(),
            localpart: member.localpart.clone(),
            server_id: member.server_id.clone(),
            state: member.state.as_str().to_string(),
            reason: member.reason.clone(),
        };
        self.rooms.save_member(&row).await?;
        Ok(())
    }

    async fn list_members(
        &self,
        server_id: &str,
        room_id: &str,
    ) -> Result<Vec<MemberRecord>, StoreError> {
        let rows = self.rooms.list_members(server_id, room_id).await?;
        rows.into_iter().map(member_from_row).collect()
    }

    async fn register_media(&self, server_id: &str, content_uri: &str) -> Result<(), StoreError> {
        self.medias.register(server_id, content_uri).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(user_id: Uuid, access: &str) -> SessionToken {
        SessionToken {
            user_id,
            server_id: Some("s1".into()),
            access_token: Some(access.into()),
            refresh_token: Some(format!("refresh-{access}")),
        }
    }

    #[tokio::test]
    async fn authenticate_merges_unknown_user_and_bad_password() {
        let store = MemoryStore::new();
        store
            .seed_account("s1", "alice", "secret", None, None)
            .await
            .unwrap();

        assert!(store
            .authenticate("s1", "alice", "secret")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .authenticate("s1", "alice", "wrong")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .authenticate("s1", "nobody", "secret")
            .await
            .unwrap()
            .is_none());
        // Same localpart on another server is a different account.
        assert!(store
            .authenticate("s2", "alice", "secret")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn seeding_a_duplicate_localpart_fails() {
        let store = MemoryStore::new();
        store
            .seed_account("s1", "alice", "secret", None, None)
            .await
            .unwrap();
        assert!(store
            .seed_account("s1", "alice", "other", None, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn duplicate_access_token_is_rejected_across_users() {
        let store = MemoryStore::new();
        let alice = store
            .seed_account("s1", "alice", "secret", None, None)
            .await
            .unwrap();
        let bob = store
            .seed_account("s1", "bob", "secret", None, None)
            .await
            .unwrap();

        store.save(&token(alice, "tok-1")).await.unwrap();
        let err = store.save(&token(bob, "tok-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::AccessTokenInUse));

        // Re-saving the same user's own token is not a collision.
        store.save(&token(alice, "tok-1")).await.unwrap();
    }

    #[tokio::test]
    async fn alias_conflicts_are_detected() {
        let store = MemoryStore::new();
        let room = RoomRecord {
            room_id: "!aaaaaaaaaaaaaaaaaa:host".into(),
            server_id: "s1".into(),
            name: "general".into(),
            topic: None,
            avatar_url: None,
            alias: Some("#general:host".into()),
            creator: "alice".into(),
        };
        store.insert_room(&room).await.unwrap();

        let clash = RoomRecord {
            room_id: "!bbbbbbbbbbbbbbbbbb:host".into(),
            ..room.clone()
        };
        let err = store.insert_room(&clash).await.unwrap_err();
        assert!(matches!(err, StoreError::AliasTaken));

        // No alias, no conflict.
        let plain = RoomRecord {
            room_id: "!cccccccccccccccccc:host".into(),
            alias: None,
            ..room
        };
        store.insert_room(&plain).await.unwrap();
    }

    #[tokio::test]
    async fn membership_upsert_replaces_state_and_reason() {
        let store = MemoryStore::new();
        store.seed_member("s1", "!room:host", "bob").await;

        let kicked = MemberRecord {
            room_id: "!room:host".into(),
            localpart: "bob".into(),
            server_id: "s1".into(),
            state: MembershipState::Leave,
            reason: Some("spam".into()),
        };
        store.save_member(&kicked).await.unwrap();

        let member = store
            .find_member("!room:host", "bob")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(member.state, MembershipState::Leave);
        assert_eq!(member.reason.as_deref(), Some("spam"));
    }

    #[tokio::test]
    async fn list_members_is_scoped_to_server_and_sorted() {
        let store = MemoryStore::new();
        store.seed_member("s1", "!room:host", "carol").await;
        store.seed_member("s1", "!room:host", "alice").await;
        store.seed_member("s2", "!room:host", "mallory").await;
        store.seed_member("s1", "!other:host", "dave").await;

        let members = store.list_members("s1", "!room:host").await.unwrap();
        let names: Vec<&str> = members.iter().map(|m| m.localpart.as_str()).collect();
        assert_eq!(names, vec!["alice", "carol"]);
    }
}
