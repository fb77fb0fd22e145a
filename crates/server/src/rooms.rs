//! Room registry, state updates and the membership engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::Path, extract::State, http::HeaderMap, Json};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use synmock_core::MembershipState;

use crate::{
    auth,
    error::ApiError,
    store::{AccountStore, MemberRecord, RoomRecord, RoomStore, StoreError},
    AppState,
};

pub struct CreatedRoom {
    pub room_id: String,
    pub room_alias: Option<String>,
}

#[derive(Serialize)]
pub struct JoinedMember {
    pub avatar_url: Option<String>,
    pub display_name: Option<String>,
}

pub struct RoomService {
    rooms: Arc<dyn RoomStore>,
    accounts: Arc<dyn AccountStore>,
}

impl RoomService {
    pub fn new(rooms: Arc<dyn RoomStore>, accounts: Arc<dyn AccountStore>) -> Self {
        Self { rooms, accounts }
    }

    pub async fn create_room(
        &self,
        server_id: &str,
        host: &str,
        creator: &str,
        name: Option<&str>,
        topic: Option<&str>,
        alias_localpart: Option<&str>,
    ) -> Result<CreatedRoom, ApiError> {
        self.create_room_at(
            server_id,
            host,
            creator,
            name,
            topic,
            alias_localpart,
            Utc::now().timestamp(),
        )
        .await
    }

    /// Like [`create_room`](Self::create_room) but with an explicit creation
    /// timestamp, which feeds the deterministic room ID. Tests freeze it.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_room_at(
        &self,
        server_id: &str,
        host: &str,
        creator: &str,
        name: Option<&str>,
        topic: Option<&str>,
        alias_localpart: Option<&str>,
        created_at_secs: i64,
    ) -> Result<CreatedRoom, ApiError> {
        // Nameless rooms get a random numeric placeholder so zero-config
        // smoke tests can create rooms without a body.
        let name = match name {
            Some(name) => name.to_string(),
            None => rand::rng().random::<u32>().to_string(),
        };

        let room_id = synmock_core::room_id(server_id, &name, created_at_secs, host);
        let alias = alias_localpart.map(|local| synmock_core::room_alias(local, host));

        let record = RoomRecord {
            room_id: room_id.clone(),
            server_id: server_id.to_string(),
            name,
            topic: topic.map(str::to_string),
            avatar_url: None,
            alias: alias.clone(),
            creator: creator.to_string(),
        };

        // The insert itself carries the alias uniqueness constraint; there is
        // no lookup beforehand, so concurrent creators cannot both win.
        match self.rooms.insert_room(&record).await {
            Ok(()) => Ok(CreatedRoom {
                room_id,
                room_alias: alias,
            }),
            Err(StoreError::AliasTaken) => Err(ApiError::RoomInUse),
            Err(err) => Err(err.into()),
        }
    }

    /// Apply a state event to a room and return the event ID.
    ///
    /// The ID depends only on `(server_id, room_id, event_type)`, never on
    /// the new value, so repeated updates of the same type return the same
    /// ID. Long-standing behavior that clients rely on; do not "fix".
    pub async fn update_state(
        &self,
        server_id: &str,
        room_id: &str,
        event_type: &str,
        body: &Value,
    ) -> Result<String, ApiError> {
        let mut room = self
            .rooms
            .find_room(room_id)
            .await?
            .ok_or(ApiError::RoomNotFound)?;

        match event_type {
            "m.room.topic" => {
                room.topic = Some(require_str(body, "topic")?.to_string());
            }
            "m.room.name" => {
                room.name = require_str(body, "name")?.to_string();
            }
            "m.room.avatar" => {
                let url = require_str(body, "url")?.to_string();
                self.rooms.register_media(server_id, &url).await?;
                room.avatar_url = Some(url);
            }
            _ => return Err(ApiError::Unrecognized),
        }

        self.rooms.update_room(&room).await?;
        Ok(synmock_core::event_id(server_id, room_id, event_type))
    }

    /// Kick a user: their membership flips to `leave` with the given reason.
    /// Absent membership and an already-left member look the same to the
    /// caller. Any authorized caller may kick; there is no power-level model.
    pub async fn kick(
        &self,
        room_id: &str,
        target: &str,
        reason: Option<String>,
    ) -> Result<(), ApiError> {
        self.rooms
            .find_room(room_id)
            .await?
            .ok_or(ApiError::RoomNotFound)?;

        let mut member = self
            .rooms
            .find_member(room_id, target)
            .await?
            .ok_or(ApiError::NotMember)?;
        if !member.is_joined() {
            return Err(ApiError::NotMember);
        }

        member.state = MembershipState::Leave;
        member.reason = reason;
        self.rooms.save_member(&member).await?;
        Ok(())
    }

    /// Map of joined members to their profiles. A membership row whose user
    /// record has gone missing is logged and skipped rather than failing the
    /// whole response.
    pub async fn joined_members(
        &self,
        server_id: &str,
        room_id: &str,
    ) -> Result<BTreeMap<String, JoinedMember>, ApiError> {
        let members = self.rooms.list_members(server_id, room_id).await?;

        let mut joined = BTreeMap::new();
        for member in members.into_iter().filter(MemberRecord::is_joined) {
            match self
                .accounts
                .find_profile(server_id, &member.localpart)
                .await?
            {
                Some(profile) => {
                    joined.insert(
                        member.localpart,
                        JoinedMember {
                            avatar_url: profile.avatar_url,
                            display_name: profile.display_name,
                        },
                    );
                }
                None => {
                    tracing::warn!(
                        room_id = %room_id,
                        localpart = %member.localpart,
                        "membership row references a missing user, skipping"
                    );
                }
            }
        }
        Ok(joined)
    }
}

fn require_str<'a>(body: &'a Value, field: &'static str) -> Result<&'a str, ApiError> {
    body.get(field)
        .and_then(Value::as_str)
        .ok_or(ApiError::InvalidParam(field))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct CreateRoomRequest {
    name: Option<String>,
    topic: Option<String>,
    room_alias_name: Option<String>,
}

#[derive(Serialize)]
pub struct CreateRoomResponse {
    room_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    room_alias: Option<String>,
}

pub async fn create_room(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CreateRoomRequest>,
) -> Result<Json<CreateRoomResponse>, ApiError> {
    let token = auth::bearer_token(&headers)?;
    let actor = state.sessions.validate(&server_id, token).await?;
    let host = auth::request_host(&headers, &state.config.server_name);

    let created = state
        .rooms
        .create_room(
            &server_id,
            &host,
            &actor.localpart,
            body.name.as_deref(),
            body.topic.as_deref(),
            body.room_alias_name.as_deref(),
        )
        .await?;

    tracing::info!(server_id = %server_id, room_id = %created.room_id, creator = %actor.localpart, "room created");

    Ok(Json(CreateRoomResponse {
        room_id: created.room_id,
        room_alias: created.room_alias,
    }))
}

#[derive(Serialize)]
pub struct StateEventResponse {
    event_id: String,
}

pub async fn update_state(
    State(state): State<AppState>,
    Path((server_id, room_id, event_type)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<StateEventResponse>, ApiError> {
    let token = auth::bearer_token(&headers)?;
    state.sessions.validate(&server_id, token).await?;

    let event_id = state
        .rooms
        .update_state(&server_id, &room_id, &event_type, &body)
        .await?;

    Ok(Json(StateEventResponse { event_id }))
}

#[derive(Serialize)]
pub struct EmptyResponse {}

pub async fn kick(
    State(state): State<AppState>,
    Path((server_id, room_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<EmptyResponse>, ApiError> {
    let token = auth::bearer_token(&headers)?;
    state.sessions.validate(&server_id, token).await?;

    let target = require_str(&body, "user_id")?.to_string();
    let reason = body
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_string);

    state.rooms.kick(&room_id, &target, reason).await?;
    Ok(Json(EmptyResponse {}))
}

#[derive(Serialize)]
pub struct JoinedMembersResponse {
    joined: BTreeMap<String, JoinedMember>,
}

pub async fn joined_members(
    State(state): State<AppState>,
    Path((server_id, room_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<JoinedMembersResponse>, ApiError> {
    let token = auth::bearer_token(&headers)?;
    state.sessions.validate(&server_id, token).await?;

    let joined = state.rooms.joined_members(&server_id, &room_id).await?;
    Ok(Json(JoinedMembersResponse { joined }))
}
