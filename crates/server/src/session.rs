//! Password login, token refresh and bearer validation.

use std::sync::Arc;

use axum::{extract::Path, extract::State, http::HeaderMap, Json};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{
    auth,
    error::ApiError,
    store::{AccountIdentity, AccountStore, SessionToken, StoreError, TokenStore},
    AppState,
};

const TOKEN_ENTROPY_BYTES: usize = 32;
/// A collision on 256 random bits is effectively a broken RNG, but the
/// database constraint can still fire; give up after a few regenerations.
const TOKEN_REGENERATE_ATTEMPTS: usize = 3;

pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Tokens issued by a login or refresh.
#[derive(Debug)]
pub struct LoginGrant {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
}

pub struct SessionService {
    accounts: Arc<dyn AccountStore>,
    tokens: Arc<dyn TokenStore>,
}

impl SessionService {
    pub fn new(accounts: Arc<dyn AccountStore>, tokens: Arc<dyn TokenStore>) -> Self {
        Self { accounts, tokens }
    }

    /// Verify the password and rotate the session tokens. Unknown users and
    /// wrong passwords are deliberately indistinguishable.
    pub async fn login(
        &self,
        server_id: &str,
        localpart: &str,
        password: &str,
        rotate_refresh: bool,
    ) -> Result<LoginGrant, ApiError> {
        let identity = self
            .accounts
            .authenticate(server_id, localpart, password)
            .await?
            .ok_or(ApiError::Forbidden)?;

        tracing::debug!(user_id = %identity.id, home = %identity.server_id, "credentials verified");

        self.issue_or_refresh(&identity, server_id, rotate_refresh)
            .await
    }

    async fn issue_or_refresh(
        &self,
        identity: &AccountIdentity,
        server_id: &str,
        rotate_refresh: bool,
    ) -> Result<LoginGrant, ApiError> {
        let mut token = self
            .tokens
            .find_by_user(identity.id)
            .await?
            .ok_or(ApiError::SessionNotProvisioned)?;

        // First login wins the server binding; later logins keep it.
        if token.server_id.is_none() {
            token.server_id = Some(server_id.to_string());
        }

        let refresh_token = if rotate_refresh {
            let fresh = generate_token();
            token.refresh_token = Some(fresh.clone());
            Some(fresh)
        } else {
            None
        };

        let access_token = self.persist_with_fresh_access(&mut token).await?;

        Ok(LoginGrant {
            user_id: identity.localpart.clone(),
            access_token,
            refresh_token,
        })
    }

    /// Exchange a refresh token for a new token pair. The session is rebound
    /// to the server the request was addressed to.
    pub async fn refresh(
        &self,
        server_id: &str,
        refresh_token: &str,
    ) -> Result<LoginGrant, ApiError> {
        let mut token = self
            .tokens
            .find_by_refresh(refresh_token)
            .await?
            .ok_or(ApiError::UnknownToken)?;

        token.server_id = Some(server_id.to_string());
        let rotated = generate_token();
        token.refresh_token = Some(rotated.clone());
        let access_token = self.persist_with_fresh_access(&mut token).await?;

        let identity = self.identity_for(&token).await?;

        Ok(LoginGrant {
            user_id: identity.localpart,
            access_token,
            refresh_token: Some(rotated),
        })
    }

    /// Resolve the bearer token on a request into an account. A token bound
    /// to another server is treated the same as one that does not exist.
    pub async fn validate(
        &self,
        server_id: &str,
        access_token: &str,
    ) -> Result<AccountIdentity, ApiError> {
        let token = self
            .tokens
            .find_by_access(access_token)
            .await?
            .ok_or(ApiError::UnknownToken)?;

        if token.server_id.as_deref() != Some(server_id) {
            return Err(ApiError::UnknownToken);
        }

        self.identity_for(&token).await
    }

    async fn identity_for(&self, token: &SessionToken) -> Result<AccountIdentity, ApiError> {
        self.accounts
            .find_identity(token.user_id)
            .await?
            .ok_or_else(|| {
                ApiError::Internal(anyhow::anyhow!(
                    "token row references missing user '{}'",
                    token.user_id
                ))
            })
    }

    async fn persist_with_fresh_access(
        &self,
        token: &mut SessionToken,
    ) -> Result<String, ApiError> {
        for _ in 0..TOKEN_REGENERATE_ATTEMPTS {
            let access = generate_token();
            token.access_token = Some(access.clone());
            match self.tokens.save(token).await {
                Ok(()) => return Ok(access),
                Err(StoreError::AccessTokenInUse) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::AccessTokenInUse.into())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    identifier: Option<LoginIdentifier>,
    #[serde(rename = "type")]
    login_type: Option<String>,
    password: Option<String>,
    #[serde(default)]
    refresh_token: bool,
}

#[derive(Debug, Deserialize)]
struct LoginIdentifier {
    #[serde(rename = "type")]
    kind: Option<String>,
    user: Option<String>,
}

#[derive(Serialize)]
pub struct LoginResponse {
    user_id: String,
    access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    home_server: String,
}

pub async fn login(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let identifier = body.identifier.ok_or(ApiError::InvalidParam("identifier"))?;
    let login_type = body.login_type.ok_or(ApiError::InvalidParam("type"))?;

    match identifier.kind.as_deref() {
        Some("m.id.user") => {}
        _ => return Err(ApiError::InvalidParam("identifier.type")),
    }
    let localpart = identifier.user.ok_or(ApiError::InvalidParam("user"))?;

    if login_type != "m.login.password" {
        return Err(ApiError::BadLoginType);
    }
    let password = body.password.ok_or(ApiError::InvalidParam("password"))?;

    let grant = state
        .sessions
        .login(&server_id, &localpart, &password, body.refresh_token)
        .await?;

    tracing::info!(server_id = %server_id, user = %grant.user_id, "login succeeded");

    Ok(Json(LoginResponse {
        user_id: grant.user_id,
        access_token: grant.access_token,
        refresh_token: grant.refresh_token,
        home_server: auth::request_host(&headers, &state.config.server_name),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    refresh_token: Option<String>,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    access_token: String,
    refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let refresh_token = body
        .refresh_token
        .ok_or(ApiError::InvalidParam("refresh_token"))?;

    let grant = state.sessions.refresh(&server_id, &refresh_token).await?;

    tracing::info!(server_id = %server_id, user = %grant.user_id, "session refreshed");

    let rotated = grant.refresh_token.ok_or_else(|| {
        ApiError::Internal(anyhow::anyhow!("refresh grant is missing its rotated token"))
    })?;

    Ok(Json(RefreshResponse {
        access_token: grant.access_token,
        refresh_token: rotated,
    }))
}
