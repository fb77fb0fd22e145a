mod auth;
mod config;
mod error;
mod rooms;
mod session;
mod store;

const REQUEST_ID_HEADER: &str = "x-request-id";
const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'";
const REFERRER_POLICY: &str = "no-referrer";
const X_CONTENT_TYPE_OPTIONS: &str = "nosniff";
const X_FRAME_OPTIONS: &str = "DENY";

use anyhow::{anyhow, Result};
use axum::{
    body::HttpBody,
    extract::{MatchedPath, State},
    http::{header::HeaderName, HeaderValue},
    routing::{get, post, put},
    Json, Router,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, RequestId, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

use synmock_core::MembershipState;
use synmock_storage::{
    connect, AccountRepository, CreateAccountError, MemberRow, NewAccount, RoomRepository,
    StoragePool,
};

use crate::{
    config::{CliOverrides, LogFormat, ServerConfig},
    error::ApiError,
    rooms::RoomService,
    session::SessionService,
    store::{
        AccountStore, DatabaseAccountStore, DatabaseRoomStore, DatabaseTokenStore, MemoryStore,
        RoomStore, TokenStore,
    },
};

#[derive(Clone)]
struct StorageState {
    status: StorageStatus,
    pool: Option<StoragePool>,
}

#[derive(Clone)]
enum StorageStatus {
    Unconfigured,
    Connected,
    Error(String),
}

impl StorageState {
    fn unconfigured() -> Self {
        Self {
            status: StorageStatus::Unconfigured,
            pool: None,
        }
    }

    fn connected_with_pool(pool: StoragePool) -> Self {
        Self {
            status: StorageStatus::Connected,
            pool: Some(pool),
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: StorageStatus::Error(message),
            pool: None,
        }
    }

    fn component(&self) -> ComponentStatus {
        match &self.status {
            StorageStatus::Unconfigured => ComponentStatus {
                name: "database",
                status: "pending",
                details: Some("database_url not configured; using in-memory store".to_string()),
            },
            StorageStatus::Connected => ComponentStatus {
                name: "database",
                status: "configured",
                details: Some("connection established".to_string()),
            },
            StorageStatus::Error(message) => ComponentStatus {
                name: "database",
                status: "error",
                details: Some(message.clone()),
            },
        }
    }

    fn readiness_status(&self) -> &'static str {
        match self.status {
            StorageStatus::Connected => "ready",
            StorageStatus::Unconfigured | StorageStatus::Error(_) => "degraded",
        }
    }

    fn pool(&self) -> Option<StoragePool> {
        self.pool.clone()
    }
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "synmock-server",
    version,
    about = "Mock Matrix client-server API homeserver"
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Args, Debug, Default, Clone)]
struct ConfigArgs {
    #[arg(long)]
    bind_addr: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    server_name: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    database_url: Option<String>,
}

impl ConfigArgs {
    fn into_overrides(self) -> CliOverrides {
        CliOverrides {
            bind_addr: self.bind_addr,
            host: self.host,
            server_name: self.server_name,
            port: self.port,
            log_format: self.log_format,
            database_url: self.database_url,
        }
    }
}

impl clap::ValueEnum for LogFormat {
    fn value_variants<'a>() -> &'a [Self] {
        &[LogFormat::Compact, LogFormat::Json]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Seed a user account (with credential and token slot) into the database.
    SeedUser(SeedUserCommand),
    /// Seed a joined room membership into the database.
    SeedMember(SeedMemberCommand),
}

#[derive(Args, Debug)]
struct SeedUserCommand {
    /// Server namespace the account lives in.
    #[arg(long)]
    server_id: String,
    /// Localpart for the seeded account.
    #[arg(long)]
    username: String,
    /// Plaintext password for the seeded account.
    #[arg(long)]
    password: String,
    /// Optional display name.
    #[arg(long)]
    display_name: Option<String>,
    /// Optional avatar content URI.
    #[arg(long)]
    avatar_url: Option<String>,
}

#[derive(Args, Debug)]
struct SeedMemberCommand {
    /// Server namespace of the membership.
    #[arg(long)]
    server_id: String,
    /// Room to join.
    #[arg(long)]
    room_id: String,
    /// Localpart of the joining user.
    #[arg(long)]
    username: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = cli.config.clone().into_overrides();
    let mut config = ServerConfig::load()?;
    config.apply_overrides(&overrides)?;

    if let Some(command) = cli.command {
        return run_command(&config, command).await;
    }

    let config = Arc::new(config);
    run(config).await
}

async fn run_command(config: &ServerConfig, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::SeedUser(cmd) => seed_user(config, cmd).await,
        CliCommand::SeedMember(cmd) => seed_member(config, cmd).await,
    }
}

async fn seed_user(config: &ServerConfig, cmd: SeedUserCommand) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("database_url must be configured to seed users"))?;

    let pool = connect(database_url).await?;
    let account = NewAccount {
        server_id: &cmd.server_id,
        localpart: &cmd.username,
        password: &cmd.password,
        display_name: cmd.display_name.as_deref(),
        avatar_url: cmd.avatar_url.as_deref(),
    };
    match AccountRepository::create_account(pool.pool(), account).await {
        Ok(user_id) => {
            println!(
                "Seeded user '{}' on '{}' with id {}",
                cmd.username, cmd.server_id, user_id
            );
            Ok(())
        }
        Err(CreateAccountError::LocalpartTaken) => {
            println!(
                "User '{}' already exists on '{}'; skipping",
                cmd.username, cmd.server_id
            );
            Ok(())
        }
        Err(CreateAccountError::Other(err)) => Err(err),
    }
}

async fn seed_member(config: &ServerConfig, cmd: SeedMemberCommand) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("database_url must be configured to seed members"))?;

    let pool = connect(database_url).await?;
    let repo = RoomRepository::new(pool);
    if repo.find_room(&cmd.room_id).await?.is_none() {
        anyhow::bail!("room '{}' not found", cmd.room_id);
    }

    let member = MemberRow {
        room_id: cmd.room_id.clone(),
        localpart: cmd.username.clone(),
        server_id: cmd.server_id.clone(),
        state: MembershipState::Join.as_str().to_string(),
        reason: None,
    };
    repo.save_member(&member).await?;
    println!(
        "Seeded member '{}' into '{}' on '{}'",
        cmd.username, cmd.room_id, cmd.server_id
    );
    Ok(())
}

async fn run(config: Arc<ServerConfig>) -> Result<()> {
    init_tracing(&config);

    info!(
        bind_addr = ?config.bind_addr,
        host = %config.host,
        server_name = %config.server_name,
        port = config.port,
        log_format = ?config.log_format,
        database_url_configured = config.database_url.is_some(),
        "resolved server configuration"
    );

    let storage = match config.database_url.as_deref() {
        Some(url) => match connect(url).await {
            Ok(pool) => {
                info!("database connection established");
                StorageState::connected_with_pool(pool)
            }
            Err(err) => {
                error!(?err, "failed to establish database connection");
                StorageState::error(err.to_string())
            }
        },
        None => {
            info!("no database configured; accounts and rooms live in memory");
            StorageState::unconfigured()
        }
    };

    let state = AppState::new(config.clone(), storage);
    let app = build_app(state);

    let addr: SocketAddr = config.listener_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    config: Arc<ServerConfig>,
    storage: StorageState,
    sessions: Arc<SessionService>,
    rooms: Arc<RoomService>,
}

impl AppState {
    fn new(config: Arc<ServerConfig>, storage: StorageState) -> Self {
        let (accounts, tokens, room_store): (
            Arc<dyn AccountStore>,
            Arc<dyn TokenStore>,
            Arc<dyn RoomStore>,
        ) = match storage.pool() {
            Some(pool) => (
                Arc::new(DatabaseAccountStore::new(pool.clone())),
                Arc::new(DatabaseTokenStore::new(pool.clone())),
                Arc::new(DatabaseRoomStore::new(pool)),
            ),
            None => {
                let store = Arc::new(MemoryStore::new());
                (store.clone(), store.clone(), store)
            }
        };

        Self::with_stores(config, storage, accounts, tokens, room_store)
    }

    fn with_stores(
        config: Arc<ServerConfig>,
        storage: StorageState,
        accounts: Arc<dyn AccountStore>,
        tokens: Arc<dyn TokenStore>,
        room_store: Arc<dyn RoomStore>,
    ) -> Self {
        let sessions = Arc::new(SessionService::new(accounts.clone(), tokens));
        let rooms = Arc::new(RoomService::new(room_store, accounts));
        Self {
            started_at: Instant::now(),
            config,
            storage,
            sessions,
            rooms,
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn database_component(&self) -> ComponentStatus {
        self.storage.component()
    }
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    uptime_seconds: u64,
    components: Vec<ComponentStatus>,
}

#[derive(Serialize)]
struct ComponentStatus {
    name: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

async fn readiness(State(state): State<AppState>) -> Json<ReadinessResponse> {
    let components = vec![state.database_component()];
    let status = state.storage.readiness_status();

    Json(ReadinessResponse {
        status,
        uptime_seconds: state.uptime_seconds(),
        components,
    })
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn unrecognized() -> ApiError {
    ApiError::Unrecognized
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

fn build_app(state: AppState) -> Router {
    let client_r0_routes = Router::new()
        .route("/login", post(session::login))
        .route("/refresh", post(session::refresh))
        .route("/createRoom", post(rooms::create_room))
        .route("/rooms/{room_id}/kick", post(rooms::kick))
        .route("/rooms/{room_id}/state/{event_type}", put(rooms::update_state))
        // Some clients send the state path with a trailing slash.
        .route("/rooms/{room_id}/state/{event_type}/", put(rooms::update_state))
        .route("/rooms/{room_id}/joined_members", get(rooms::joined_members))
        // No inner fallback: axum cannot nest a router with a fallback under a
        // parameterised prefix; unmatched paths fall through to the outer
        // `unrecognized` fallback, which is the same handler.
        .method_not_allowed_fallback(method_not_allowed);

    let router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/version", get(version))
        .nest("/{server_id}/_matrix/client/r0", client_r0_routes)
        .fallback(unrecognized)
        .method_not_allowed_fallback(method_not_allowed);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(HttpSpanMaker)
        .on_response(HttpOnResponse::new());

    let instrumentation_layers = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static(REFERRER_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static(X_CONTENT_TYPE_OPTIONS),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static(X_FRAME_OPTIONS),
        ))
        .layer(PropagateHeaderLayer::new(request_id_header.clone()))
        .layer(trace_layer)
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .into_inner();

    router.layer(instrumentation_layers).with_state(state)
}

#[derive(Clone, Default)]
struct HttpSpanMaker;

impl<B> tower_http::trace::MakeSpan<B> for HttpSpanMaker
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let method = request.method().clone();
        let uri_path = request.uri().path().to_string();
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_string())
            .unwrap_or_else(|| uri_path.clone());
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .and_then(|rid| rid.header_value().to_str().ok())
            .map(|value| value.to_owned())
            .unwrap_or_else(|| "unknown".to_string());

        tracing::info_span!(
            "http.request",
            method = %method,
            route = %route,
            request_id = %request_id,
            status_code = tracing::field::Empty,
            latency_ms = tracing::field::Empty
        )
    }
}

#[derive(Clone, Default)]
struct HttpOnResponse;

impl HttpOnResponse {
    fn new() -> Self {
        Self
    }
}

impl<B> tower_http::trace::OnResponse<B> for HttpOnResponse
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn on_response(
        self,
        response: &axum::http::Response<B>,
        latency: Duration,
        span: &tracing::Span,
    ) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let status = response.status().as_u16();
        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("unknown");

        span.record("status_code", tracing::field::display(status));
        span.record("latency_ms", tracing::field::display(latency_ms));

        tracing::debug!(
            parent: span,
            request_id = %request_id,
            status = status,
            latency_ms,
            "request completed"
        );
    }
}

fn init_tracing(config: &ServerConfig) {
    // Respect RUST_LOG if set, otherwise default to info for our crates.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,synmock_server=info,synmock=info"));

    let json = matches!(config.log_format(), LogFormat::Json);
    let subscriber = build_subscriber(json, env_filter);

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

fn build_subscriber(
    json: bool,
    env_filter: EnvFilter,
) -> Box<dyn tracing::Subscriber + Send + Sync> {
    if json {
        Box::new(
            tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            ),
        )
    } else {
        Box::new(
            tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            ),
        )
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(?e, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received");
}
