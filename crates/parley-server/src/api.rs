use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::Method,
    middleware,
    routing::get,
    Json, Router,
};
use parley_shared::constants::PROTOCOL_VERSION;
use parley_shared::protocol::{UserInfo, UserSummary};
use parley_shared::Address;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::service::{RelayLimits, RelayService};
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayService>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            relay: Arc::new(RelayService::new(RelayLimits::from(&config))),
            rate_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/users/:address", get(get_user))
        .route("/usernames/:username", get(lookup_username))
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    online_users: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        online_users: state.relay.online_count().await,
    })
}

async fn get_user(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<UserInfo>, ServerError> {
    let address = Address::new(address);
    state
        .relay
        .get_user(&address)
        .await
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("No user registered as {address}")))
}

async fn lookup_username(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<UserSummary>, ServerError> {
    state
        .relay
        .lookup_by_username(&username)
        .await
        .map(Json)
        .ok_or_else(|| ServerError::NotFound(format!("Username {username} is not taken")))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting relay HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
