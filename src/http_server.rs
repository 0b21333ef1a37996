//! HTTP server implementation using Axum.

use crate::error::Error;
use crate::instance::InstanceStatus;
use crate::state::{AppState, ChallengeInfo};
use axum::{
    extract::{ConnectInfo, State},
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Deserialize)]
struct CreateInstanceRequest {
    #[serde(default)]
    captcha_response: String,
}

#[derive(Serialize)]
struct InstanceView {
    #[serde(flatten)]
    status: InstanceStatus,
    host: String,
    countdown: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl InstanceView {
    fn new(status: InstanceStatus, challenge: &ChallengeInfo) -> Self {
        Self {
            countdown: status.countdown(),
            host: challenge.host.clone(),
            status,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Build the router. Handlers need the peer address, so serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/instance",
            get(get_instance).post(create_instance).delete(delete_instance),
        )
        .route("/challenge", get(challenge))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server until `shutdown` resolves.
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(state);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn health() -> &'static str {
    "OK"
}

async fn challenge(State(state): State<AppState>) -> Json<ChallengeInfo> {
    Json(state.challenge.as_ref().clone())
}

async fn get_instance(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<InstanceView>, Error> {
    let client = state
        .identifier
        .identify(&headers, peer)
        .ok_or_else(|| Error::not_found("anonymous"))?;
    let status = state.manager.query(&client).await?;
    Ok(Json(InstanceView::new(status, &state.challenge)))
}

async fn create_instance(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<Response, Error> {
    let identity = state
        .identifier
        .identify_or_mint(&headers, peer)
        .ok_or_else(|| Error::Verification("request carries no client identity".into()))?;

    // Existing clients go straight to their instance without a new challenge.
    if state.manager.query(&identity.key).await.is_ok() {
        return Err(Error::already_exists(identity.key));
    }

    let remote_ip = state.identifier.client_address(&headers, peer);
    state
        .verifier
        .verify(&req.captcha_response, Some(&remote_ip))
        .await?;

    let record = state.manager.create(&identity.key).await?;
    info!(client = %identity.key, port = record.port, "POST /instance - created");

    let status = state.manager.query(&identity.key).await?;
    let mut response = (
        StatusCode::CREATED,
        Json(InstanceView::new(status, &state.challenge)),
    )
        .into_response();
    if let Some(cookie) = identity.set_cookie {
        let value = HeaderValue::from_str(&cookie)
            .map_err(|e| Error::Config(format!("session cookie: {}", e)))?;
        response.headers_mut().insert(SET_COOKIE, value);
    }
    Ok(response)
}

async fn delete_instance(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<StatusCode, Error> {
    let client = state
        .identifier
        .identify(&headers, peer)
        .ok_or_else(|| Error::not_found("anonymous"))?;
    state.manager.delete(&client).await?;
    info!(client = %client, "DELETE /instance");
    Ok(StatusCode::NO_CONTENT)
}
