//! WebSocket upgrade endpoint.
//!
//! The bearer token arrives as a `token` query parameter on the upgrade
//! request (an `Authorization` header is also accepted); an invalid or
//! expired token is rejected with 401 before the upgrade happens.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chat_protocol::MAX_FRAME_BYTES;
use serde::Deserialize;
use tracing::warn;

use crate::auth::{self, extract_bearer};
use crate::error::HubError;
use crate::session::{self, HANDSHAKE_TIMEOUT};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let token = query.token.or_else(|| {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(extract_bearer)
            .map(ToOwned::to_owned)
    });
    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };

    let identity = match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        auth::authenticate(&state.pool, &state.config.auth_secret, &token),
    )
    .await
    {
        Ok(Ok(identity)) => identity,
        Ok(Err(HubError::Auth(reason))) => {
            warn!(reason = %reason, "rejecting upgrade: invalid token");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
        Ok(Err(e)) => {
            warn!(error = %e, "rejecting upgrade: auth backend unavailable");
            return (StatusCode::SERVICE_UNAVAILABLE, "try again").into_response();
        }
        Err(_) => {
            warn!("rejecting upgrade: handshake timed out");
            return (StatusCode::UNAUTHORIZED, "handshake timeout").into_response();
        }
    };

    let hub = state.hub.clone();
    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| session::run(socket, hub, identity))
}
