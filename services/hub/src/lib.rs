pub mod auth;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod hub;
pub mod presence;
pub mod repo;
pub mod router;
pub mod session;
pub mod state;
pub mod status;
pub mod worker;
pub mod ws;

pub use hub::{Hub, HubDeps, HubHandle};
pub use state::AppState;

use axum::{routing::get, Router};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
