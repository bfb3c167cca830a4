//! API routes

use axum::{routing::post, Router};

use crate::AppState;

mod sessions;

/// Build the API router with all endpoints
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/start", post(sessions::start_session))
        .nest("/sessions", sessions::router())
}
