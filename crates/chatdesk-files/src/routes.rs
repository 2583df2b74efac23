use axum::{Router, routing::get};

use crate::AppState;
use crate::handlers;

/// Routes served to the desktop UI.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/files/preview", get(handlers::preview))
}
