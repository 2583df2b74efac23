use axum::{
    Json,
    extract::{Query, State},
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::AppState;
use crate::error::FileServerError;
use crate::preview::{FilePreview, PreviewQuery, preview_file};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/health - Readiness probe target
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// GET /api/files/preview - Read the first lines of a file inside a scope
pub async fn preview(
    State(state): State<AppState>,
    Query(query): Query<PreviewQuery>,
) -> Result<Json<FilePreview>, FileServerError> {
    debug!("Preview request: path={:?} base={:?}", query.path, query.base);

    match preview_file(&state, &query).await {
        Ok(preview) => Ok(Json(preview)),
        Err(e) => {
            if e.is_sandbox_violation() {
                warn!("Denied preview of {:?}: {}", query.path, e);
            }
            Err(e)
        }
    }
}
