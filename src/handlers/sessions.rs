use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Diagnostic snapshots of the calls currently being bridged.
pub async fn list_sessions(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let sessions = state.session_snapshots();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "max_concurrent_sessions": state.get_config().performance.max_concurrent_sessions,
        "sessions": sessions
    })))
}

/// One call by session id.
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    state
        .session_snapshots()
        .into_iter()
        .find(|s| s.session_id == session_id)
        .map(|snapshot| HttpResponse::Ok().json(snapshot))
        .ok_or_else(|| AppError::NotFound(format!("No active session '{}'", session_id)))
}
