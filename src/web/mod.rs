pub mod jobs;
pub mod stream;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::encoder::capabilities::HwCapabilities;
use crate::error::{JobError, ProbeError, StreamError};
use crate::hls::manager::SessionManager;
use crate::jobs::queue::JobQueue;
use crate::media::probe::ProbeCache;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub caps: Arc<HwCapabilities>,
    pub probe_cache: Arc<ProbeCache>,
    pub sessions: Arc<SessionManager>,
    pub queue: Arc<JobQueue>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/stream/capabilities", get(stream::capabilities))
        .route("/api/stream/presets/*path", get(stream::presets))
        .route("/api/stream/hls/*path", get(stream::hls))
        .route("/api/stream/heartbeat/:session", post(stream::heartbeat))
        .route("/api/stream/pause/:session", post(stream::pause))
        .route("/api/stream/resume/:session", post(stream::resume))
        .route("/api/stream/session/:session", delete(stream::stop_session))
        .route("/api/stream/sessions", get(stream::list_sessions))
        .route("/api/stream/direct/*path", get(stream::direct))
        .route("/api/jobs", get(jobs::list))
        .route("/api/jobs/active", get(jobs::list_active))
        .route("/api/jobs/:id", get(jobs::get_job).delete(jobs::cancel))
        .route("/api/jobs/:id/retry", post(jobs::retry))
        .route("/api/subtitle/generate/*path", post(jobs::generate))
        .route("/api/subtitle/translate/*path", post(jobs::translate))
        .route("/api/subtitle/batch-generate", post(jobs::batch_generate))
        .route("/api/subtitle/batch-translate", post(jobs::batch_translate))
        .route(
            "/api/subtitle/batch-generate-translate",
            post(jobs::batch_generate_translate),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", state.config.http_port);
    let sessions = state.sessions.clone();
    let app = router(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down, stopping sessions");
            sessions.shutdown().await;
        })
        .await?;

    Ok(())
}

/// API error with its HTTP mapping.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unprocessable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            Self::Internal(m) => {
                tracing::error!(error = %m, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<ProbeError> for ApiError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::NotFound(path) => Self::NotFound(format!("not found: {}", path.display())),
            ProbeError::Unreadable(m) => Self::Unprocessable(format!("unreadable media: {}", m)),
            ProbeError::Probe(e) => Self::Internal(format!("probe failed: {}", e)),
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::SessionNotFound(id) => Self::NotFound(format!("unknown session: {}", id)),
            StreamError::InvalidParam(m) => Self::BadRequest(m),
            StreamError::Probe(p) => p.into(),
            StreamError::EncoderStartup(m) => Self::Internal(m),
            StreamError::Io(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(id) => Self::NotFound(format!("unknown job: {}", id)),
            JobError::InvalidState { id, status, expected } => Self::BadRequest(format!(
                "job {} is {}, expected {}",
                id, status, expected
            )),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Resolve a client path against the media root. Only plain relative
/// components are allowed; anything that could escape the root is rejected.
pub fn resolve_media_path(root: &Path, relative: &str) -> Result<PathBuf, ApiError> {
    let candidate = Path::new(relative);
    for component in candidate.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(ApiError::BadRequest(format!(
                    "invalid media path: {}",
                    relative
                )))
            }
        }
    }
    Ok(root.join(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_traversal() {
        let root = Path::new("/srv/media");
        assert!(resolve_media_path(root, "shows/ep1.mkv").is_ok());
        assert!(resolve_media_path(root, "../etc/passwd").is_err());
        assert!(resolve_media_path(root, "/etc/passwd").is_err());
        assert!(resolve_media_path(root, "a/../../b").is_err());
    }

    #[test]
    fn test_resolve_joins_root() {
        let root = Path::new("/srv/media");
        assert_eq!(
            resolve_media_path(root, "shows/ep1.mkv").unwrap(),
            PathBuf::from("/srv/media/shows/ep1.mkv")
        );
    }
}
