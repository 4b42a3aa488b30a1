use axum::{
    extract::{Path as UrlPath, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::jobs::types::{Job, JobType, TranscribeParams, TranslateConfig, TranslateParams};
use crate::web::{resolve_media_path, ApiError, AppState};

/// GET /api/jobs
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.queue.store().list().await?))
}

/// GET /api/jobs/active
pub async fn list_active(State(state): State<AppState>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.queue.store().list_active().await?))
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Job>, ApiError> {
    let id = parse_job_id(&id)?;
    let job = state
        .queue
        .store()
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown job: {}", id)))?;
    Ok(Json(job))
}

/// DELETE /api/jobs/{id} — cancel a pending or running job.
pub async fn cancel(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_job_id(&id)?;
    state
        .queue
        .store()
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown job: {}", id)))?;

    let cancelled = state.queue.cancel_job(id).await?;
    Ok(Json(serde_json::json!({ "id": id, "cancelled": cancelled })))
}

/// POST /api/jobs/{id}/retry
pub async fn retry(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Job>, ApiError> {
    let id = parse_job_id(&id)?;
    Ok(Json(state.queue.retry_job(id).await?))
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid job id: {}", raw)))
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateRequest {
    #[serde(flatten)]
    params: TranscribeParams,
}

/// POST /api/subtitle/generate/{path}
pub async fn generate(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
    body: Option<Json<GenerateRequest>>,
) -> Result<Json<Job>, ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    enqueue_generate(&state, &path, request.params).await.map(Json)
}

async fn enqueue_generate(
    state: &AppState,
    path: &str,
    params: TranscribeParams,
) -> Result<Job, ApiError> {
    let media_path = resolve_media_path(&state.config.media_root, path)?;
    if !media_path.exists() {
        return Err(ApiError::NotFound(format!("not found: {}", path)));
    }

    let params_value = serde_json::to_value(&params)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let job = state
        .queue
        .enqueue(
            JobType::Transcribe,
            media_path.to_string_lossy().into_owned(),
            params_value,
        )
        .await?;
    Ok(job)
}

#[derive(Debug, Deserialize)]
pub struct TranslateRequest {
    #[serde(flatten)]
    config: TranslateConfig,
}

/// POST /api/subtitle/translate/{path} — path names the source subtitle.
pub async fn translate(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
    Json(request): Json<TranslateRequest>,
) -> Result<Json<Job>, ApiError> {
    enqueue_translate(&state, &path, request.config).await.map(Json)
}

async fn enqueue_translate(
    state: &AppState,
    path: &str,
    config: TranslateConfig,
) -> Result<Job, ApiError> {
    let subtitle_path = resolve_media_path(&state.config.media_root, path)?;
    if !subtitle_path.exists() {
        return Err(ApiError::NotFound(format!("not found: {}", path)));
    }

    let params = TranslateParams {
        source: subtitle_path.to_string_lossy().into_owned(),
        config,
    };
    let params_value = serde_json::to_value(&params)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let job = state
        .queue
        .enqueue(
            JobType::Translate,
            subtitle_path.to_string_lossy().into_owned(),
            params_value,
        )
        .await?;
    Ok(job)
}

#[derive(Debug, Deserialize)]
pub struct BatchGenerateRequest {
    files: Vec<String>,
    #[serde(flatten)]
    params: TranscribeParams,
}

/// POST /api/subtitle/batch-generate — one transcribe job per file.
pub async fn batch_generate(
    State(state): State<AppState>,
    Json(request): Json<BatchGenerateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    batch_enqueue_generate(state, request).await
}

/// POST /api/subtitle/batch-generate-translate — transcribe jobs whose
/// completions chain translation jobs. The translate config is required.
pub async fn batch_generate_translate(
    State(state): State<AppState>,
    Json(request): Json<BatchGenerateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.params.translate.is_none() {
        return Err(ApiError::BadRequest(
            "translate config is required for generate-translate".to_string(),
        ));
    }
    batch_enqueue_generate(state, request).await
}

async fn batch_enqueue_generate(
    state: AppState,
    request: BatchGenerateRequest,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut jobs = Vec::new();
    let mut errors = Vec::new();

    for file in &request.files {
        match enqueue_generate(&state, file, request.params.clone()).await {
            Ok(job) => jobs.push(serde_json::json!({ "file": file, "job_id": job.id })),
            Err(e) => errors.push(serde_json::json!({
                "file": file,
                "error": format!("{:?}", e),
            })),
        }
    }

    Ok(Json(serde_json::json!({ "jobs": jobs, "errors": errors })))
}

#[derive(Debug, Deserialize)]
pub struct BatchTranslateRequest {
    files: Vec<String>,
    #[serde(flatten)]
    config: TranslateConfig,
}

/// POST /api/subtitle/batch-translate — one translate job per subtitle.
pub async fn batch_translate(
    State(state): State<AppState>,
    Json(request): Json<BatchTranslateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut jobs = Vec::new();
    let mut errors = Vec::new();

    for file in &request.files {
        match enqueue_translate(&state, file, request.config.clone()).await {
            Ok(job) => jobs.push(serde_json::json!({ "file": file, "job_id": job.id })),
            Err(e) => errors.push(serde_json::json!({
                "file": file,
                "error": format!("{:?}", e),
            })),
        }
    }

    Ok(Json(serde_json::json!({ "jobs": jobs, "errors": errors })))
}
