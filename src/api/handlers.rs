//! Endpoint handlers. Thin: parse, delegate to the pipeline and
//! repositories, map errors.

use std::time::Duration;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use uuid::Uuid;

use crate::auth;
use crate::db;
use crate::pipeline::SourceFile;
use crate::storage;

use super::error::ApiError;
use super::types::{
    ApiKeyResponse, AppContext, HealthResponse, IngestResponse, ListQuery, NotesRequest,
    NotesResponse, RerunResponse, SubmissionDto, SummaryResponse,
};

const MAX_FILES_PER_INGEST: usize = 8;
const DEFAULT_LIST_LIMIT: usize = 15;
const MAX_LIST_LIMIT: usize = 100;

/// Public health probe.
pub async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "online",
        version: env!("CARGO_PKG_VERSION"),
        model: ctx.config().llm_model.clone(),
    })
}

/// Provision a new frontend API key.
pub async fn register(State(ctx): State<AppContext>) -> Result<Json<ApiKeyResponse>, ApiError> {
    let record = ctx.with_db(auth::register_key)?;
    Ok(Json(ApiKeyResponse {
        key: record.key,
        name: record.name,
        role: record.role,
        created_at: record.created_at,
    }))
}

/// Multipart ingest: `patient_id` + 1..=8 `files[]` entries.
pub async fn ingest(
    State(ctx): State<AppContext>,
    mut multipart: Multipart,
) -> Result<Json<IngestResponse>, ApiError> {
    let mut patient_id: Option<String> = None;
    let mut files: Vec<SourceFile> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "patient_id" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("unreadable patient_id: {e}")))?;
                patient_id = Some(text.trim().to_string());
            }
            "files" | "files[]" | "file" => {
                if files.len() >= MAX_FILES_PER_INGEST {
                    return Err(ApiError::BadRequest(format!(
                        "at most {MAX_FILES_PER_INGEST} files per ingest"
                    )));
                }
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| "upload".to_string());
                let mime = field
                    .content_type()
                    .map(str::to_string)
                    .unwrap_or_else(|| storage::mime_for_filename(&filename).to_string());
                if !storage::is_supported_mime(&mime) {
                    return Err(ApiError::BadRequest(format!(
                        "file {filename} has unsupported type {mime}"
                    )));
                }
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|_| ApiError::PayloadTooLarge)?;
                if bytes.len() > ctx.config().max_upload_bytes {
                    return Err(ApiError::PayloadTooLarge);
                }
                if bytes.is_empty() {
                    return Err(ApiError::BadRequest(format!("file {filename} is empty")));
                }
                files.push(SourceFile {
                    filename,
                    mime,
                    bytes: bytes.to_vec(),
                });
            }
            _ => {}
        }
    }

    let patient_id = patient_id
        .filter(|p| p.len() >= 3)
        .ok_or_else(|| ApiError::BadRequest("patient_id must be at least 3 characters".into()))?;
    if files.is_empty() {
        return Err(ApiError::BadRequest("at least one file is required".into()));
    }

    let submission_id = Uuid::new_v4();
    let mut stored_relative: Vec<String> = Vec::with_capacity(files.len());
    for (index, file) in files.iter().enumerate() {
        let stored = ctx
            .files()
            .store(&submission_id, index, &file.filename, &file.bytes)
            .map_err(|e| ApiError::Storage(e.to_string()))?;
        stored_relative.push(stored.relative);
    }
    let image_url = stored_relative
        .first()
        .map(|rel| format!("/api/v1/files/{rel}"));

    let outcome = {
        let _permit = ctx.acquire_llm_slot().await?;
        let deadline = Duration::from_millis(ctx.config().request_deadline_ms);
        tokio::time::timeout(deadline, ctx.pipeline().ingest(&patient_id, &files))
            .await
            .map_err(|_| {
                tracing::warn!(%submission_id, "Ingest deadline exceeded");
                ApiError::UpstreamUnavailable { retry_after: 30 }
            })?
    };

    let record = db::SubmissionRecord {
        id: submission_id,
        patient_id: patient_id.clone(),
        filename: files
            .iter()
            .map(|f| f.filename.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        image_url,
        status: outcome.status,
        fhir_bundle: outcome.bundle.clone(),
        raw_extraction: outcome.raw_extraction,
        doctor_notes: String::new(),
        ai_summary: String::new(),
        created_at: Utc::now(),
    };
    ctx.with_db(|conn| db::insert_submission(conn, &record))?;

    Ok(Json(IngestResponse {
        submission_id,
        patient_id,
        status: outcome.status,
        db_persisted: true,
        fhir_bundle: outcome.bundle,
    }))
}

pub async fn list_submissions(
    State(ctx): State<AppContext>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SubmissionDto>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(MAX_LIST_LIMIT);
    let records = ctx.with_db(|conn| db::list_recent(conn, limit))?;
    Ok(Json(records.into_iter().map(SubmissionDto::from).collect()))
}

pub async fn list_patients(
    State(ctx): State<AppContext>,
) -> Result<Json<Vec<db::PatientSummary>>, ApiError> {
    Ok(Json(ctx.with_db(db::list_patients)?))
}

pub async fn patient_history(
    State(ctx): State<AppContext>,
    Path(patient_id): Path<String>,
) -> Result<Json<Vec<SubmissionDto>>, ApiError> {
    let records = ctx.with_db(|conn| db::patient_history(conn, &patient_id))?;
    Ok(Json(records.into_iter().map(SubmissionDto::from).collect()))
}

/// Re-process a stored submission; serialized per submission id.
pub async fn rerun(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<RerunResponse>, ApiError> {
    let id = parse_submission_id(&id)?;
    let _guard = ctx
        .try_lock_rerun(id)
        .ok_or_else(|| ApiError::Busy(format!("rerun already in progress for {id}")))?;

    let record = ctx
        .with_db(|conn| db::get_submission(conn, &id))?
        .ok_or_else(|| ApiError::NotFound(format!("submission {id} not found")))?;
    let files = ctx.files().read_submission_files(&id).map_err(|_| {
        ApiError::NotFound("original document files are no longer on disk".into())
    })?;

    let outcome = {
        let _permit = ctx.acquire_llm_slot().await?;
        let deadline = Duration::from_millis(ctx.config().request_deadline_ms);
        tokio::time::timeout(deadline, ctx.pipeline().ingest(&record.patient_id, &files))
            .await
            .map_err(|_| ApiError::UpstreamUnavailable { retry_after: 30 })?
    };

    let updated = ctx.with_db(|conn| {
        db::apply_rerun(conn, &id, &outcome.bundle, &outcome.raw_extraction, outcome.status)
    })?;
    if !updated {
        return Err(ApiError::NotFound(format!("submission {id} not found")));
    }

    Ok(Json(RerunResponse {
        submission_id: id,
        status: "re-processed",
        fhir_bundle: outcome.bundle,
    }))
}

pub async fn save_notes(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(request): Json<NotesRequest>,
) -> Result<Json<NotesResponse>, ApiError> {
    let id = parse_submission_id(&id)?;
    let updated = ctx.with_db(|conn| db::update_doctor_notes(conn, &id, &request.notes))?;
    if !updated {
        return Err(ApiError::NotFound(format!("submission {id} not found")));
    }
    Ok(Json(NotesResponse {
        status: "success",
        submission_id: id,
    }))
}

/// Generate (and persist) a fresh clinical summary for a submission.
pub async fn ai_summary(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<SummaryResponse>, ApiError> {
    let id = parse_submission_id(&id)?;
    let record = ctx
        .with_db(|conn| db::get_submission(conn, &id))?
        .ok_or_else(|| ApiError::NotFound(format!("submission {id} not found")))?;

    let summary = {
        let _permit = ctx.acquire_llm_slot().await?;
        ctx.pipeline()
            .synthesize(&record.fhir_bundle, &record.doctor_notes)
            .await?
    };
    if summary.is_empty() {
        return Err(ApiError::UpstreamUnavailable { retry_after: 30 });
    }

    ctx.with_db(|conn| db::update_ai_summary(conn, &id, &summary))?;
    Ok(Json(SummaryResponse {
        submission_id: id,
        summary,
    }))
}

/// Serve a stored original. Path traversal is rejected by the store.
pub async fn serve_file(
    State(ctx): State<AppContext>,
    Path(relative): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let path = ctx.files().resolve(&relative)?;
    let bytes = tokio::fs::read(&path).await.map_err(|_| {
        ApiError::NotFound("file not found".into())
    })?;
    let mime = storage::mime_for_filename(&relative);
    Ok(([(header::CONTENT_TYPE, mime)], bytes))
}

fn parse_submission_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::NotFound(format!("submission {raw} not found")))
}
