use crate::api::auth::{require_bearer, upload_auth, CallerIdentity};
use crate::api::{
    bad_request, internal_error, load_owned_bucket, not_found, ApiError, AppState,
};
use crate::events::ChunkCompleteMessage;
use crate::meta::models::{UploadSession, UploadStatus};
use crate::util::paths::{chunk_key, normalize_custom_path};
use axum::body::to_bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

/// Chunk bodies stay within the maximum chunk size; the buffer limit
/// leaves room for multipart framing.
const CHUNK_BODY_LIMIT: usize = 32 * 1024 * 1024;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/buckets/{id}/chunked/", get(list_sessions))
        .route("/buckets/{id}/chunked/init", post(init_upload))
        .route("/buckets/{id}/chunked/chunk", post(upload_chunk))
        .route("/buckets/{id}/chunked/complete", post(complete_upload))
        .route("/buckets/{id}/chunked/{upload_id}/status", get(upload_status))
        .route(
            "/buckets/{id}/chunked/{upload_id}/progress",
            get(upload_progress),
        )
        .route("/buckets/{id}/chunked/{upload_id}", delete(abort_upload))
        .layer(DefaultBodyLimit::max(CHUNK_BODY_LIMIT))
        .route_layer(from_fn_with_state(state, upload_auth))
}

#[derive(Debug, Deserialize)]
struct InitUploadRequest {
    file_name: String,
    file_size: i64,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    preferred_chunk_size: i64,
}

#[derive(Debug, Deserialize)]
struct CompleteUploadRequest {
    upload_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkParams {
    upload_id: Option<String>,
    chunk_index: Option<String>,
}

/// The server owns the chunk-size decision: a client preference is used
/// only when it falls inside [default, max].
fn negotiate_chunk_size(preferred: i64, default_size: i64, max_size: i64) -> i64 {
    if preferred <= 0 || preferred < default_size {
        return default_size;
    }
    if preferred > max_size {
        return max_size;
    }
    preferred
}

fn total_chunks_for(file_size: i64, chunk_size: i64) -> i32 {
    ((file_size + chunk_size - 1) / chunk_size) as i32
}

fn session_is_active(session: &UploadSession) -> Result<(), ApiError> {
    match session.parsed_status() {
        Some(status) if status.is_active() => {}
        _ => {
            return Err(bad_request(&format!(
                "Upload session is not active, current status: {}",
                session.status
            )))
        }
    }
    if session.is_expired_at(Utc::now()) {
        return Err(bad_request("Upload session has expired"));
    }
    Ok(())
}

/// Contract negotiation: validates the size is chunked-worthy, fixes the
/// authoritative chunk size, provisions the temp prefix, and returns the
/// contract the client must honor.
async fn init_upload(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(bucket_id): Path<Uuid>,
    Json(req): Json<InitUploadRequest>,
) -> Result<Json<Value>, ApiError> {
    require_bearer(&caller)?;
    load_owned_bucket(&state, bucket_id, caller.user_id).await?;

    let threshold = state.config.large_file_threshold;
    if req.file_size <= threshold {
        return Err(bad_request(&format!(
            "File size is below threshold ({threshold} bytes). Use regular upload endpoint."
        )));
    }

    let chunk_size = negotiate_chunk_size(
        req.preferred_chunk_size,
        state.config.default_chunk_size,
        state.config.max_chunk_size,
    );
    let total_chunks = total_chunks_for(req.file_size, chunk_size);

    let custom_path = normalize_custom_path(&req.path)
        .map_err(|err| bad_request(&format!("Invalid path: {err}")))?;
    let content_type = if req.content_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        req.content_type.clone()
    };

    let temp_bucket = state.config.temp_bucket.clone();
    state.store.ensure_bucket(&temp_bucket).await.map_err(|err| {
        tracing::error!(error = %err, "temp bucket provisioning failed");
        internal_error("Failed to prepare upload storage")
    })?;

    let upload_id = Uuid::new_v4();
    let now = Utc::now();
    let session = UploadSession {
        id: upload_id,
        bucket_id,
        user_id: caller.user_id,
        file_name: req.file_name.clone(),
        file_size: req.file_size,
        content_type,
        custom_path,
        chunk_size,
        total_chunks,
        uploaded_chunks: 0,
        status: UploadStatus::Init.as_str().to_string(),
        temp_bucket,
        temp_prefix: format!("pending/{upload_id}/"),
        file_hash: None,
        created_at: now,
        updated_at: now,
        expires_at: now + Duration::hours(state.config.session_ttl_hours),
    };
    state.repo.create_upload_session(&session).await.map_err(|err| {
        tracing::error!(error = %err, "upload session insert failed");
        internal_error("Failed to initialize upload session")
    })?;

    tracing::info!(
        upload_id = %upload_id,
        file = %req.file_name,
        size = req.file_size,
        total_chunks,
        chunk_size,
        "upload session initialized"
    );
    Ok(Json(json!({
        "upload_id": upload_id,
        "chunk_size": chunk_size,
        "total_chunks": total_chunks,
        "temp_prefix": session.temp_prefix,
        "expires_at": session.expires_at.to_rfc3339(),
    })))
}

/// Chunk admission: index-addressed, idempotent per key, counted towards
/// progress. The body arrives as multipart field `chunk` or as the raw
/// request body with an explicit Content-Length.
async fn upload_chunk(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(bucket_id): Path<Uuid>,
    Query(params): Query<ChunkParams>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    load_owned_bucket(&state, bucket_id, caller.user_id).await?;

    let upload_id = chunk_param(&params.upload_id, &request, "x-upload-id")
        .ok_or_else(|| bad_request("upload_id is required"))?;
    let upload_id =
        Uuid::parse_str(&upload_id).map_err(|_| bad_request("Invalid upload_id format"))?;
    let chunk_index = chunk_param(&params.chunk_index, &request, "x-chunk-index")
        .and_then(|raw| raw.parse::<i32>().ok())
        .ok_or_else(|| bad_request("Invalid chunk_index"))?;

    let session = load_session(&state, upload_id, bucket_id).await?;
    session_is_active(&session)?;
    if chunk_index < 0 || chunk_index >= session.total_chunks {
        return Err(bad_request(&format!(
            "Invalid chunk_index: must be between 0 and {}",
            session.total_chunks - 1
        )));
    }

    let bytes = read_chunk_body(&state, request).await?;
    if bytes.len() as i64 > state.config.max_chunk_size {
        return Err(bad_request(&format!(
            "Chunk size {} exceeds maximum allowed {}",
            bytes.len(),
            state.config.max_chunk_size
        )));
    }

    let key = chunk_key(&session.temp_prefix, chunk_index);
    tracing::info!(
        upload_id = %upload_id,
        chunk = chunk_index + 1,
        total = session.total_chunks,
        size = bytes.len(),
        "writing chunk"
    );
    if let Err(err) = state
        .store
        .put_object(&session.temp_bucket, &key, bytes, "application/octet-stream")
        .await
    {
        state.metrics.chunk_writes.with_label_values(&["error"]).inc();
        tracing::error!(upload_id = %upload_id, chunk_index, error = %err, "chunk write failed");
        return Err(internal_error("Failed to upload chunk"));
    }
    state.metrics.chunk_writes.with_label_values(&["ok"]).inc();

    if let Err(err) = state.repo.increment_uploaded_chunks(upload_id).await {
        tracing::warn!(upload_id = %upload_id, error = %err, "progress update failed");
    }
    let uploaded_chunks = state
        .repo
        .get_upload_session(upload_id, bucket_id)
        .await
        .ok()
        .flatten()
        .map(|updated| updated.uploaded_chunks)
        .unwrap_or(session.uploaded_chunks);

    Ok(Json(json!({
        "chunk_index": chunk_index,
        "uploaded_chunks": uploaded_chunks,
        "total_chunks": session.total_chunks,
        "status": UploadStatus::Uploading.as_str(),
        "chunk_key": key,
    })))
}

fn chunk_param(query_value: &Option<String>, request: &Request, header: &str) -> Option<String> {
    if let Some(value) = query_value {
        if !value.is_empty() {
            return Some(value.clone());
        }
    }
    request
        .headers()
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

async fn read_chunk_body(state: &AppState, request: Request) -> Result<Vec<u8>, ApiError> {
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("multipart/form-data"))
        .unwrap_or(false);
    if is_multipart {
        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|err| bad_request(&format!("Failed to read form data: {err}")))?;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|err| bad_request(&format!("Failed to read form data: {err}")))?
        {
            if field.name() == Some("chunk") {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| bad_request(&format!("Failed to read chunk: {err}")))?;
                return Ok(bytes.to_vec());
            }
        }
        return Err(bad_request("Failed to get chunk: missing 'chunk' field"));
    }

    let has_length = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok())
        .map(|length| length > 0)
        .unwrap_or(false);
    if !has_length {
        return Err(bad_request(
            "Content-Length header is required for raw body upload",
        ));
    }
    let bytes = to_bytes(request.into_body(), CHUNK_BODY_LIMIT)
        .await
        .map_err(|err| bad_request(&format!("Failed to read chunk body: {err}")))?;
    Ok(bytes.to_vec())
}

/// Finalize: flips the session to PROCESSING before publishing so polls
/// see progress immediately; a failed publish reverts to UPLOADING and
/// the session stays resumable.
async fn complete_upload(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(bucket_id): Path<Uuid>,
    Json(req): Json<CompleteUploadRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_bearer(&caller)?;
    let bucket = load_owned_bucket(&state, bucket_id, caller.user_id).await?;

    let upload_id =
        Uuid::parse_str(&req.upload_id).map_err(|_| bad_request("Invalid upload_id format"))?;
    let session = load_session(&state, upload_id, bucket_id).await?;
    session_is_active(&session)?;
    // The counter can over-count when a chunk index is re-posted; the
    // finalize worker verifies against the actual key enumeration.
    if session.uploaded_chunks < session.total_chunks {
        return Err(bad_request(&format!(
            "Missing chunks: expected {}, uploaded {}",
            session.total_chunks, session.uploaded_chunks
        )));
    }

    if let Err(err) = state
        .repo
        .update_session_status(upload_id, UploadStatus::Processing)
        .await
    {
        tracing::warn!(upload_id = %upload_id, error = %err, "processing mark failed");
    }

    let msg = ChunkCompleteMessage {
        upload_id: upload_id.to_string(),
        bucket_id: bucket_id.to_string(),
        bucket_name: bucket.name.clone(),
        user_id: caller.user_id.to_string(),
        temp_bucket: session.temp_bucket.clone(),
        temp_prefix: session.temp_prefix.clone(),
        file_name: session.file_name.clone(),
        file_size: session.file_size,
        content_type: session.content_type.clone(),
        custom_path: session.custom_path.clone(),
        total_chunks: session.total_chunks,
        timestamp: 0,
    };
    if let Err(err) = state.publisher.publish_chunk_complete(msg).await {
        tracing::error!(upload_id = %upload_id, error = %err, "finalize publish failed");
        if let Err(revert_err) = state
            .repo
            .update_session_status(upload_id, UploadStatus::Uploading)
            .await
        {
            tracing::error!(upload_id = %upload_id, error = %revert_err, "status revert failed");
        }
        return Err(internal_error("Failed to queue file for processing"));
    }

    tracing::info!(upload_id = %upload_id, chunks = session.total_chunks, "upload queued for processing");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": "Upload accepted for processing",
            "upload_id": upload_id,
            "status": "processing",
            "total_chunks": session.total_chunks,
            "file_name": session.file_name,
            "file_size": session.file_size,
            "status_url": format!("/api/v1/cloud/buckets/{bucket_id}/chunked/{upload_id}/status"),
        })),
    ))
}

async fn upload_status(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((bucket_id, upload_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Value>, ApiError> {
    require_bearer(&caller)?;
    load_owned_bucket(&state, bucket_id, caller.user_id).await?;
    let session = load_session(&state, upload_id, bucket_id).await?;

    let mut response = json!({
        "upload_id": session.id,
        "file_name": session.file_name,
        "file_size": session.file_size,
        "content_type": session.content_type,
        "status": session.status,
        "uploaded_chunks": session.uploaded_chunks,
        "total_chunks": session.total_chunks,
        "upload_progress": progress_percent(&session),
        "created_at": session.created_at,
        "updated_at": session.updated_at,
        "expires_at": session.expires_at,
    });
    let body = response.as_object_mut().expect("status body is an object");

    match session.parsed_status() {
        Some(UploadStatus::Init) => {
            body.insert(
                "message".into(),
                json!("Upload session initialized, waiting for chunks"),
            );
            body.insert("is_complete".into(), json!(false));
        }
        Some(UploadStatus::Uploading) => {
            body.insert(
                "message".into(),
                json!(format!(
                    "Uploading chunks: {}/{}",
                    session.uploaded_chunks, session.total_chunks
                )),
            );
            body.insert("is_complete".into(), json!(false));
        }
        Some(UploadStatus::Processing) => {
            body.insert(
                "message".into(),
                json!("All chunks uploaded, processing file (composing, hashing, copying)..."),
            );
            body.insert("is_complete".into(), json!(false));
            body.insert(
                "processing_steps".into(),
                json!([
                    "1. Composing chunks into single file",
                    "2. Calculating SHA256 hash",
                    "3. Moving to final storage",
                    "4. Creating object record",
                ]),
            );
        }
        Some(UploadStatus::Completed) => {
            body.insert("message".into(), json!("Upload completed successfully"));
            body.insert("is_complete".into(), json!(true));
            if let Some(file_hash) = &session.file_hash {
                body.insert("file_hash".into(), json!(file_hash));
                if let Some(object) = completed_object(&state, bucket_id, file_hash).await {
                    body.insert("object".into(), object);
                }
            }
        }
        Some(UploadStatus::Failed) => {
            body.insert("message".into(), json!("Upload failed during processing"));
            body.insert("is_complete".into(), json!(true));
            body.insert(
                "error".into(),
                json!("An error occurred while processing the upload. Please try again."),
            );
        }
        Some(UploadStatus::Expired) | None => {
            body.insert("message".into(), json!("Upload session has expired"));
            body.insert("is_complete".into(), json!(true));
            body.insert(
                "error".into(),
                json!("The upload session has expired. Please start a new upload."),
            );
        }
    }

    if session.is_expired_at(Utc::now()) && session.parsed_status() != Some(UploadStatus::Completed)
    {
        body.insert("status".into(), json!(UploadStatus::Expired.as_str()));
        body.insert("message".into(), json!("Upload session has expired"));
        body.insert("is_complete".into(), json!(true));
        body.insert(
            "error".into(),
            json!("The upload session has expired. Please start a new upload."),
        );
    }

    Ok(Json(response))
}

async fn completed_object(state: &AppState, bucket_id: Uuid, file_hash: &str) -> Option<Value> {
    match state
        .repo
        .find_objects_by_bucket_and_hash(bucket_id, file_hash)
        .await
    {
        Ok(objects) => objects.first().map(|object| {
            json!({
                "id": object.id,
                "url": object.url,
                "file_hash": object.file_hash,
                "size": object.size,
                "origin_name": object.origin_name,
            })
        }),
        Err(err) => {
            tracing::warn!(error = %err, "completed object lookup failed");
            None
        }
    }
}

async fn upload_progress(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((bucket_id, upload_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Value>, ApiError> {
    require_bearer(&caller)?;
    load_owned_bucket(&state, bucket_id, caller.user_id).await?;
    let session = load_session(&state, upload_id, bucket_id).await?;
    Ok(Json(json!({
        "upload_id": session.id,
        "uploaded_chunks": session.uploaded_chunks,
        "total_chunks": session.total_chunks,
        "status": session.status,
        "progress": progress_percent(&session),
    })))
}

/// Abort drops the session row and sweeps the temp keys in the
/// background; the chunks are exclusively owned by the session.
async fn abort_upload(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((bucket_id, upload_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Value>, ApiError> {
    require_bearer(&caller)?;
    load_owned_bucket(&state, bucket_id, caller.user_id).await?;
    let session = load_session(&state, upload_id, bucket_id).await?;

    let store = state.store.clone();
    let temp_bucket = session.temp_bucket.clone();
    let temp_prefix = session.temp_prefix.clone();
    tokio::spawn(async move {
        if let Err(err) = store.delete_objects_with_prefix(&temp_bucket, &temp_prefix).await {
            tracing::warn!(prefix = %temp_prefix, error = %err, "abort cleanup failed");
        }
    });

    state.repo.delete_upload_session(upload_id).await.map_err(|err| {
        tracing::error!(upload_id = %upload_id, error = %err, "session delete failed");
        internal_error("Failed to abort upload")
    })?;

    tracing::info!(upload_id = %upload_id, "upload session aborted");
    Ok(Json(json!({
        "message": "Upload aborted successfully",
        "upload_id": upload_id,
    })))
}

async fn list_sessions(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(bucket_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    require_bearer(&caller)?;
    load_owned_bucket(&state, bucket_id, caller.user_id).await?;
    let sessions = state
        .repo
        .list_active_sessions(bucket_id)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "session list failed");
            internal_error("Failed to list upload sessions")
        })?;
    Ok(Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    })))
}

async fn load_session(
    state: &AppState,
    upload_id: Uuid,
    bucket_id: Uuid,
) -> Result<UploadSession, ApiError> {
    state
        .repo
        .get_upload_session(upload_id, bucket_id)
        .await
        .map_err(|err| {
            tracing::error!(upload_id = %upload_id, error = %err, "session lookup failed");
            internal_error("Failed to look up upload session")
        })?
        .ok_or_else(|| not_found("Upload session not found"))
}

fn progress_percent(session: &UploadSession) -> f64 {
    if session.total_chunks <= 0 {
        return 0.0;
    }
    f64::from(session.uploaded_chunks) / f64::from(session.total_chunks) * 100.0
}

#[cfg(test)]
mod tests {
    use super::{negotiate_chunk_size, progress_percent, session_is_active, total_chunks_for};
    use crate::meta::models::{UploadSession, UploadStatus};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    const DEFAULT: i64 = 10 * 1024 * 1024;
    const MAX: i64 = 15 * 1024 * 1024;

    fn session_with_status(status: UploadStatus) -> UploadSession {
        let now = Utc::now();
        UploadSession {
            id: Uuid::new_v4(),
            bucket_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            file_name: "big.iso".into(),
            file_size: 104_857_600,
            content_type: "application/octet-stream".into(),
            custom_path: String::new(),
            chunk_size: DEFAULT,
            total_chunks: 10,
            uploaded_chunks: 4,
            status: status.as_str().to_string(),
            temp_bucket: "temp-uploads".into(),
            temp_prefix: "pending/x/".into(),
            file_hash: None,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::hours(24),
        }
    }

    #[test]
    fn chunk_size_defaults_when_no_preference() {
        assert_eq!(negotiate_chunk_size(0, DEFAULT, MAX), DEFAULT);
        assert_eq!(negotiate_chunk_size(-1, DEFAULT, MAX), DEFAULT);
    }

    #[test]
    fn chunk_size_below_default_uses_default() {
        assert_eq!(negotiate_chunk_size(DEFAULT - 1, DEFAULT, MAX), DEFAULT);
    }

    #[test]
    fn chunk_size_within_range_honors_preference() {
        assert_eq!(negotiate_chunk_size(DEFAULT, DEFAULT, MAX), DEFAULT);
        assert_eq!(negotiate_chunk_size(12 * 1024 * 1024, DEFAULT, MAX), 12 * 1024 * 1024);
        assert_eq!(negotiate_chunk_size(MAX, DEFAULT, MAX), MAX);
    }

    #[test]
    fn chunk_size_above_max_is_clamped() {
        assert_eq!(negotiate_chunk_size(MAX + 1, DEFAULT, MAX), MAX);
    }

    #[test]
    fn total_chunks_rounds_up() {
        assert_eq!(total_chunks_for(104_857_600, DEFAULT), 10);
        assert_eq!(total_chunks_for(104_857_601, DEFAULT), 11);
        assert_eq!(total_chunks_for(1, DEFAULT), 1);
    }

    #[test]
    fn active_check_accepts_init_and_uploading() {
        assert!(session_is_active(&session_with_status(UploadStatus::Init)).is_ok());
        assert!(session_is_active(&session_with_status(UploadStatus::Uploading)).is_ok());
    }

    #[test]
    fn active_check_rejects_settled_states() {
        for status in [
            UploadStatus::Processing,
            UploadStatus::Completed,
            UploadStatus::Failed,
            UploadStatus::Expired,
        ] {
            assert!(session_is_active(&session_with_status(status)).is_err());
        }
    }

    #[test]
    fn active_check_rejects_expired_sessions() {
        let mut session = session_with_status(UploadStatus::Uploading);
        session.expires_at = Utc::now() - Duration::seconds(1);
        assert!(session_is_active(&session).is_err());
    }

    #[test]
    fn progress_is_a_percentage() {
        let session = session_with_status(UploadStatus::Uploading);
        assert!((progress_percent(&session) - 40.0).abs() < f64::EPSILON);
        let mut empty = session_with_status(UploadStatus::Init);
        empty.total_chunks = 0;
        assert_eq!(progress_percent(&empty), 0.0);
    }
}
