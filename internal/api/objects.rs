use crate::api::auth::{require_bearer, upload_auth, CallerIdentity};
use crate::api::{
    bad_request, internal_error, load_owned_bucket, not_found, ApiError, AppState,
};
use crate::events::{DeleteObjectMessage, DeletePathMessage};
use crate::meta::models::Object;
use crate::util::paths::{format_bytes, normalize_custom_path};
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::response::Response;
use axum::routing::{delete, get};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

/// Buffered upload bodies may reach the large-file threshold plus
/// multipart framing.
const UPLOAD_BODY_LIMIT: usize = 64 * 1024 * 1024;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/buckets/{id}/objects",
            get(list_objects_root).post(upload_object),
        )
        .route("/buckets/{id}/objects/{*path}", get(list_objects_at_path))
        .route("/buckets/{id}/objects/{object_id}", delete(delete_object))
        .route(
            "/buckets/{id}/objects/path/{*path}",
            delete(delete_objects_by_path),
        )
        .route(
            "/buckets/{id}/objects/{object_id}/download",
            get(download_object),
        )
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT))
        .route_layer(from_fn_with_state(state, upload_auth))
}

/// Direct (small) upload. Files over the threshold are rejected with a
/// structured pointer at the chunked endpoints so oversized bodies never
/// travel through single requests behind a reverse proxy.
async fn upload_object(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(bucket_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let bucket = load_owned_bucket(&state, bucket_id, caller.user_id).await?;

    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut raw_path = String::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| bad_request(&format!("Failed to read form data: {err}")))?
    {
        match field.name() {
            Some("file") => {
                let file_name = field
                    .file_name()
                    .unwrap_or("upload.bin")
                    .to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| bad_request(&format!("Failed to get file: {err}")))?;
                file = Some((file_name, content_type, bytes.to_vec()));
            }
            Some("path") => {
                raw_path = field
                    .text()
                    .await
                    .map_err(|err| bad_request(&format!("Failed to read path field: {err}")))?;
            }
            _ => {}
        }
    }
    let Some((file_name, content_type, bytes)) = file else {
        return Err(bad_request("Failed to get file: missing 'file' field"));
    };
    let custom_path = normalize_custom_path(&raw_path)
        .map_err(|err| bad_request(&format!("Invalid path: {err}")))?;

    let file_size = bytes.len() as i64;
    let threshold = state.config.large_file_threshold;
    tracing::info!(
        file = %file_name,
        size = file_size,
        bucket = %bucket.name,
        path = %custom_path,
        "direct upload"
    );
    if file_size > threshold {
        tracing::warn!(size = file_size, threshold, "file exceeds direct upload threshold");
        return Err(file_too_large(file_size, threshold));
    }

    let uploaded = state
        .uploader
        .upload_file(bytes, &file_name, &content_type, &bucket.name, &custom_path)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "upload service forward failed");
            internal_error("Failed to upload file")
        })?;

    let url = uploaded
        .file_path
        .rsplit('/')
        .next()
        .unwrap_or(uploaded.file_path.as_str())
        .to_string();
    let object = Object {
        id: Uuid::new_v4(),
        bucket_id,
        origin_name: file_name,
        parent_path: custom_path,
        content_type: uploaded.content_type.clone(),
        size: uploaded.size,
        url,
        file_hash: uploaded.file_hash.clone(),
        created_at: Utc::now(),
        last_modified: Utc::now(),
    };
    state.repo.create_object(&object).await.map_err(|err| {
        tracing::error!(error = %err, "object insert failed");
        internal_error("Failed to save object metadata")
    })?;

    let cdn_url = state.uploader.cdn_url(&bucket.name, &uploaded.file_path);
    tracing::info!(object_id = %object.id, "object uploaded");
    Ok(Json(json!({
        "message": "File uploaded successfully",
        "object": object,
        "cdn_url": cdn_url,
        "duplicated": uploaded.duplicated,
    })))
}

fn file_too_large(file_size: i64, threshold: i64) -> ApiError {
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        Json(json!({
            "error": "FILE_TOO_LARGE",
            "message": "File size exceeds the maximum allowed for direct upload",
            "hint": format!(
                "Use chunked upload API for files larger than {}",
                format_bytes(threshold)
            ),
            "file_size": file_size,
            "threshold": threshold,
            "endpoints": {
                "init": "POST /api/v1/cloud/buckets/:id/chunked/init",
                "chunk": "POST /api/v1/cloud/buckets/:id/chunked/chunk",
                "complete": "POST /api/v1/cloud/buckets/:id/chunked/complete",
            },
        })),
    )
}

async fn list_objects_root(
    state: State<AppState>,
    caller: Extension<CallerIdentity>,
    Path(bucket_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    list_objects(state, caller, bucket_id, String::new()).await
}

async fn list_objects_at_path(
    state: State<AppState>,
    caller: Extension<CallerIdentity>,
    Path((bucket_id, path)): Path<(Uuid, String)>,
) -> Result<Json<Value>, ApiError> {
    list_objects(state, caller, bucket_id, path).await
}

/// Lists catalog objects directly under a path along with the folders
/// derived from deeper `parent_path` values.
async fn list_objects(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    bucket_id: Uuid,
    raw_path: String,
) -> Result<Json<Value>, ApiError> {
    require_bearer(&caller)?;
    let bucket = load_owned_bucket(&state, bucket_id, caller.user_id).await?;
    let parent_path = raw_path.trim_matches('/').trim().to_string();

    let objects = state
        .repo
        .list_objects_by_path(bucket_id, &parent_path)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "object list failed");
            internal_error("Failed to list objects")
        })?;
    let folders = state
        .repo
        .list_folders_by_path(bucket_id, &parent_path)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "folder list failed");
            internal_error("Failed to list folders")
        })?;

    tracing::info!(
        bucket = %bucket.name,
        path = %parent_path,
        objects = objects.len(),
        folders = folders.len(),
        "listed objects"
    );
    Ok(Json(json!({
        "path": parent_path,
        "object_count": objects.len(),
        "folder_count": folders.len(),
        "objects": objects,
        "folders": folders,
    })))
}

/// Catalog row first, physical delete through the queue.
async fn delete_object(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((bucket_id, object_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Value>, ApiError> {
    require_bearer(&caller)?;
    let bucket = load_owned_bucket(&state, bucket_id, caller.user_id).await?;
    let object = load_object_in_bucket(&state, object_id, bucket_id).await?;

    state.repo.delete_object(object_id).await.map_err(|err| {
        tracing::error!(object_id = %object_id, error = %err, "object delete failed");
        internal_error("Failed to delete object")
    })?;

    let msg = DeleteObjectMessage {
        bucket_name: bucket.name.clone(),
        object_path: physical_key(&object),
        user_id: caller.user_id.to_string(),
        timestamp: 0,
    };
    if let Err(err) = state.publisher.publish_delete_object(msg).await {
        tracing::error!(object_id = %object_id, error = %err, "object delete publish failed");
    }

    tracing::info!(object_id = %object_id, "object deleted");
    Ok(Json(json!({
        "message": "Object deleted successfully",
        "object_id": object_id,
    })))
}

/// Removes the catalog subtree and enqueues one prefix delete for the
/// store side, carrying the removed rows' count back to the caller.
async fn delete_objects_by_path(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((bucket_id, raw_path)): Path<(Uuid, String)>,
) -> Result<Json<Value>, ApiError> {
    require_bearer(&caller)?;
    let bucket = load_owned_bucket(&state, bucket_id, caller.user_id).await?;
    let path = raw_path.trim_matches('/').trim().to_string();

    let deleted = state
        .repo
        .delete_objects_by_path_prefix(bucket_id, &path)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "path delete failed");
            internal_error("Failed to delete objects")
        })?;

    let msg = DeletePathMessage {
        bucket_name: bucket.name.clone(),
        path: path.clone(),
        user_id: caller.user_id.to_string(),
        timestamp: 0,
    };
    if let Err(err) = state.publisher.publish_delete_path(msg).await {
        tracing::error!(path = %path, error = %err, "path delete publish failed");
    }

    tracing::info!(bucket = %bucket.name, path = %path, count = deleted.len(), "path deleted");
    Ok(Json(json!({
        "message": "Objects deleted successfully",
        "path": path,
        "deleted_count": deleted.len(),
    })))
}

/// Streams the object's bytes from the store without buffering the whole
/// body in memory.
async fn download_object(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path((bucket_id, object_id)): Path<(Uuid, Uuid)>,
) -> Result<Response, ApiError> {
    require_bearer(&caller)?;
    let bucket = load_owned_bucket(&state, bucket_id, caller.user_id).await?;
    let object = load_object_in_bucket(&state, object_id, bucket_id).await?;

    let (byte_stream, size) = state
        .store
        .get_object_stream(&bucket.name, &physical_key(&object))
        .await
        .map_err(|err| {
            tracing::error!(object_id = %object_id, error = %err, "object fetch failed");
            internal_error("Failed to retrieve object")
        })?;

    let stream = futures_util::stream::try_unfold(byte_stream, |mut body| async move {
        match body.try_next().await {
            Ok(Some(chunk)) => Ok(Some((chunk, body))),
            Ok(None) => Ok(None),
            Err(err) => Err(std::io::Error::other(err)),
        }
    });

    let content_type = if object.content_type.is_empty() {
        "application/octet-stream"
    } else {
        object.content_type.as_str()
    };
    tracing::info!(object_id = %object_id, size, "streaming download");
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type)
        .header(
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", object.origin_name),
        )
        .header(CONTENT_LENGTH, size)
        .body(Body::from_stream(stream))
        .map_err(|err| {
            tracing::error!(error = %err, "response build failed");
            internal_error("Failed to stream object")
        })
}

async fn load_object_in_bucket(
    state: &AppState,
    object_id: Uuid,
    bucket_id: Uuid,
) -> Result<Object, ApiError> {
    let object = state
        .repo
        .get_object(object_id)
        .await
        .map_err(|err| {
            tracing::error!(object_id = %object_id, error = %err, "object lookup failed");
            internal_error("Failed to look up object")
        })?
        .ok_or_else(|| not_found("Object not found"))?;
    if object.bucket_id != bucket_id {
        return Err(not_found("Object not found in this bucket"));
    }
    Ok(object)
}

/// Store key of an object: the hash-derived leaf, nested under the
/// parent path when one is set.
fn physical_key(object: &Object) -> String {
    if object.parent_path.is_empty() {
        return object.url.clone();
    }
    format!("{}/{}", object.parent_path, object.url)
}

#[cfg(test)]
mod tests {
    use super::{file_too_large, physical_key};
    use crate::meta::models::Object;
    use axum::http::StatusCode;
    use chrono::Utc;
    use uuid::Uuid;

    fn object_with_path(parent_path: &str) -> Object {
        Object {
            id: Uuid::new_v4(),
            bucket_id: Uuid::new_v4(),
            origin_name: "report.pdf".into(),
            parent_path: parent_path.into(),
            content_type: "application/pdf".into(),
            size: 10,
            url: "abc123.pdf".into(),
            file_hash: "abc123".into(),
            created_at: Utc::now(),
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn physical_key_nests_under_parent_path() {
        assert_eq!(physical_key(&object_with_path("")), "abc123.pdf");
        assert_eq!(physical_key(&object_with_path("docs/2024")), "docs/2024/abc123.pdf");
    }

    #[test]
    fn file_too_large_is_structured_413() {
        let (status, body) = file_too_large(62_914_560, 52_428_800);
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body.0["error"], "FILE_TOO_LARGE");
        assert_eq!(body.0["threshold"], 52_428_800);
        assert_eq!(body.0["file_size"], 62_914_560);
        assert_eq!(
            body.0["endpoints"]["init"],
            "POST /api/v1/cloud/buckets/:id/chunked/init"
        );
        assert!(body.0["hint"].as_str().expect("hint").contains("50.0 MiB"));
    }
}
