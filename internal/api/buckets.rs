use crate::api::auth::{bearer_auth, CallerIdentity};
use crate::api::{
    bad_request, conflict, internal_error, load_owned_bucket, ApiError, AppState,
};
use crate::events::{DeleteBucketMessage, UpdateBucketPolicyMessage};
use crate::meta::models::Bucket;
use axum::extract::{Path, State};
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/buckets/", get(list_buckets).post(create_bucket))
        .route("/buckets/{id}", get(get_bucket).delete(delete_bucket))
        .route_layer(from_fn_with_state(state, bearer_auth))
}

#[derive(Debug, Deserialize)]
struct CreateBucketRequest {
    name: String,
    #[serde(default)]
    region: String,
}

/// Store first, catalog second (store create is the step most likely to
/// fail); a catalog failure rolls the store bucket back. The policy
/// rewrite for the owner's IAM users is enqueued, not inlined.
async fn create_bucket(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Json(req): Json<CreateBucketRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = req.name.trim().to_string();
    if name.len() < 3 || name.len() > 63 {
        return Err(bad_request("Bucket name must be between 3 and 63 characters"));
    }

    let taken = state.repo.bucket_name_exists(&name).await.map_err(|err| {
        tracing::error!(error = %err, "bucket name check failed");
        internal_error("Error checking bucket name existence")
    })?;
    if taken {
        return Err(conflict("Bucket with this name already exists"));
    }

    let region = if req.region.is_empty() {
        state.config.s3.region.clone()
    } else {
        req.region.clone()
    };

    tracing::info!(bucket = %name, region = %region, user_id = %caller.user_id, "creating bucket");
    state
        .store
        .create_bucket(&name, &region)
        .await
        .map_err(|err| {
            tracing::error!(bucket = %name, error = %err, "store bucket create failed");
            internal_error("Failed to create bucket on storage")
        })?;

    let bucket = Bucket {
        id: Uuid::new_v4(),
        name: name.clone(),
        region,
        owner_user_id: caller.user_id,
        created_at: Utc::now(),
    };
    if let Err(err) = state.repo.create_bucket(&bucket).await {
        tracing::error!(bucket = %name, error = %err, "bucket insert failed");
        if let Err(store_err) = state.store.delete_bucket(&name).await {
            tracing::error!(bucket = %name, error = %store_err, "store bucket rollback failed");
        }
        return Err(internal_error("Failed to create bucket"));
    }

    let msg = UpdateBucketPolicyMessage {
        user_id: caller.user_id.to_string(),
        bucket_name: name.clone(),
        timestamp: 0,
    };
    if let Err(err) = state.publisher.publish_bucket_policy_update(msg).await {
        tracing::error!(bucket = %name, error = %err, "policy rewrite publish failed");
    }

    tracing::info!(bucket_id = %bucket.id, "bucket created");
    Ok(Json(json!({
        "message": "Bucket created successfully",
        "bucket": bucket,
    })))
}

async fn list_buckets(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<Json<Value>, ApiError> {
    let buckets = state.repo.list_buckets(caller.user_id).await.map_err(|err| {
        tracing::error!(error = %err, "bucket list failed");
        internal_error("Failed to list buckets")
    })?;
    Ok(Json(json!({ "buckets": buckets })))
}

async fn get_bucket(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let bucket = load_owned_bucket(&state, id, caller.user_id).await?;
    Ok(Json(json!({ "bucket": bucket })))
}

/// Two-phase delete: the catalog row disappears immediately (objects and
/// sessions cascade), the store-side emptying runs from the queue. The
/// caller sees success even if the cleanup later fails.
async fn delete_bucket(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let bucket = load_owned_bucket(&state, id, caller.user_id).await?;

    state.repo.delete_bucket(id).await.map_err(|err| {
        tracing::error!(bucket_id = %id, error = %err, "bucket delete failed");
        internal_error("Failed to delete bucket")
    })?;

    let msg = DeleteBucketMessage {
        user_id: caller.user_id.to_string(),
        bucket_name: bucket.name.clone(),
        timestamp: 0,
    };
    if let Err(err) = state.publisher.publish_delete_bucket(msg).await {
        tracing::error!(bucket = %bucket.name, error = %err, "bucket cleanup publish failed");
    }

    tracing::info!(bucket_id = %id, "bucket deletion initiated");
    Ok(Json(json!({
        "message": "Bucket deletion initiated successfully",
    })))
}
