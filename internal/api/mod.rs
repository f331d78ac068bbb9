use crate::auth::token::TokenVerifier;
use crate::events::EventPublisher;
use crate::external::{AuthorizationClient, UploadClient};
use crate::meta::models::Bucket;
use crate::meta::repos::Repo;
use crate::obs::{Metrics, MetricsLayer};
use crate::storage::admin::AdminClient;
use crate::storage::store::ObjectStore;
use crate::util::config::Config;
use axum::extract::State;
use axum::http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

pub mod auth;
pub mod buckets;
pub mod chunked;
pub mod iam;
pub mod objects;

/// Handler error shape: a status plus the `{error}` envelope.
pub(crate) type ApiError = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub repo: Repo,
    pub store: ObjectStore,
    pub admin: AdminClient,
    pub publisher: EventPublisher,
    pub authz: AuthorizationClient,
    pub uploader: UploadClient,
    pub token_verifier: TokenVerifier,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub async fn new(
        config: Config,
        pool: PgPool,
        metrics: Arc<Metrics>,
    ) -> Result<Self, String> {
        let repo = Repo::new(pool);
        let store = ObjectStore::new(&config.s3);
        let admin = AdminClient::new(&config.admin)?;
        let publisher = EventPublisher::new(&config.rabbit_url).await?;
        let authz = AuthorizationClient::new(&config.auth_service_url)?;
        let uploader = UploadClient::new(&config.upload_service_url, config.cdn_url.clone())?;
        let token_verifier =
            TokenVerifier::new(config.jwt_secret.as_bytes(), &config.jwt_algorithm)?;
        Ok(Self {
            config,
            repo,
            store,
            admin,
            publisher,
            authz,
            uploader,
            token_verifier,
            metrics,
        })
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .merge(iam::router(state.clone()))
        .merge(buckets::router(state.clone()))
        .merge(objects::router(state.clone()))
        .merge(chunked::router(state.clone()));

    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .nest("/api/v1/cloud", api)
        .layer(MetricsLayer::new(state.metrics.clone()))
        .with_state(state.clone());

    if !state.config.cors_allow_origins.is_empty() {
        router = router.layer(build_cors(&state.config.cors_allow_origins));
    }
    router
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods(AllowMethods::list(vec![
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
        ]))
        .allow_headers(AllowHeaders::list(vec![
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static("x-timestamp"),
            HeaderName::from_static("x-upload-id"),
            HeaderName::from_static("x-chunk-index"),
        ]));
    if origins.iter().any(|origin| origin == "*") {
        return cors.allow_origin(Any);
    }
    let list = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();
    cors.allow_origin(AllowOrigin::list(list)).allow_credentials(true)
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> ApiError {
    (status, Json(json!({ "error": message })))
}

pub(crate) fn bad_request(message: &str) -> ApiError {
    error_response(StatusCode::BAD_REQUEST, message)
}

pub(crate) fn not_found(message: &str) -> ApiError {
    error_response(StatusCode::NOT_FOUND, message)
}

pub(crate) fn forbidden(message: &str) -> ApiError {
    error_response(StatusCode::FORBIDDEN, message)
}

pub(crate) fn conflict(message: &str) -> ApiError {
    error_response(StatusCode::CONFLICT, message)
}

pub(crate) fn internal_error(message: &str) -> ApiError {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
}

/// Loads a bucket and enforces that the caller owns it: 404 when absent,
/// 403 when owned by someone else.
pub(crate) async fn load_owned_bucket(
    state: &AppState,
    bucket_id: Uuid,
    user_id: Uuid,
) -> Result<Bucket, ApiError> {
    let bucket = state
        .repo
        .get_bucket(bucket_id)
        .await
        .map_err(|err| {
            tracing::error!(bucket_id = %bucket_id, error = %err, "bucket lookup failed");
            internal_error("Failed to look up bucket")
        })?
        .ok_or_else(|| not_found("Bucket not found"))?;
    if bucket.owner_user_id != user_id {
        tracing::warn!(
            bucket_id = %bucket_id,
            user_id = %user_id,
            owner_user_id = %bucket.owner_user_id,
            "bucket access denied"
        );
        return Err(forbidden(
            "Forbidden: you don't have permission to access this bucket",
        ));
    }
    Ok(bucket)
}

#[cfg(test)]
mod tests {
    use super::{bad_request, conflict, error_response, forbidden, internal_error, not_found};
    use axum::http::StatusCode;

    #[test]
    fn error_helpers_map_to_expected_statuses() {
        assert_eq!(bad_request("x").0, StatusCode::BAD_REQUEST);
        assert_eq!(not_found("x").0, StatusCode::NOT_FOUND);
        assert_eq!(forbidden("x").0, StatusCode::FORBIDDEN);
        assert_eq!(conflict("x").0, StatusCode::CONFLICT);
        assert_eq!(internal_error("x").0, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn error_body_uses_error_envelope() {
        let (_, body) = error_response(StatusCode::BAD_REQUEST, "bad input");
        assert_eq!(body.0["error"], "bad input");
    }
}
