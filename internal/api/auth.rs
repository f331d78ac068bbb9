use crate::api::AppState;
use crate::auth::hmac::{verify_signature, within_replay_window};
use crate::util::mask::mask_access_key;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

/// Largest request body the auth gate will buffer for HMAC verification;
/// direct uploads stay under the large-file threshold, chunks under the
/// max chunk size.
const MAX_BUFFERED_BODY: usize = 64 * 1024 * 1024;

/// Identity resolved by the auth gate; both branches populate the same
/// downstream extension.
#[derive(Debug, Clone, Copy)]
pub struct CallerIdentity {
    pub user_id: Uuid,
    pub auth_method: AuthMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Bearer,
    Hmac,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bearer => "bearer",
            Self::Hmac => "hmac",
        }
    }
}

/// Middleware for routes that only accept `Authorization: Bearer`.
pub async fn bearer_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    authenticate(state, request, next, false).await
}

/// Middleware for the upload surface: `Bearer` or `HMAC` are both valid.
pub async fn upload_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    authenticate(state, request, next, true).await
}

async fn authenticate(state: AppState, request: Request, next: Next, allow_hmac: bool) -> Response {
    let header = match request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
    {
        Some(header) => header,
        None => return unauthorized("Authorization header is required"),
    };

    if let Some(token) = header.strip_prefix("Bearer ") {
        return match verify_bearer(&state, token).await {
            Ok(identity) => forward(request, next, identity).await,
            Err(response) => response,
        };
    }
    if let Some(credentials) = header.strip_prefix("HMAC ") {
        if !allow_hmac {
            return unauthorized("Invalid authorization type. Use 'Bearer'");
        }
        return verify_hmac_and_forward(&state, credentials.to_string(), request, next).await;
    }
    unauthorized("Invalid authorization type. Use 'Bearer' or 'HMAC'")
}

async fn forward(mut request: Request, next: Next, identity: CallerIdentity) -> Response {
    request.extensions_mut().insert(identity);
    next.run(request).await
}

async fn verify_bearer(state: &AppState, token: &str) -> Result<CallerIdentity, Response> {
    if token.is_empty() {
        return Err(unauthorized("Invalid Bearer token"));
    }
    if let Err(err) = state.authz.check_access_token(token).await {
        tracing::warn!(error = %err, "authorization service rejected token");
        return Err(unauthorized("Invalid or expired token"));
    }
    let claims = state
        .token_verifier
        .verify(token)
        .map_err(|_| unauthorized("Invalid token"))?;
    Ok(CallerIdentity {
        user_id: claims.user_id,
        auth_method: AuthMethod::Bearer,
    })
}

/// HMAC flow: replay-window check, IAM lookup, body buffering (restored
/// for the handler), canonical-string signature comparison.
async fn verify_hmac_and_forward(
    state: &AppState,
    credentials: String,
    request: Request,
    next: Next,
) -> Response {
    let Some((access_key, client_signature)) = credentials.split_once(':') else {
        return unauthorized("Invalid HMAC authorization format. Expected: HMAC <accessKey>:<signature>");
    };
    if access_key.is_empty() || client_signature.is_empty() {
        return unauthorized("Access key and signature are required");
    }

    let timestamp = match request
        .headers()
        .get("x-timestamp")
        .and_then(|value| value.to_str().ok())
    {
        Some(raw) => match raw.parse::<i64>() {
            Ok(timestamp) => timestamp,
            Err(_) => return unauthorized("Invalid X-Timestamp format"),
        },
        None => return unauthorized("X-Timestamp header is required"),
    };
    if !within_replay_window(
        Utc::now().timestamp(),
        timestamp,
        state.config.replay_window_seconds,
    ) {
        return unauthorized("Request timestamp expired");
    }

    let iam_user = match state.repo.get_iam_user_by_access_key(access_key).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            tracing::warn!(access_key = %mask_access_key(access_key), "unknown access key");
            return unauthorized("Invalid access key");
        }
        Err(err) => {
            tracing::error!(error = %err, "IAM lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to verify credentials" })),
            )
                .into_response();
        }
    };

    let method = request.method().as_str().to_string();
    let path = canonical_request_path(&request);
    let access_key = access_key.to_string();
    let client_signature = client_signature.to_string();

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BUFFERED_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Failed to read request body" })),
            )
                .into_response()
        }
    };

    if !verify_signature(
        &iam_user.secret_key,
        &method,
        &path,
        timestamp,
        &bytes,
        &client_signature,
    ) {
        tracing::warn!(access_key = %mask_access_key(&access_key), "signature mismatch");
        return unauthorized("Invalid signature");
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    forward(
        request,
        next,
        CallerIdentity {
            user_id: iam_user.owner_user_id,
            auth_method: AuthMethod::Hmac,
        },
    )
    .await
}

/// For routes on the upload surface that still require a bearer caller:
/// an HMAC-authenticated request is rejected the way a missing bearer
/// token would be.
pub(crate) fn require_bearer(caller: &CallerIdentity) -> Result<(), crate::api::ApiError> {
    if caller.auth_method != AuthMethod::Bearer {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid authorization type. Use 'Bearer'" })),
        ));
    }
    Ok(())
}

/// The signed PATH is the path the client sent, before any router
/// nesting rewrites it.
fn canonical_request_path(request: &Request) -> String {
    if let Some(original) = request.extensions().get::<axum::extract::OriginalUri>() {
        return original.path().to_string();
    }
    request.uri().path().to_string()
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::AuthMethod;

    #[test]
    fn auth_method_labels() {
        assert_eq!(AuthMethod::Bearer.as_str(), "bearer");
        assert_eq!(AuthMethod::Hmac.as_str(), "hmac");
    }
}
