use crate::api::auth::{bearer_auth, CallerIdentity};
use crate::api::{conflict, forbidden, internal_error, not_found, ApiError, AppState};
use crate::events::UpdateIamPolicyMessage;
use crate::meta::models::{IamPolicy, IamUser};
use crate::policy::{policy_name_for, role_template, POLICY_TYPE_S3};
use crate::util::mask::mask_access_key;
use axum::extract::{Path, State};
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/iam/", get(list_iam_users).post(create_iam_user))
        .route("/iam/{id}", delete(delete_iam_user).put(update_credentials))
        .route_layer(from_fn_with_state(state, bearer_auth))
}

#[derive(Debug, Deserialize)]
struct CreateIamRequest {
    access_key: String,
    secret_key: String,
    name: String,
    email: String,
    #[serde(default)]
    role: String,
}

#[derive(Debug, Deserialize)]
struct UpdateCredentialsRequest {
    access_key: String,
    secret_key: String,
}

/// Two-phase create: admin side first (user, policy, attachment as one
/// operation with internal inverses), then the catalog rows; a catalog
/// failure unwinds the admin side.
async fn create_iam_user(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Json(req): Json<CreateIamRequest>,
) -> Result<Json<Value>, ApiError> {
    let role = effective_role(&req.role);

    check_uniqueness(&state, &req).await?;

    let policy_name = policy_name_for(&req.access_key);
    let document = role_template(&role)
        .to_value()
        .map_err(|err| {
            tracing::error!(error = %err, "policy template serialize failed");
            internal_error("Failed to build policy document")
        })?;

    tracing::info!(
        access_key = %mask_access_key(&req.access_key),
        name = %req.name,
        "creating IAM user"
    );
    state
        .admin
        .create_user_with_policy(&req.access_key, &req.secret_key, &policy_name, &document)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "admin-side IAM create failed");
            internal_error("Failed to create IAM user at storage admin")
        })?;

    let iam_user = IamUser {
        id: Uuid::new_v4(),
        owner_user_id: caller.user_id,
        access_key: req.access_key.clone(),
        secret_key: req.secret_key.clone(),
        name: req.name.clone(),
        email: req.email.clone(),
        role: role.clone(),
    };
    if let Err(err) = state.repo.create_iam_user(&iam_user).await {
        tracing::error!(error = %err, "IAM user insert failed");
        state.admin.best_effort_remove_user(&req.access_key).await;
        state.admin.best_effort_remove_policy(&policy_name).await;
        return Err(internal_error("Failed to create IAM user"));
    }

    let iam_policy = IamPolicy {
        id: Uuid::new_v4(),
        iam_id: iam_user.id,
        policy_type: POLICY_TYPE_S3.to_string(),
        document,
    };
    if let Err(err) = state.repo.create_iam_policy(&iam_policy).await {
        tracing::error!(error = %err, "IAM policy insert failed");
        if let Err(db_err) = state.repo.delete_iam_user(iam_user.id).await {
            tracing::error!(error = %db_err, "IAM user rollback failed");
        }
        state.admin.best_effort_remove_user(&req.access_key).await;
        state.admin.best_effort_remove_policy(&policy_name).await;
        return Err(internal_error("Failed to create IAM policy"));
    }

    tracing::info!(iam_id = %iam_user.id, "IAM user created");
    Ok(Json(json!({
        "message": "IAM user created successfully",
        "iam_user": {
            "id": iam_user.id,
            "user_id": iam_user.owner_user_id,
            "access_key": iam_user.access_key,
            "secret_key": iam_user.secret_key,
            "name": iam_user.name,
            "email": iam_user.email,
            "role": iam_user.role,
        }
    })))
}

async fn check_uniqueness(state: &AppState, req: &CreateIamRequest) -> Result<(), ApiError> {
    let name_taken = state.repo.iam_name_exists(&req.name).await.map_err(|err| {
        tracing::error!(error = %err, "IAM name check failed");
        internal_error("Error checking IAM name existence")
    })?;
    if name_taken {
        return Err(conflict("IAM user with this name already exists"));
    }
    let key_taken = state
        .repo
        .iam_access_key_exists(&req.access_key)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "IAM access key check failed");
            internal_error("Error checking IAM access key existence")
        })?;
    if key_taken {
        return Err(conflict("IAM user with this access key already exists"));
    }
    let email_taken = state.repo.iam_email_exists(&req.email).await.map_err(|err| {
        tracing::error!(error = %err, "IAM email check failed");
        internal_error("Error checking IAM email existence")
    })?;
    if email_taken {
        return Err(conflict("IAM user with this email already exists"));
    }
    Ok(())
}

async fn list_iam_users(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<Json<Value>, ApiError> {
    let iam_users = state
        .repo
        .list_iam_users(caller.user_id)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "IAM list failed");
            internal_error("Failed to list IAM users")
        })?;
    Ok(Json(json!({ "iam_users": iam_users })))
}

/// Catalog row goes first (policies cascade with it); the admin-side user
/// removal is enqueued-in-spirit: failures are logged, the outbox-style
/// convergence is handled by the store-side state eventually matching.
async fn delete_iam_user(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let iam_user = load_owned_iam_user(&state, id, caller.user_id).await?;

    state.repo.delete_iam_user(id).await.map_err(|err| {
        tracing::error!(iam_id = %id, error = %err, "IAM delete failed");
        internal_error("Failed to delete IAM user")
    })?;

    if let Err(err) = state.admin.remove_user(&iam_user.access_key).await {
        tracing::warn!(
            access_key = %mask_access_key(&iam_user.access_key),
            error = %err,
            "admin-side IAM delete failed after catalog delete"
        );
    }

    tracing::info!(iam_id = %id, "IAM user deleted");
    Ok(Json(json!({ "message": "IAM user deleted successfully" })))
}

/// Credential rotation: admin side swaps the user, the catalog follows,
/// and the policy rename is published for async convergence. A failed
/// publish does not roll the rotation back; the credentials are the
/// user-visible authority.
async fn update_credentials(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateCredentialsRequest>,
) -> Result<Json<Value>, ApiError> {
    let iam_user = load_owned_iam_user(&state, id, caller.user_id).await?;

    if req.access_key != iam_user.access_key {
        let taken = state
            .repo
            .iam_access_key_exists(&req.access_key)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "access key check failed");
                internal_error("Error checking access key existence")
            })?;
        if taken {
            return Err(conflict("Access key already exists"));
        }
    }

    let policies = state.repo.list_policies_for_iam(id).await.map_err(|err| {
        tracing::error!(error = %err, "policy lookup failed");
        internal_error("Failed to get IAM policies")
    })?;
    let Some(policy) = policies
        .iter()
        .find(|policy| policy.policy_type == POLICY_TYPE_S3)
        .or(policies.first())
    else {
        return Err(internal_error("Failed to get IAM policies"));
    };
    let old_policy_name = policy_name_for(&iam_user.access_key);
    let new_policy_name = policy_name_for(&req.access_key);

    state
        .admin
        .remove_user(&iam_user.access_key)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "old admin user delete failed");
            internal_error("Failed to delete old IAM user at storage admin")
        })?;

    if let Err(err) = state.admin.add_user(&req.access_key, &req.secret_key).await {
        tracing::error!(error = %err, "new admin user create failed");
        restore_admin_user(&state, &iam_user).await;
        return Err(internal_error(
            "Failed to create new IAM user at storage admin",
        ));
    }

    if let Err(err) = state
        .repo
        .update_iam_credentials(id, &req.access_key, &req.secret_key)
        .await
    {
        tracing::error!(error = %err, "catalog credential update failed");
        state.admin.best_effort_remove_user(&req.access_key).await;
        restore_admin_user(&state, &iam_user).await;
        return Err(internal_error("Failed to update IAM user"));
    }

    tracing::info!(
        iam_id = %id,
        access_key = %mask_access_key(&req.access_key),
        "IAM credentials rotated"
    );

    let msg = UpdateIamPolicyMessage {
        iam_id: id.to_string(),
        old_policy_name,
        new_policy_name,
        document: policy.document.clone(),
        timestamp: 0,
    };
    if let Err(err) = state.publisher.publish_iam_policy_update(msg).await {
        tracing::error!(error = %err, "policy rename publish failed; credentials remain rotated");
    }

    Ok(Json(json!({
        "message": "IAM credentials updated successfully",
        "iam_id": id,
    })))
}

async fn load_owned_iam_user(
    state: &AppState,
    id: Uuid,
    user_id: Uuid,
) -> Result<IamUser, ApiError> {
    let iam_user = state
        .repo
        .get_iam_user(id)
        .await
        .map_err(|err| {
            tracing::error!(iam_id = %id, error = %err, "IAM lookup failed");
            internal_error("Failed to look up IAM user")
        })?
        .ok_or_else(|| not_found("IAM user not found"))?;
    if iam_user.owner_user_id != user_id {
        tracing::warn!(iam_id = %id, user_id = %user_id, "IAM access denied");
        return Err(forbidden(
            "Forbidden: you don't have permission to manage this IAM user",
        ));
    }
    Ok(iam_user)
}

/// Admin role cannot be minted through the public API; absent or admin
/// requests collapse to `user`.
fn effective_role(requested: &str) -> String {
    if requested.is_empty() || requested == "admin" {
        return "user".to_string();
    }
    requested.to_string()
}

async fn restore_admin_user(state: &AppState, iam_user: &IamUser) {
    if let Err(err) = state
        .admin
        .add_user(&iam_user.access_key, &iam_user.secret_key)
        .await
    {
        tracing::error!(
            access_key = %mask_access_key(&iam_user.access_key),
            error = %err,
            "old admin user restore failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::effective_role;

    #[test]
    fn admin_role_is_coerced_to_user() {
        assert_eq!(effective_role("admin"), "user");
        assert_eq!(effective_role(""), "user");
    }

    #[test]
    fn other_roles_pass_through() {
        assert_eq!(effective_role("user"), "user");
        assert_eq!(effective_role("viewer"), "viewer");
    }
}
