use crate::events::{
    DeleteBucketMessage, UpdateBucketPolicyMessage, BUCKET_DELETE_QUEUE, BUCKET_POLICY_QUEUE,
};
use crate::jobs::{
    decode_payload, parse_id, run_with_retries, spawn_consumer, JobOutcome, WorkerContext,
    MAX_ATTEMPTS,
};
use crate::meta::models::IamUser;
use crate::policy::{policy_name_for, PolicyDocument, POLICY_TYPE_S3};
use crate::util::mask::mask_access_key;
use lapin::Channel;
use uuid::Uuid;

pub(crate) async fn start(ctx: WorkerContext, channel: &Channel) -> Result<(), String> {
    spawn_consumer(ctx.clone(), channel, BUCKET_DELETE_QUEUE, |ctx, payload| {
        handle_delete_bucket(ctx, payload)
    })
    .await?;
    spawn_consumer(ctx, channel, BUCKET_POLICY_QUEUE, |ctx, payload| {
        handle_update_policy(ctx, payload)
    })
    .await
}

/// Store-side bucket removal after the catalog row is already gone. This
/// is best-effort cleanup: after the retries run out the job is dropped,
/// not requeued.
async fn handle_delete_bucket(ctx: WorkerContext, payload: Vec<u8>) -> JobOutcome {
    let Some(msg) = decode_payload::<DeleteBucketMessage>(&payload, BUCKET_DELETE_QUEUE) else {
        return JobOutcome::Drop;
    };
    let result = run_with_retries(MAX_ATTEMPTS, "delete bucket", || {
        ctx.store.delete_bucket_with_objects(&msg.bucket_name)
    })
    .await;
    match result {
        Ok(()) => {
            tracing::info!(bucket = %msg.bucket_name, "bucket deleted at store");
            JobOutcome::Ack
        }
        Err(err) => {
            tracing::error!(
                bucket = %msg.bucket_name,
                error = %err,
                "bucket delete exhausted retries; dropping"
            );
            JobOutcome::Drop
        }
    }
}

/// Rewrites every IAM policy owned by the user so it covers the new
/// bucket. Idempotent: already-present ARNs are never duplicated.
async fn handle_update_policy(ctx: WorkerContext, payload: Vec<u8>) -> JobOutcome {
    let Some(msg) = decode_payload::<UpdateBucketPolicyMessage>(&payload, BUCKET_POLICY_QUEUE)
    else {
        return JobOutcome::Drop;
    };
    let Some(user_id) = parse_id(&msg.user_id, "user_id") else {
        return JobOutcome::Drop;
    };
    let result = run_with_retries(MAX_ATTEMPTS, "bucket policy rewrite", || {
        rewrite_policies_for_user(&ctx, user_id, &msg.bucket_name)
    })
    .await;
    match result {
        Ok(()) => {
            tracing::info!(user_id = %user_id, bucket = %msg.bucket_name, "policies updated");
            JobOutcome::Ack
        }
        Err(err) => {
            tracing::error!(
                user_id = %user_id,
                bucket = %msg.bucket_name,
                error = %err,
                "policy rewrite exhausted retries; requeueing"
            );
            JobOutcome::Requeue
        }
    }
}

/// One IAM user's failure does not stop the others; any failure schedules
/// a requeue so the stragglers converge on a later delivery.
async fn rewrite_policies_for_user(
    ctx: &WorkerContext,
    user_id: Uuid,
    bucket_name: &str,
) -> Result<(), String> {
    let iam_users = ctx
        .repo
        .list_iam_users(user_id)
        .await
        .map_err(|err| format!("iam user lookup failed: {err}"))?;
    if iam_users.is_empty() {
        tracing::info!(user_id = %user_id, "no IAM users to update");
        return Ok(());
    }
    let mut failures = 0usize;
    for iam_user in &iam_users {
        if let Err(err) = rewrite_single_policy(ctx, iam_user, bucket_name).await {
            tracing::error!(
                access_key = %mask_access_key(&iam_user.access_key),
                error = %err,
                "policy rewrite failed for IAM user"
            );
            failures += 1;
        }
    }
    if failures > 0 {
        return Err(format!(
            "{failures} of {} IAM users failed policy rewrite",
            iam_users.len()
        ));
    }
    Ok(())
}

async fn rewrite_single_policy(
    ctx: &WorkerContext,
    iam_user: &IamUser,
    bucket_name: &str,
) -> Result<(), String> {
    let policy = ctx
        .repo
        .get_policy_by_iam_and_type(iam_user.id, POLICY_TYPE_S3)
        .await
        .map_err(|err| format!("policy lookup failed: {err}"))?
        .ok_or_else(|| format!("no s3 policy for IAM user {}", iam_user.id))?;

    let mut document = PolicyDocument::from_value(&policy.document)
        .map_err(|err| format!("policy parse failed: {err}"))?;
    document.grant_bucket(bucket_name);
    let updated = document
        .to_value()
        .map_err(|err| format!("policy serialize failed: {err}"))?;

    let policy_name = policy_name_for(&iam_user.access_key);
    // The old admin-side policy may already be gone; that is not fatal.
    if let Err(err) = ctx.admin.remove_canned_policy(&policy_name).await {
        tracing::warn!(policy_name, error = %err, "old policy removal failed");
    }
    ctx.admin.add_canned_policy(&policy_name, &updated).await?;
    ctx.admin
        .attach_policy_to_user(&iam_user.access_key, &policy_name)
        .await?;

    ctx.repo
        .update_policy_document(policy.id, &updated)
        .await
        .map_err(|err| format!("policy persist failed: {err}"))?;
    tracing::info!(
        access_key = %mask_access_key(&iam_user.access_key),
        bucket = bucket_name,
        "policy rewritten"
    );
    Ok(())
}
