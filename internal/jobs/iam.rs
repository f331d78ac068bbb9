use crate::events::{UpdateIamPolicyMessage, IAM_POLICY_QUEUE};
use crate::jobs::{
    decode_payload, parse_id, run_with_retries, spawn_consumer, JobOutcome, WorkerContext,
    MAX_ATTEMPTS,
};
use crate::util::mask::mask_access_key;
use lapin::Channel;
use serde_json::Value;
use uuid::Uuid;

pub(crate) async fn start(ctx: WorkerContext, channel: &Channel) -> Result<(), String> {
    spawn_consumer(ctx, channel, IAM_POLICY_QUEUE, |ctx, payload| {
        handle_update_policy(ctx, payload)
    })
    .await
}

/// Renames the admin-side policy after a credential rotation. Each step
/// carries its inverse so a mid-sequence failure leaves the old policy in
/// place instead of a half-renamed state.
async fn handle_update_policy(ctx: WorkerContext, payload: Vec<u8>) -> JobOutcome {
    let Some(msg) = decode_payload::<UpdateIamPolicyMessage>(&payload, IAM_POLICY_QUEUE) else {
        return JobOutcome::Drop;
    };
    let Some(iam_id) = parse_id(&msg.iam_id, "iam_id") else {
        return JobOutcome::Drop;
    };
    let result = run_with_retries(MAX_ATTEMPTS, "iam policy rename", || {
        rename_policy(
            &ctx,
            iam_id,
            &msg.old_policy_name,
            &msg.new_policy_name,
            &msg.document,
        )
    })
    .await;
    match result {
        Ok(()) => {
            tracing::info!(iam_id = %iam_id, new_policy = %msg.new_policy_name, "policy renamed");
            JobOutcome::Ack
        }
        Err(err) => {
            tracing::error!(
                iam_id = %iam_id,
                error = %err,
                "policy rename exhausted retries; requeueing"
            );
            JobOutcome::Requeue
        }
    }
}

async fn rename_policy(
    ctx: &WorkerContext,
    iam_id: Uuid,
    old_name: &str,
    new_name: &str,
    document: &Value,
) -> Result<(), String> {
    ctx.admin.remove_canned_policy(old_name).await?;

    if let Err(err) = ctx.admin.add_canned_policy(new_name, document).await {
        restore_old_policy(ctx, old_name, document).await;
        return Err(format!("new policy create failed: {err}"));
    }

    let iam_user = match ctx.repo.get_iam_user(iam_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            ctx.admin.best_effort_remove_policy(new_name).await;
            restore_old_policy(ctx, old_name, document).await;
            return Err(format!("IAM user {iam_id} not found"));
        }
        Err(err) => {
            ctx.admin.best_effort_remove_policy(new_name).await;
            restore_old_policy(ctx, old_name, document).await;
            return Err(format!("IAM user lookup failed: {err}"));
        }
    };

    if let Err(err) = ctx
        .admin
        .attach_policy_to_user(&iam_user.access_key, new_name)
        .await
    {
        ctx.admin.best_effort_remove_policy(new_name).await;
        restore_old_policy(ctx, old_name, document).await;
        if let Err(attach_err) = ctx
            .admin
            .attach_policy_to_user(&iam_user.access_key, old_name)
            .await
        {
            tracing::error!(
                access_key = %mask_access_key(&iam_user.access_key),
                error = %attach_err,
                "old policy re-attach failed"
            );
        }
        return Err(format!("new policy attach failed: {err}"));
    }

    tracing::info!(
        access_key = %mask_access_key(&iam_user.access_key),
        old_policy = old_name,
        new_policy = new_name,
        "admin-side policy follows rotated credentials"
    );
    Ok(())
}

async fn restore_old_policy(ctx: &WorkerContext, old_name: &str, document: &Value) {
    if let Err(err) = ctx.admin.add_canned_policy(old_name, document).await {
        tracing::error!(policy_name = old_name, error = %err, "old policy restore failed");
    }
}
