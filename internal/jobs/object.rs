use crate::events::{DeleteObjectMessage, DeletePathMessage, OBJECT_DELETE_QUEUE, PATH_DELETE_QUEUE};
use crate::jobs::{
    decode_payload, run_with_retries, spawn_consumer, JobOutcome, WorkerContext, MAX_ATTEMPTS,
};
use lapin::Channel;

pub(crate) async fn start(ctx: WorkerContext, channel: &Channel) -> Result<(), String> {
    spawn_consumer(ctx.clone(), channel, OBJECT_DELETE_QUEUE, |ctx, payload| {
        handle_delete_object(ctx, payload)
    })
    .await?;
    spawn_consumer(ctx, channel, PATH_DELETE_QUEUE, |ctx, payload| {
        handle_delete_path(ctx, payload)
    })
    .await
}

/// Removes one physical object. Deleting a key that is already gone is a
/// success at the store, so redelivery is harmless.
async fn handle_delete_object(ctx: WorkerContext, payload: Vec<u8>) -> JobOutcome {
    let Some(msg) = decode_payload::<DeleteObjectMessage>(&payload, OBJECT_DELETE_QUEUE) else {
        return JobOutcome::Drop;
    };
    let result = run_with_retries(MAX_ATTEMPTS, "delete object", || {
        ctx.store.delete_object(&msg.bucket_name, &msg.object_path)
    })
    .await;
    match result {
        Ok(()) => {
            tracing::info!(bucket = %msg.bucket_name, key = %msg.object_path, "object deleted");
            JobOutcome::Ack
        }
        Err(err) => {
            tracing::error!(
                bucket = %msg.bucket_name,
                key = %msg.object_path,
                error = %err,
                "object delete exhausted retries; requeueing"
            );
            JobOutcome::Requeue
        }
    }
}

/// Removes every store object whose key begins with `path/`.
async fn handle_delete_path(ctx: WorkerContext, payload: Vec<u8>) -> JobOutcome {
    let Some(msg) = decode_payload::<DeletePathMessage>(&payload, PATH_DELETE_QUEUE) else {
        return JobOutcome::Drop;
    };
    let prefix = format!("{}/", msg.path);
    let result = run_with_retries(MAX_ATTEMPTS, "delete path", || {
        ctx.store
            .delete_objects_with_prefix(&msg.bucket_name, &prefix)
    })
    .await;
    match result {
        Ok(()) => {
            tracing::info!(bucket = %msg.bucket_name, prefix = %prefix, "path deleted");
            JobOutcome::Ack
        }
        Err(err) => {
            tracing::error!(
                bucket = %msg.bucket_name,
                prefix = %prefix,
                error = %err,
                "path delete exhausted retries; requeueing"
            );
            JobOutcome::Requeue
        }
    }
}
