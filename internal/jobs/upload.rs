use crate::events::{
    upload_type_for_extension, ChunkCompleteMessage, ChunkedUploadMessage, ComposeCompletedMessage,
    CHUNKED_UPLOAD_QUEUE, CHUNK_COMPLETE_QUEUE, COMPOSE_COMPLETED_QUEUE,
};
use crate::jobs::{
    decode_payload, parse_id, run_with_retries, spawn_consumer, JobOutcome, WorkerContext,
    MAX_ATTEMPTS,
};
use crate::meta::models::{Object, UploadStatus};
use crate::meta::repos::Repo;
use crate::util::paths::{composed_key, file_extension, hashed_object_name};
use chrono::Utc;
use lapin::Channel;
use uuid::Uuid;

pub(crate) async fn start(ctx: WorkerContext, channel: &Channel) -> Result<(), String> {
    spawn_consumer(ctx.clone(), channel, CHUNK_COMPLETE_QUEUE, |ctx, payload| {
        handle_chunk_complete(ctx, payload)
    })
    .await?;
    spawn_consumer(ctx, channel, COMPOSE_COMPLETED_QUEUE, |ctx, payload| {
        handle_compose_completed(ctx, payload)
    })
    .await
}

/// Compose, hash and finalize one chunked upload. Storage steps run under
/// the shared retry discipline; once the catalog row exists the job never
/// rolls back, it only reports downstream.
async fn handle_chunk_complete(ctx: WorkerContext, payload: Vec<u8>) -> JobOutcome {
    let Some(msg) = decode_payload::<ChunkCompleteMessage>(&payload, CHUNK_COMPLETE_QUEUE) else {
        return JobOutcome::Drop;
    };
    let Some(upload_id) = parse_id(&msg.upload_id, "upload_id") else {
        return JobOutcome::Drop;
    };
    let Some(bucket_id) = parse_id(&msg.bucket_id, "bucket_id") else {
        return JobOutcome::Drop;
    };

    match validate_session(&ctx.repo, upload_id).await {
        SessionCheck::Ready => {}
        SessionCheck::AlreadySettled => return JobOutcome::Ack,
        SessionCheck::Missing => {
            tracing::error!(upload_id = %upload_id, "upload session vanished; dropping job");
            return JobOutcome::Drop;
        }
        SessionCheck::Unavailable => return JobOutcome::Requeue,
    }

    tracing::info!(upload_id = %upload_id, bucket = %msg.bucket_name, "finalizing chunked upload");

    let chunks = match list_chunks(&ctx, &msg).await {
        Ok(chunks) => chunks,
        Err(err) => {
            tracing::error!(upload_id = %upload_id, error = %err, "chunk enumeration failed");
            fail_session(&ctx, upload_id).await;
            return JobOutcome::Requeue;
        }
    };
    if chunks.len() != msg.total_chunks as usize {
        tracing::error!(
            upload_id = %upload_id,
            expected = msg.total_chunks,
            found = chunks.len(),
            "missing chunks"
        );
        fail_session(&ctx, upload_id).await;
        return JobOutcome::Drop;
    }

    let ext = file_extension(&msg.file_name);
    let composed = composed_key(&msg.temp_prefix, &ext);
    if let Err(err) = compose_chunks(&ctx, &msg, &chunks, &composed).await {
        tracing::error!(upload_id = %upload_id, error = %err, "compose failed");
        fail_session(&ctx, upload_id).await;
        return JobOutcome::Requeue;
    }

    let (file_hash, composed_size) = match hash_composed(&ctx, &msg, &composed).await {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(upload_id = %upload_id, error = %err, "hash failed");
            fail_session(&ctx, upload_id).await;
            return JobOutcome::Requeue;
        }
    };

    let staged = hashed_object_name(&file_hash, &ext);
    if let Err(err) = stage_composed(&ctx, &msg, &composed, &staged).await {
        tracing::error!(upload_id = %upload_id, error = %err, "staging copy failed");
        fail_session(&ctx, upload_id).await;
        return JobOutcome::Requeue;
    }

    cleanup_intermediates(&ctx, &msg, chunks, composed);

    if let Err(err) = ctx.repo.update_session_file_hash(upload_id, &file_hash).await {
        tracing::warn!(upload_id = %upload_id, error = %err, "file hash persist failed");
    }

    let object = Object {
        id: Uuid::new_v4(),
        bucket_id,
        origin_name: msg.file_name.clone(),
        parent_path: msg.custom_path.clone(),
        content_type: msg.content_type.clone(),
        size: composed_size,
        url: staged.clone(),
        file_hash: file_hash.clone(),
        created_at: Utc::now(),
        last_modified: Utc::now(),
    };
    if let Err(err) = ctx.repo.create_object(&object).await {
        tracing::error!(upload_id = %upload_id, error = %err, "object row insert failed");
        fail_session(&ctx, upload_id).await;
        return JobOutcome::Requeue;
    }

    publish_move_job(&ctx, &msg, &ext, &file_hash, composed_size, &staged).await;

    if let Err(err) = ctx
        .repo
        .update_session_status(upload_id, UploadStatus::Completed)
        .await
    {
        tracing::warn!(upload_id = %upload_id, error = %err, "completion mark failed");
    }
    ctx.metrics
        .sessions_finished
        .with_label_values(&["COMPLETED"])
        .inc();
    tracing::info!(
        upload_id = %upload_id,
        object_id = %object.id,
        file_hash = %file_hash,
        "chunked upload finalized"
    );
    JobOutcome::Ack
}

enum SessionCheck {
    Ready,
    AlreadySettled,
    Missing,
    Unavailable,
}

/// Row-locked status check so a redelivered job cannot finalize a session
/// that already settled.
async fn validate_session(repo: &Repo, upload_id: Uuid) -> SessionCheck {
    let mut tx = match repo.pool().begin().await {
        Ok(tx) => tx,
        Err(err) => {
            tracing::warn!(error = %err, "session lock begin failed");
            return SessionCheck::Unavailable;
        }
    };
    let session = match Repo::lock_upload_session(&mut tx, upload_id).await {
        Ok(session) => session,
        Err(err) => {
            tracing::warn!(error = %err, "session lock failed");
            return SessionCheck::Unavailable;
        }
    };
    let check = match session {
        None => SessionCheck::Missing,
        Some(session) => match session.parsed_status() {
            Some(status) if status.is_terminal() => SessionCheck::AlreadySettled,
            _ => SessionCheck::Ready,
        },
    };
    if let Err(err) = tx.commit().await {
        tracing::warn!(error = %err, "session lock commit failed");
    }
    check
}

async fn list_chunks(
    ctx: &WorkerContext,
    msg: &ChunkCompleteMessage,
) -> Result<Vec<String>, String> {
    let keys = run_with_retries(MAX_ATTEMPTS, "list chunks", || {
        ctx.store
            .list_keys_with_prefix(&msg.temp_bucket, &msg.temp_prefix)
    })
    .await?;
    // Leftovers from an earlier attempt (a composed object, the staged
    // copy) must not count as chunks.
    let chunk_prefix = format!("{}chunk_", msg.temp_prefix);
    let mut chunks: Vec<String> = keys
        .into_iter()
        .filter(|key| key.starts_with(&chunk_prefix))
        .collect();
    chunks.sort();
    Ok(chunks)
}

async fn compose_chunks(
    ctx: &WorkerContext,
    msg: &ChunkCompleteMessage,
    chunks: &[String],
    composed: &str,
) -> Result<(), String> {
    run_with_retries(MAX_ATTEMPTS, "compose chunks", || {
        ctx.store
            .compose_object(&msg.temp_bucket, chunks, composed, &msg.content_type)
    })
    .await
}

async fn hash_composed(
    ctx: &WorkerContext,
    msg: &ChunkCompleteMessage,
    composed: &str,
) -> Result<(String, i64), String> {
    run_with_retries(MAX_ATTEMPTS, "hash composed object", || {
        ctx.store.sha256_of_object(&msg.temp_bucket, composed)
    })
    .await
}

async fn stage_composed(
    ctx: &WorkerContext,
    msg: &ChunkCompleteMessage,
    composed: &str,
    staged: &str,
) -> Result<(), String> {
    run_with_retries(MAX_ATTEMPTS, "stage composed object", || {
        ctx.store
            .copy_object(&msg.temp_bucket, composed, &msg.temp_bucket, staged)
    })
    .await
}

/// Best-effort removal of the chunk files and the composed intermediate,
/// off the job's critical path.
fn cleanup_intermediates(
    ctx: &WorkerContext,
    msg: &ChunkCompleteMessage,
    chunks: Vec<String>,
    composed: String,
) {
    let store = ctx.store.clone();
    let temp_bucket = msg.temp_bucket.clone();
    tokio::spawn(async move {
        for key in chunks.iter().chain(std::iter::once(&composed)) {
            if let Err(err) = store.delete_object(&temp_bucket, key).await {
                tracing::warn!(key, error = %err, "intermediate cleanup failed");
            }
        }
    });
}

/// Final-location folder of a finished upload: the hash itself at the
/// bucket root, or nested under the custom path.
fn staging_target_folder(custom_path: &str, file_hash: &str) -> String {
    if custom_path.is_empty() {
        return file_hash.to_string();
    }
    format!("{custom_path}/{file_hash}")
}

async fn publish_move_job(
    ctx: &WorkerContext,
    msg: &ChunkCompleteMessage,
    ext: &str,
    file_hash: &str,
    file_size: i64,
    staged: &str,
) {
    let target_folder = staging_target_folder(&msg.custom_path, file_hash);
    let move_job = ChunkedUploadMessage {
        upload_type: upload_type_for_extension(ext).to_string(),
        temp_bucket: msg.temp_bucket.clone(),
        temp_path: staged.to_string(),
        target_bucket: msg.bucket_name.clone(),
        target_folder,
        original_name: msg.file_name.clone(),
        file_hash: file_hash.to_string(),
        file_size,
        timestamp: 0,
    };
    // The object row is already valid (its URL is hash-derived), so a
    // publish failure only delays the move; it does not fail the job.
    if let Err(err) = ctx.publisher.publish_chunked_upload(move_job).await {
        tracing::error!(error = %err, "downstream move publish failed");
    }
}

async fn fail_session(ctx: &WorkerContext, upload_id: Uuid) {
    if let Err(err) = ctx
        .repo
        .update_session_status(upload_id, UploadStatus::Failed)
        .await
    {
        tracing::warn!(upload_id = %upload_id, error = %err, "failure mark failed");
    }
    ctx.metrics
        .sessions_finished
        .with_label_values(&["FAILED"])
        .inc();
}

/// The external uploader composed and moved the file itself and reports
/// the outcome; reconcile the catalog accordingly.
async fn handle_compose_completed(ctx: WorkerContext, payload: Vec<u8>) -> JobOutcome {
    let Some(msg) = decode_payload::<ComposeCompletedMessage>(&payload, COMPOSE_COMPLETED_QUEUE)
    else {
        return JobOutcome::Drop;
    };
    let Some(upload_id) = parse_id(&msg.upload_id, "upload_id") else {
        return JobOutcome::Drop;
    };
    let Some(bucket_id) = parse_id(&msg.bucket_id, "bucket_id") else {
        return JobOutcome::Drop;
    };

    if !msg.success {
        tracing::error!(upload_id = %upload_id, error = %msg.error, "uploader reported failure");
        fail_session(&ctx, upload_id).await;
        return JobOutcome::Ack;
    }

    if let Err(err) = ctx
        .repo
        .update_session_file_hash(upload_id, &msg.file_hash)
        .await
    {
        tracing::warn!(upload_id = %upload_id, error = %err, "file hash persist failed");
    }

    let ext = file_extension(&msg.file_name);
    let object = Object {
        id: Uuid::new_v4(),
        bucket_id,
        origin_name: msg.file_name.clone(),
        parent_path: msg.custom_path.clone(),
        content_type: msg.content_type.clone(),
        size: msg.file_size,
        url: hashed_object_name(&msg.file_hash, &ext),
        file_hash: msg.file_hash.clone(),
        created_at: Utc::now(),
        last_modified: Utc::now(),
    };
    if let Err(err) = ctx.repo.create_object(&object).await {
        tracing::error!(upload_id = %upload_id, error = %err, "object row insert failed");
        fail_session(&ctx, upload_id).await;
        return JobOutcome::Requeue;
    }

    if let Err(err) = ctx
        .repo
        .update_session_status(upload_id, UploadStatus::Completed)
        .await
    {
        tracing::warn!(upload_id = %upload_id, error = %err, "completion mark failed");
    }
    ctx.metrics
        .sessions_finished
        .with_label_values(&["COMPLETED"])
        .inc();
    tracing::info!(upload_id = %upload_id, object_id = %object.id, "uploader-composed upload recorded");
    JobOutcome::Ack
}

#[cfg(test)]
mod tests {
    use super::staging_target_folder;

    #[test]
    fn target_folder_nests_hash_under_custom_path() {
        assert_eq!(staging_target_folder("", "abc123"), "abc123");
        assert_eq!(staging_target_folder("docs/2024", "abc123"), "docs/2024/abc123");
    }
}
