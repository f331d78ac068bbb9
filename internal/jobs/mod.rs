use crate::events::{self, EventPublisher};
use crate::meta::models::UploadStatus;
use crate::meta::repos::Repo;
use crate::obs::Metrics;
use crate::storage::admin::AdminClient;
use crate::storage::store::ObjectStore;
use crate::util::config::Config;
use chrono::Utc;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

pub mod bucket;
pub mod iam;
pub mod object;
pub mod upload;

pub(crate) const MAX_ATTEMPTS: u32 = 3;

/// Shared handles for every queue consumer. Clones are cheap; the worker
/// binary builds one and hands it to each consumer task.
#[derive(Clone)]
pub struct WorkerContext {
    pub repo: Repo,
    pub store: ObjectStore,
    pub admin: AdminClient,
    pub publisher: EventPublisher,
    pub metrics: Arc<Metrics>,
}

/// Disposition of a consumed delivery under the uniform retry discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Ack,
    Requeue,
    Drop,
}

impl JobOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Requeue => "requeue",
            Self::Drop => "drop",
        }
    }
}

/// Starts one consumer task per queue on a fresh channel.
pub async fn start_consumers(ctx: WorkerContext, conn: &Connection) -> Result<(), String> {
    let channel = events::open_channel(conn).await?;
    events::declare_topology(&channel).await?;
    upload::start(ctx.clone(), &channel).await?;
    object::start(ctx.clone(), &channel).await?;
    bucket::start(ctx.clone(), &channel).await?;
    iam::start(ctx, &channel).await
}

pub(crate) async fn spawn_consumer<F, Fut>(
    ctx: WorkerContext,
    channel: &Channel,
    queue: &'static str,
    handler: F,
) -> Result<(), String>
where
    F: Fn(WorkerContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    let mut consumer = channel
        .basic_consume(
            queue.into(),
            format!("cos-{queue}").as_str().into(),
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|err| format!("consume failed for {queue}: {err}"))?;
    tracing::info!(queue, "consumer started");
    tokio::spawn(async move {
        while let Some(next) = consumer.next().await {
            let delivery = match next {
                Ok(delivery) => delivery,
                Err(err) => {
                    tracing::warn!(queue, error = %err, "delivery stream error");
                    break;
                }
            };
            let payload = delivery.data.clone();
            let outcome = handler(ctx.clone(), payload).await;
            finish_delivery(&delivery, outcome, queue, &ctx.metrics).await;
        }
        tracing::info!(queue, "consumer channel closed; stopping");
    });
    Ok(())
}

async fn finish_delivery(
    delivery: &Delivery,
    outcome: JobOutcome,
    queue: &str,
    metrics: &Metrics,
) {
    let result = match outcome {
        JobOutcome::Ack => delivery.ack(BasicAckOptions::default()).await,
        JobOutcome::Requeue => {
            delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..BasicNackOptions::default()
                })
                .await
        }
        JobOutcome::Drop => {
            delivery
                .nack(BasicNackOptions {
                    requeue: false,
                    ..BasicNackOptions::default()
                })
                .await
        }
    };
    if let Err(err) = result {
        tracing::warn!(queue, error = %err, "delivery settle failed");
    }
    metrics
        .queue_jobs
        .with_label_values(&[queue, outcome.label()])
        .inc();
}

pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(u64::from(attempt) * 2)
}

/// Worker-local retry: up to `max_attempts` tries with `attempt * 2` second
/// waits in between. Broker-side retry headers are deliberately not used.
pub(crate) async fn run_with_retries<T, F, Fut>(
    max_attempts: u32,
    what: &str,
    mut operation: F,
) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let mut last_err = String::new();
    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::error!(what, attempt, max_attempts, error = %err, "job step failed");
                last_err = err;
                if attempt < max_attempts {
                    sleep(backoff_delay(attempt)).await;
                }
            }
        }
    }
    Err(last_err)
}

pub(crate) fn decode_payload<T: DeserializeOwned>(payload: &[u8], queue: &str) -> Option<T> {
    match serde_json::from_slice(payload) {
        Ok(msg) => Some(msg),
        Err(err) => {
            tracing::error!(queue, error = %err, "malformed payload");
            None
        }
    }
}

pub(crate) fn parse_id(raw: &str, what: &str) -> Option<Uuid> {
    match Uuid::parse_str(raw) {
        Ok(id) => Some(id),
        Err(err) => {
            tracing::error!(what, error = %err, "invalid id in payload");
            None
        }
    }
}

/// Periodic purge of sessions past `expires_at`. PROCESSING sessions are
/// skipped (a finalize worker may still be running) and COMPLETED/FAILED
/// rows stay for status polling.
pub fn start_session_sweeper(config: Config, repo: Repo, store: ObjectStore) {
    tokio::spawn(async move {
        loop {
            sleep(config.sweep_interval).await;
            sweep_expired_sessions_once(&repo, &store).await;
        }
    });
}

pub async fn sweep_expired_sessions_once(repo: &Repo, store: &ObjectStore) {
    let sessions = match repo.list_expired_sessions(Utc::now()).await {
        Ok(sessions) => sessions,
        Err(err) => {
            tracing::warn!(error = %err, "expired session lookup failed");
            return;
        }
    };
    for session in sessions {
        if session.parsed_status() != Some(UploadStatus::Expired) {
            if let Err(err) = repo
                .update_session_status(session.id, UploadStatus::Expired)
                .await
            {
                tracing::warn!(session_id = %session.id, error = %err, "expire mark failed");
                continue;
            }
        }
        if let Err(err) = store
            .delete_objects_with_prefix(&session.temp_bucket, &session.temp_prefix)
            .await
        {
            tracing::warn!(session_id = %session.id, error = %err, "expired chunk cleanup failed");
            continue;
        }
        if let Err(err) = repo.delete_upload_session(session.id).await {
            tracing::warn!(session_id = %session.id, error = %err, "expired session delete failed");
        } else {
            tracing::info!(session_id = %session.id, "expired upload session purged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{backoff_delay, decode_payload, parse_id, run_with_retries, JobOutcome};
    use crate::events::DeleteObjectMessage;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn backoff_is_linear_in_attempts() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(6));
    }

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(JobOutcome::Ack.label(), "ack");
        assert_eq!(JobOutcome::Requeue.label(), "requeue");
        assert_eq!(JobOutcome::Drop.label(), "drop");
    }

    #[test]
    fn decode_payload_rejects_malformed_json() {
        let decoded: Option<DeleteObjectMessage> = decode_payload(b"{not json", "object.delete");
        assert!(decoded.is_none());
        let decoded: Option<DeleteObjectMessage> = decode_payload(
            br#"{"bucket_name":"b","object_path":"k","user_id":"u"}"#,
            "object.delete",
        );
        assert!(decoded.is_some());
    }

    #[test]
    fn parse_id_validates_uuids() {
        assert!(parse_id("not-a-uuid", "upload_id").is_none());
        let id = Uuid::new_v4();
        assert_eq!(parse_id(&id.to_string(), "upload_id"), Some(id));
    }

    #[tokio::test]
    async fn retries_stop_on_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = run_with_retries(3, "test", || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_surface_last_error_after_exhaustion() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = run_with_retries(1, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("persistent".to_string()) }
        })
        .await;
        assert_eq!(result, Err("persistent".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
