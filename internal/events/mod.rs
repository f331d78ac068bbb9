use chrono::Utc;
use lapin::options::{
    BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const UPLOAD_EXCHANGE: &str = "upload.exchange";
pub const BUCKET_EXCHANGE: &str = "bucket.exchange";
pub const IAM_EXCHANGE: &str = "iam.exchange";

pub const CHUNK_COMPLETE_QUEUE: &str = "upload.chunk_complete";
pub const CHUNKED_UPLOAD_QUEUE: &str = "upload.chunked";
pub const COMPOSE_COMPLETED_QUEUE: &str = "upload.compose_completed";
pub const OBJECT_DELETE_QUEUE: &str = "object.delete";
pub const PATH_DELETE_QUEUE: &str = "object.delete_path";
pub const BUCKET_DELETE_QUEUE: &str = "bucket.delete";
pub const BUCKET_POLICY_QUEUE: &str = "bucket.update.policy";
pub const IAM_POLICY_QUEUE: &str = "iam.update.policy";

/// Every queue binds to its domain's topic exchange under a routing key
/// equal to the queue name.
const TOPOLOGY: [(&str, &str); 8] = [
    (UPLOAD_EXCHANGE, CHUNK_COMPLETE_QUEUE),
    (UPLOAD_EXCHANGE, CHUNKED_UPLOAD_QUEUE),
    (UPLOAD_EXCHANGE, COMPOSE_COMPLETED_QUEUE),
    (UPLOAD_EXCHANGE, OBJECT_DELETE_QUEUE),
    (UPLOAD_EXCHANGE, PATH_DELETE_QUEUE),
    (BUCKET_EXCHANGE, BUCKET_DELETE_QUEUE),
    (BUCKET_EXCHANGE, BUCKET_POLICY_QUEUE),
    (IAM_EXCHANGE, IAM_POLICY_QUEUE),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkCompleteMessage {
    pub upload_id: String,
    pub bucket_id: String,
    pub bucket_name: String,
    pub user_id: String,
    pub temp_bucket: String,
    pub temp_prefix: String,
    pub file_name: String,
    pub file_size: i64,
    pub content_type: String,
    pub custom_path: String,
    pub total_chunks: i32,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkedUploadMessage {
    pub upload_type: String,
    pub temp_bucket: String,
    pub temp_path: String,
    pub target_bucket: String,
    pub target_folder: String,
    pub original_name: String,
    pub file_hash: String,
    pub file_size: i64,
    #[serde(default)]
    pub timestamp: i64,
}

/// Sent back by the external uploader once it has composed and moved a
/// file on our behalf; carries the outcome for catalog reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeCompletedMessage {
    pub upload_id: String,
    pub bucket_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub content_type: String,
    pub custom_path: String,
    pub file_hash: String,
    pub success: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteObjectMessage {
    pub bucket_name: String,
    pub object_path: String,
    pub user_id: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePathMessage {
    pub bucket_name: String,
    pub path: String,
    pub user_id: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteBucketMessage {
    pub user_id: String,
    pub bucket_name: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateBucketPolicyMessage {
    pub user_id: String,
    pub bucket_name: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateIamPolicyMessage {
    pub iam_id: String,
    pub old_policy_name: String,
    pub new_policy_name: String,
    pub document: Value,
    #[serde(default)]
    pub timestamp: i64,
}

/// Coarse media classification carried on the downstream move job.
pub fn upload_type_for_extension(ext: &str) -> &'static str {
    match ext {
        ".zip" | ".tar" | ".gz" | ".rar" | ".7z" => "archive",
        ".mp4" | ".avi" | ".mkv" | ".mov" | ".wmv" => "video",
        ".mp3" | ".wav" | ".flac" | ".aac" => "audio",
        ".jpg" | ".jpeg" | ".png" | ".gif" | ".webp" | ".svg" => "image",
        ".exe" | ".msi" | ".dmg" | ".deb" | ".rpm" => "executable",
        _ => "file",
    }
}

pub async fn connect(url: &str) -> Result<Connection, String> {
    Connection::connect(url, ConnectionProperties::default())
        .await
        .map_err(|err| format!("rabbit connect failed: {err}"))
}

pub async fn open_channel(conn: &Connection) -> Result<Channel, String> {
    conn.create_channel()
        .await
        .map_err(|err| format!("rabbit channel failed: {err}"))
}

/// Declares every exchange, queue and binding this service uses. Safe to
/// run from both the API process and the worker process.
pub async fn declare_topology(channel: &Channel) -> Result<(), String> {
    for exchange in [UPLOAD_EXCHANGE, BUCKET_EXCHANGE, IAM_EXCHANGE] {
        channel
            .exchange_declare(
                exchange.into(),
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| format!("exchange declare failed for {exchange}: {err}"))?;
    }
    for (exchange, queue) in TOPOLOGY {
        channel
            .queue_declare(
                queue.into(),
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| format!("queue declare failed for {queue}: {err}"))?;
        channel
            .queue_bind(
                queue.into(),
                exchange.into(),
                queue.into(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| format!("queue bind failed for {queue}: {err}"))?;
    }
    Ok(())
}

/// Publisher half of the bus. Holds one channel behind a mutex; messages
/// are persistent so queued jobs survive a broker restart.
#[derive(Clone)]
pub struct EventPublisher {
    channel: Arc<Mutex<Channel>>,
}

impl EventPublisher {
    pub async fn new(url: &str) -> Result<Self, String> {
        let conn = connect(url).await?;
        let channel = open_channel(&conn).await?;
        declare_topology(&channel).await?;
        Ok(Self {
            channel: Arc::new(Mutex::new(channel)),
        })
    }

    pub async fn publish_chunk_complete(
        &self,
        mut msg: ChunkCompleteMessage,
    ) -> Result<(), String> {
        msg.timestamp = Utc::now().timestamp();
        self.publish(UPLOAD_EXCHANGE, CHUNK_COMPLETE_QUEUE, &msg).await
    }

    pub async fn publish_chunked_upload(
        &self,
        mut msg: ChunkedUploadMessage,
    ) -> Result<(), String> {
        msg.timestamp = Utc::now().timestamp();
        self.publish(UPLOAD_EXCHANGE, CHUNKED_UPLOAD_QUEUE, &msg).await
    }

    pub async fn publish_delete_object(&self, mut msg: DeleteObjectMessage) -> Result<(), String> {
        msg.timestamp = Utc::now().timestamp();
        self.publish(UPLOAD_EXCHANGE, OBJECT_DELETE_QUEUE, &msg).await
    }

    pub async fn publish_delete_path(&self, mut msg: DeletePathMessage) -> Result<(), String> {
        msg.timestamp = Utc::now().timestamp();
        self.publish(UPLOAD_EXCHANGE, PATH_DELETE_QUEUE, &msg).await
    }

    pub async fn publish_delete_bucket(&self, mut msg: DeleteBucketMessage) -> Result<(), String> {
        msg.timestamp = Utc::now().timestamp();
        self.publish(BUCKET_EXCHANGE, BUCKET_DELETE_QUEUE, &msg).await
    }

    pub async fn publish_bucket_policy_update(
        &self,
        mut msg: UpdateBucketPolicyMessage,
    ) -> Result<(), String> {
        msg.timestamp = Utc::now().timestamp();
        self.publish(BUCKET_EXCHANGE, BUCKET_POLICY_QUEUE, &msg).await
    }

    pub async fn publish_iam_policy_update(
        &self,
        mut msg: UpdateIamPolicyMessage,
    ) -> Result<(), String> {
        msg.timestamp = Utc::now().timestamp();
        self.publish(IAM_EXCHANGE, IAM_POLICY_QUEUE, &msg).await
    }

    async fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        msg: &T,
    ) -> Result<(), String> {
        let payload =
            serde_json::to_vec(msg).map_err(|err| format!("event serialize failed: {err}"))?;
        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                exchange.into(),
                routing_key.into(),
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await
            .map_err(|err| format!("event publish failed: {err}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        upload_type_for_extension, ChunkCompleteMessage, UpdateIamPolicyMessage, TOPOLOGY,
    };
    use serde_json::json;

    #[test]
    fn every_queue_binds_under_its_own_name() {
        let queues: Vec<&str> = TOPOLOGY.iter().map(|(_, queue)| *queue).collect();
        assert_eq!(queues.len(), 8);
        assert!(queues.contains(&"upload.compose_completed"));
        assert!(queues.contains(&"upload.chunk_complete"));
        assert!(queues.contains(&"bucket.update.policy"));
        assert!(queues.contains(&"iam.update.policy"));
    }

    #[test]
    fn upload_type_classifies_known_extensions() {
        assert_eq!(upload_type_for_extension(".zip"), "archive");
        assert_eq!(upload_type_for_extension(".mp4"), "video");
        assert_eq!(upload_type_for_extension(".mp3"), "audio");
        assert_eq!(upload_type_for_extension(".png"), "image");
        assert_eq!(upload_type_for_extension(".deb"), "executable");
        assert_eq!(upload_type_for_extension(".bin"), "file");
    }

    #[test]
    fn chunk_complete_message_round_trips() {
        let msg = ChunkCompleteMessage {
            upload_id: "u1".into(),
            bucket_id: "b1".into(),
            bucket_name: "acme".into(),
            user_id: "usr".into(),
            temp_bucket: "temp-uploads".into(),
            temp_prefix: "pending/u1/".into(),
            file_name: "big.iso".into(),
            file_size: 104857600,
            content_type: "application/octet-stream".into(),
            custom_path: "isos".into(),
            total_chunks: 10,
            timestamp: 0,
        };
        let raw = serde_json::to_string(&msg).expect("serialize");
        let back: ChunkCompleteMessage = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back.upload_id, "u1");
        assert_eq!(back.total_chunks, 10);
    }

    #[test]
    fn iam_policy_message_carries_document_verbatim() {
        let msg = UpdateIamPolicyMessage {
            iam_id: "i1".into(),
            old_policy_name: "old-s3-policy".into(),
            new_policy_name: "new-s3-policy".into(),
            document: json!({"Version": "2012-10-17", "Statement": []}),
            timestamp: 0,
        };
        let raw = serde_json::to_vec(&msg).expect("serialize");
        let back: UpdateIamPolicyMessage = serde_json::from_slice(&raw).expect("deserialize");
        assert_eq!(back.document["Version"], "2012-10-17");
    }
}
