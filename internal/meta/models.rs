use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IamUser {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub access_key: String,
    pub secret_key: String,
    pub name: String,
    pub email: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IamPolicy {
    pub id: Uuid,
    pub iam_id: Uuid,
    pub policy_type: String,
    pub document: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Bucket {
    pub id: Uuid,
    pub name: String,
    pub region: String,
    pub owner_user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Object {
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub origin_name: String,
    pub parent_path: String,
    pub content_type: String,
    pub size: i64,
    pub url: String,
    pub file_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// Lifecycle of a chunked upload. Only COMPLETED, FAILED and EXPIRED are
/// terminal; the sweeper leaves PROCESSING sessions alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Init,
    Uploading,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Uploading => "UPLOADING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "INIT" => Some(Self::Init),
            "UPLOADING" => Some(Self::Uploading),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }

    /// A session accepts chunk writes and finalization only while active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Init | Self::Uploading)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UploadSession {
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub user_id: Uuid,
    pub file_name: String,
    pub file_size: i64,
    pub content_type: String,
    pub custom_path: String,
    pub chunk_size: i64,
    pub total_chunks: i32,
    pub uploaded_chunks: i32,
    pub status: String,
    pub temp_bucket: String,
    pub temp_prefix: String,
    pub file_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn parsed_status(&self) -> Option<UploadStatus> {
        UploadStatus::parse(&self.status)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::UploadStatus;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            UploadStatus::Init,
            UploadStatus::Uploading,
            UploadStatus::Processing,
            UploadStatus::Completed,
            UploadStatus::Failed,
            UploadStatus::Expired,
        ] {
            assert_eq!(UploadStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(UploadStatus::parse("BOGUS"), None);
    }

    #[test]
    fn only_completed_failed_expired_are_terminal() {
        assert!(UploadStatus::Completed.is_terminal());
        assert!(UploadStatus::Failed.is_terminal());
        assert!(UploadStatus::Expired.is_terminal());
        assert!(!UploadStatus::Init.is_terminal());
        assert!(!UploadStatus::Uploading.is_terminal());
        assert!(!UploadStatus::Processing.is_terminal());
    }

    #[test]
    fn only_init_and_uploading_accept_chunks() {
        assert!(UploadStatus::Init.is_active());
        assert!(UploadStatus::Uploading.is_active());
        assert!(!UploadStatus::Processing.is_active());
        assert!(!UploadStatus::Completed.is_active());
    }
}
