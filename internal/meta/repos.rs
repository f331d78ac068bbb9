use crate::meta::models::{Bucket, IamPolicy, IamUser, Object, UploadSession, UploadStatus};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Clone)]
pub struct Repo {
    pool: PgPool,
}

impl Repo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // --- IAM users ---

    pub async fn create_iam_user(&self, user: &IamUser) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO iam_users (id, owner_user_id, access_key, secret_key, name, email, role)
            VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(user.id)
        .bind(user.owner_user_id)
        .bind(&user.access_key)
        .bind(&user.secret_key)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.role)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_iam_user(&self, id: Uuid) -> Result<Option<IamUser>, sqlx::Error> {
        sqlx::query_as::<_, IamUser>("SELECT * FROM iam_users WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_iam_user_by_access_key(
        &self,
        access_key: &str,
    ) -> Result<Option<IamUser>, sqlx::Error> {
        sqlx::query_as::<_, IamUser>("SELECT * FROM iam_users WHERE access_key=$1")
            .bind(access_key)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_iam_users(&self, owner_user_id: Uuid) -> Result<Vec<IamUser>, sqlx::Error> {
        sqlx::query_as::<_, IamUser>("SELECT * FROM iam_users WHERE owner_user_id=$1 ORDER BY name")
            .bind(owner_user_id)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn iam_name_exists(&self, name: &str) -> Result<bool, sqlx::Error> {
        exists(&self.pool, "SELECT 1 FROM iam_users WHERE name=$1", name).await
    }

    pub async fn iam_access_key_exists(&self, access_key: &str) -> Result<bool, sqlx::Error> {
        exists(
            &self.pool,
            "SELECT 1 FROM iam_users WHERE access_key=$1",
            access_key,
        )
        .await
    }

    pub async fn iam_email_exists(&self, email: &str) -> Result<bool, sqlx::Error> {
        exists(&self.pool, "SELECT 1 FROM iam_users WHERE email=$1", email).await
    }

    pub async fn update_iam_credentials(
        &self,
        id: Uuid,
        access_key: &str,
        secret_key: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE iam_users SET access_key=$1, secret_key=$2 WHERE id=$3")
            .bind(access_key)
            .bind(secret_key)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_iam_user(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM iam_users WHERE id=$1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- IAM policies ---

    pub async fn create_iam_policy(&self, policy: &IamPolicy) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO iam_policies (id, iam_id, policy_type, document)
            VALUES ($1, $2, $3, $4)"#,
        )
        .bind(policy.id)
        .bind(policy.iam_id)
        .bind(&policy.policy_type)
        .bind(&policy.document)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_policy_by_iam_and_type(
        &self,
        iam_id: Uuid,
        policy_type: &str,
    ) -> Result<Option<IamPolicy>, sqlx::Error> {
        sqlx::query_as::<_, IamPolicy>(
            "SELECT * FROM iam_policies WHERE iam_id=$1 AND policy_type=$2",
        )
        .bind(iam_id)
        .bind(policy_type)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn list_policies_for_iam(&self, iam_id: Uuid) -> Result<Vec<IamPolicy>, sqlx::Error> {
        sqlx::query_as::<_, IamPolicy>(
            "SELECT * FROM iam_policies WHERE iam_id=$1 ORDER BY policy_type",
        )
        .bind(iam_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn update_policy_document(
        &self,
        id: Uuid,
        document: &Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE iam_policies SET document=$1 WHERE id=$2")
            .bind(document)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Buckets ---

    pub async fn create_bucket(&self, bucket: &Bucket) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO buckets (id, name, region, owner_user_id, created_at)
            VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(bucket.id)
        .bind(&bucket.name)
        .bind(&bucket.region)
        .bind(bucket.owner_user_id)
        .bind(bucket.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_bucket(&self, id: Uuid) -> Result<Option<Bucket>, sqlx::Error> {
        sqlx::query_as::<_, Bucket>("SELECT * FROM buckets WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn bucket_name_exists(&self, name: &str) -> Result<bool, sqlx::Error> {
        exists(&self.pool, "SELECT 1 FROM buckets WHERE name=$1", name).await
    }

    pub async fn list_buckets(&self, owner_user_id: Uuid) -> Result<Vec<Bucket>, sqlx::Error> {
        sqlx::query_as::<_, Bucket>(
            "SELECT * FROM buckets WHERE owner_user_id=$1 ORDER BY created_at DESC",
        )
        .bind(owner_user_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn delete_bucket(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM buckets WHERE id=$1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Objects ---

    pub async fn create_object(&self, object: &Object) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO objects
            (id, bucket_id, origin_name, parent_path, content_type, size, url, file_hash,
             created_at, last_modified)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(object.id)
        .bind(object.bucket_id)
        .bind(&object.origin_name)
        .bind(&object.parent_path)
        .bind(&object.content_type)
        .bind(object.size)
        .bind(&object.url)
        .bind(&object.file_hash)
        .bind(object.created_at)
        .bind(object.last_modified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_object(&self, id: Uuid) -> Result<Option<Object>, sqlx::Error> {
        sqlx::query_as::<_, Object>("SELECT * FROM objects WHERE id=$1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_objects_by_path(
        &self,
        bucket_id: Uuid,
        parent_path: &str,
    ) -> Result<Vec<Object>, sqlx::Error> {
        sqlx::query_as::<_, Object>(
            "SELECT * FROM objects WHERE bucket_id=$1 AND parent_path=$2 ORDER BY origin_name",
        )
        .bind(bucket_id)
        .bind(parent_path)
        .fetch_all(&self.pool)
        .await
    }

    /// Derived folders at a path level: distinct first segments of the
    /// deeper `parent_path` values.
    pub async fn list_folders_by_path(
        &self,
        bucket_id: Uuid,
        parent_path: &str,
    ) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(String,)> = if parent_path.is_empty() {
            sqlx::query_as(
                "SELECT DISTINCT parent_path FROM objects WHERE bucket_id=$1 AND parent_path <> ''",
            )
            .bind(bucket_id)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                "SELECT DISTINCT parent_path FROM objects WHERE bucket_id=$1 AND parent_path LIKE $2",
            )
            .bind(bucket_id)
            .bind(format!("{parent_path}/%"))
            .fetch_all(&self.pool)
            .await?
        };
        let paths = rows.into_iter().map(|(path,)| path).collect::<Vec<_>>();
        Ok(derive_folders(&paths, parent_path))
    }

    pub async fn delete_object(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM objects WHERE id=$1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes every object at `path` or beneath it, returning the removed
    /// rows so the store-side delete can target their physical keys.
    pub async fn delete_objects_by_path_prefix(
        &self,
        bucket_id: Uuid,
        path: &str,
    ) -> Result<Vec<Object>, sqlx::Error> {
        sqlx::query_as::<_, Object>(
            r#"DELETE FROM objects
            WHERE bucket_id=$1 AND (parent_path=$2 OR parent_path LIKE $3)
            RETURNING *"#,
        )
        .bind(bucket_id)
        .bind(path)
        .bind(format!("{path}/%"))
        .fetch_all(&self.pool)
        .await
    }

    pub async fn find_objects_by_bucket_and_hash(
        &self,
        bucket_id: Uuid,
        file_hash: &str,
    ) -> Result<Vec<Object>, sqlx::Error> {
        sqlx::query_as::<_, Object>("SELECT * FROM objects WHERE bucket_id=$1 AND file_hash=$2")
            .bind(bucket_id)
            .bind(file_hash)
            .fetch_all(&self.pool)
            .await
    }

    // --- Upload sessions ---

    pub async fn create_upload_session(&self, session: &UploadSession) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO upload_sessions
            (id, bucket_id, user_id, file_name, file_size, content_type, custom_path,
             chunk_size, total_chunks, uploaded_chunks, status, temp_bucket, temp_prefix,
             file_hash, created_at, updated_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"#,
        )
        .bind(session.id)
        .bind(session.bucket_id)
        .bind(session.user_id)
        .bind(&session.file_name)
        .bind(session.file_size)
        .bind(&session.content_type)
        .bind(&session.custom_path)
        .bind(session.chunk_size)
        .bind(session.total_chunks)
        .bind(session.uploaded_chunks)
        .bind(&session.status)
        .bind(&session.temp_bucket)
        .bind(&session.temp_prefix)
        .bind(&session.file_hash)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_upload_session(
        &self,
        id: Uuid,
        bucket_id: Uuid,
    ) -> Result<Option<UploadSession>, sqlx::Error> {
        sqlx::query_as::<_, UploadSession>(
            "SELECT * FROM upload_sessions WHERE id=$1 AND bucket_id=$2",
        )
        .bind(id)
        .bind(bucket_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Row-locked fetch used by the finalize worker while it validates the
    /// session before mutating store-side state.
    pub async fn lock_upload_session(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<UploadSession>, sqlx::Error> {
        sqlx::query_as::<_, UploadSession>("SELECT * FROM upload_sessions WHERE id=$1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
    }

    pub async fn list_active_sessions(
        &self,
        bucket_id: Uuid,
    ) -> Result<Vec<UploadSession>, sqlx::Error> {
        sqlx::query_as::<_, UploadSession>(
            r#"SELECT * FROM upload_sessions
            WHERE bucket_id=$1 AND status IN ('INIT', 'UPLOADING')
            ORDER BY created_at DESC"#,
        )
        .bind(bucket_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn increment_uploaded_chunks(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE upload_sessions
            SET uploaded_chunks = uploaded_chunks + 1, status='UPLOADING', updated_at=$1
            WHERE id=$2"#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_session_status(
        &self,
        id: Uuid,
        status: UploadStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE upload_sessions SET status=$1, updated_at=$2 WHERE id=$3")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_session_file_hash(
        &self,
        id: Uuid,
        file_hash: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE upload_sessions SET file_hash=$1, updated_at=$2 WHERE id=$3")
            .bind(file_hash)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_upload_session(&self, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM upload_sessions WHERE id=$1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sessions past expiry that the sweeper may purge: the active ones,
    /// plus EXPIRED rows whose temp-key cleanup did not finish on an
    /// earlier pass. PROCESSING is skipped (a worker may still be running)
    /// and COMPLETED/FAILED rows stay for status polling.
    pub async fn list_expired_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<UploadSession>, sqlx::Error> {
        sqlx::query_as::<_, UploadSession>(
            r#"SELECT * FROM upload_sessions
            WHERE expires_at < $1 AND status IN ('INIT', 'UPLOADING', 'EXPIRED')"#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
    }
}

async fn exists(pool: &PgPool, query: &str, param: &str) -> Result<bool, sqlx::Error> {
    let row: Option<(i32,)> = sqlx::query_as(query)
        .bind(param)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// First path segments below `parent_path`, deduplicated and sorted.
pub(crate) fn derive_folders(paths: &[String], parent_path: &str) -> Vec<String> {
    let mut folders = BTreeSet::new();
    for path in paths {
        let remaining = if parent_path.is_empty() {
            path.as_str()
        } else {
            match path.strip_prefix(&format!("{parent_path}/")) {
                Some(rest) => rest,
                None => continue,
            }
        };
        if let Some(first) = remaining.split('/').next() {
            if !first.is_empty() {
                folders.insert(first.to_string());
            }
        }
    }
    folders.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::derive_folders;

    fn paths(values: &[&str]) -> Vec<String> {
        values.iter().map(|val| val.to_string()).collect()
    }

    #[test]
    fn derive_folders_at_root_uses_first_segments() {
        let all = paths(&["docs", "docs/2024", "media/video", "media"]);
        assert_eq!(derive_folders(&all, ""), vec!["docs", "media"]);
    }

    #[test]
    fn derive_folders_below_prefix_strips_it() {
        let all = paths(&["docs/2024/q1", "docs/2024", "docs/archive", "media/video"]);
        assert_eq!(derive_folders(&all, "docs"), vec!["2024", "archive"]);
    }

    #[test]
    fn derive_folders_ignores_unrelated_and_exact_matches() {
        let all = paths(&["docs", "docsextra/sub"]);
        assert!(derive_folders(&all, "docs").is_empty());
    }

    #[test]
    fn derive_folders_deduplicates() {
        let all = paths(&["a/b/c", "a/b/d", "a/b"]);
        assert_eq!(derive_folders(&all, "a"), vec!["b"]);
    }
}
