use crate::util::config::S3Config;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use sha2::{Digest, Sha256};

/// Object-store handle. All operations address the S3-compatible store the
/// catalog is reconciled against; the handle is cheap to clone and safe for
/// concurrent use.
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    region: String,
}

impl ObjectStore {
    pub fn new(config: &S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "static",
        );
        let sdk_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .endpoint_url(config.endpoint.clone())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(sdk_config),
            region: config.region.clone(),
        }
    }

    pub async fn bucket_exists(&self, bucket: &str) -> Result<bool, String> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|service| service.is_not_found())
                    .unwrap_or(false)
                {
                    return Ok(false);
                }
                Err(format!("head bucket failed: {err}"))
            }
        }
    }

    pub async fn create_bucket(&self, bucket: &str, region: &str) -> Result<(), String> {
        let region = if region.is_empty() {
            self.region.as_str()
        } else {
            region
        };
        let mut request = self.client.create_bucket().bucket(bucket);
        // us-east-1 is the implied location and must not be sent explicitly.
        if region != "us-east-1" {
            request = request.create_bucket_configuration(
                aws_sdk_s3::types::CreateBucketConfiguration::builder()
                    .location_constraint(aws_sdk_s3::types::BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|err| format!("create bucket failed: {err}"))?;
        Ok(())
    }

    pub async fn ensure_bucket(&self, bucket: &str) -> Result<(), String> {
        if self.bucket_exists(bucket).await? {
            return Ok(());
        }
        self.create_bucket(bucket, "").await
    }

    pub async fn delete_bucket(&self, bucket: &str) -> Result<(), String> {
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|err| format!("delete bucket failed: {err}"))?;
        Ok(())
    }

    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), String> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| format!("put object failed: {err}"))?;
        Ok(())
    }

    /// Streaming read; returns the body stream and the object size.
    pub async fn get_object_stream(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(ByteStream, i64), String> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| format!("get object failed: {err}"))?;
        let size = output.content_length().unwrap_or(0);
        Ok((output.body, size))
    }

    pub async fn list_keys_with_prefix(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<String>, String> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|err| format!("list objects failed: {err}"))?;
            for object in output.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
            match output.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    /// Server-side concatenation of `sources` (in the given order) into
    /// `dest_key`, via a multipart upload whose parts are copied from the
    /// source keys. Parts other than the last must be at least 5 MiB, which
    /// chunked-upload chunks always satisfy.
    pub async fn compose_object(
        &self,
        bucket: &str,
        sources: &[String],
        dest_key: &str,
        content_type: &str,
    ) -> Result<(), String> {
        if sources.is_empty() {
            return Err("compose requires at least one source".into());
        }
        let upload_id = self.start_multipart(bucket, dest_key, content_type).await?;
        match self
            .copy_parts(bucket, sources, dest_key, &upload_id)
            .await
        {
            Ok(parts) => {
                self.finish_multipart(bucket, dest_key, &upload_id, parts)
                    .await
            }
            Err(err) => {
                self.abort_multipart(bucket, dest_key, &upload_id).await;
                Err(err)
            }
        }
    }

    async fn start_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> Result<String, String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|err| format!("create multipart failed: {err}"))?;
        output
            .upload_id()
            .map(|id| id.to_string())
            .ok_or_else(|| "create multipart returned no upload id".to_string())
    }

    async fn copy_parts(
        &self,
        bucket: &str,
        sources: &[String],
        dest_key: &str,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>, String> {
        let mut parts = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let part_number = (index + 1) as i32;
            let output = self
                .client
                .upload_part_copy()
                .bucket(bucket)
                .key(dest_key)
                .upload_id(upload_id)
                .part_number(part_number)
                .copy_source(format!("{bucket}/{source}"))
                .send()
                .await
                .map_err(|err| format!("copy part {part_number} failed: {err}"))?;
            let etag = output
                .copy_part_result()
                .and_then(|result| result.e_tag())
                .ok_or_else(|| format!("copy part {part_number} returned no etag"))?;
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(etag)
                    .build(),
            );
        }
        Ok(parts)
    }

    async fn finish_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), String> {
        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| format!("complete multipart failed: {err}"))?;
        Ok(())
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) {
        if let Err(err) = self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            tracing::warn!(error = %err, key, "abort multipart failed");
        }
    }

    pub async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(), String> {
        self.client
            .copy_object()
            .copy_source(format!("{src_bucket}/{src_key}"))
            .bucket(dst_bucket)
            .key(dst_key)
            .send()
            .await
            .map_err(|err| format!("copy object failed: {err}"))?;
        Ok(())
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), String> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| format!("delete object failed: {err}"))?;
        Ok(())
    }

    pub async fn delete_objects_with_prefix(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<(), String> {
        let keys = self.list_keys_with_prefix(bucket, prefix).await?;
        if keys.is_empty() {
            return Ok(());
        }
        for batch in keys.chunks(1000) {
            let identifiers = batch
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|err| format!("bad object identifier: {err}"))
                })
                .collect::<Result<Vec<_>, String>>()?;
            self.client
                .delete_objects()
                .bucket(bucket)
                .delete(
                    Delete::builder()
                        .set_objects(Some(identifiers))
                        .build()
                        .map_err(|err| format!("bad delete request: {err}"))?,
                )
                .send()
                .await
                .map_err(|err| format!("bulk delete failed: {err}"))?;
        }
        Ok(())
    }

    /// Empties the bucket, then removes it.
    pub async fn delete_bucket_with_objects(&self, bucket: &str) -> Result<(), String> {
        self.delete_objects_with_prefix(bucket, "").await?;
        self.delete_bucket(bucket).await
    }

    /// Streams the object through a SHA-256 hasher; returns the lowercase
    /// hex digest and the byte count that passed through.
    pub async fn sha256_of_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(String, i64), String> {
        let (mut body, _) = self.get_object_stream(bucket, key).await?;
        let mut hasher = Sha256::new();
        let mut total: i64 = 0;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|err| format!("read object failed: {err}"))?
        {
            total += chunk.len() as i64;
            hasher.update(&chunk);
        }
        Ok((hex::encode(hasher.finalize()), total))
    }
}
