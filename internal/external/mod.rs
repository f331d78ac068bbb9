use reqwest::multipart;
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for the external authorization service. The service is an opaque
/// validator: a 200 from the validate endpoint means the bearer token is
/// live; claims are still parsed locally afterwards.
#[derive(Clone)]
pub struct AuthorizationClient {
    http: reqwest::Client,
    base_url: String,
}

impl AuthorizationClient {
    pub fn new(base_url: &str) -> Result<Self, String> {
        Ok(Self {
            http: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn check_access_token(&self, token: &str) -> Result<(), String> {
        let url = format!("{}/api/v2/authorization/token/validate", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| format!("authorization request failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("invalid token: status {}", response.status()));
        }
        Ok(())
    }
}

/// Response envelope of the content-addressed upload service. `file_path`
/// is the store key the service chose (`{hash}{.ext}`, possibly nested).
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    pub bucket: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub duplicated: bool,
    pub file_hash: String,
    pub file_path: String,
    pub size: i64,
}

/// Client for the external upload service, a content-addressed storage
/// forwarder. Small direct uploads and the final staged-to-target move both
/// go through it.
#[derive(Clone)]
pub struct UploadClient {
    http: reqwest::Client,
    base_url: String,
    cdn_url: Option<String>,
}

impl UploadClient {
    pub fn new(base_url: &str, cdn_url: Option<String>) -> Result<Self, String> {
        Ok(Self {
            http: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            cdn_url: cdn_url.map(|url| url.trim_end_matches('/').to_string()),
        })
    }

    /// Forwards file bytes to the upload service, which stores them under a
    /// content-addressed key in `bucket` beneath `path`.
    pub async fn upload_file(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        content_type: &str,
        bucket: &str,
        path: &str,
    ) -> Result<UploadResponse, String> {
        let url = format!("{}/api/v2/upload/file", self.base_url);
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(content_type)
            .map_err(|err| format!("invalid content type: {err}"))?;
        let form = multipart::Form::new()
            .text("bucket", bucket.to_string())
            .text("path", path.to_string())
            .part("file", part);
        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|err| format!("upload request failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("upload service returned {}", response.status()));
        }
        response
            .json::<UploadResponse>()
            .await
            .map_err(|err| format!("upload response decode failed: {err}"))
    }

    pub fn cdn_url(&self, bucket: &str, file_path: &str) -> Option<String> {
        self.cdn_url
            .as_ref()
            .map(|base| format!("{base}/{bucket}/{file_path}"))
    }
}

fn build_client() -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|err| format!("http client failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::{AuthorizationClient, UploadClient, UploadResponse};

    #[test]
    fn constructors_strip_trailing_slashes() {
        let auth = AuthorizationClient::new("http://auth:8081/").expect("auth");
        assert_eq!(auth.base_url, "http://auth:8081");
        let upload =
            UploadClient::new("http://upload:8082/", Some("http://cdn/".into())).expect("upload");
        assert_eq!(upload.base_url, "http://upload:8082");
        assert_eq!(upload.cdn_url.as_deref(), Some("http://cdn"));
    }

    #[test]
    fn cdn_url_requires_configuration() {
        let without = UploadClient::new("http://upload:8082", None).expect("upload");
        assert_eq!(without.cdn_url("b", "hash.txt"), None);
        let with =
            UploadClient::new("http://upload:8082", Some("http://cdn".into())).expect("upload");
        assert_eq!(
            with.cdn_url("b", "hash.txt"),
            Some("http://cdn/b/hash.txt".to_string())
        );
    }

    #[test]
    fn upload_response_decodes_service_envelope() {
        let raw = r#"{
            "bucket": "acme",
            "content_type": "text/plain",
            "duplicated": false,
            "file_hash": "abc",
            "file_path": "abc.txt",
            "message": "ok",
            "size": 12,
            "status": 200
        }"#;
        let response: UploadResponse = serde_json::from_str(raw).expect("decode");
        assert_eq!(response.file_path, "abc.txt");
        assert_eq!(response.size, 12);
    }
}
