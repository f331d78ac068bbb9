use crate::util::config::AdminConfig;
use crate::util::mask::mask_access_key;
use serde_json::{json, Value};
use std::time::Duration;

/// Client for the store-side admin interface that manages IAM users and
/// canned policies. The interface is treated as an opaque HTTP API; every
/// call is authenticated with the configured admin token.
#[derive(Clone)]
pub struct AdminClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl AdminClient {
    pub fn new(config: &AdminConfig) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| format!("admin http client failed: {err}"))?;
        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    pub async fn add_user(&self, access_key: &str, secret_key: &str) -> Result<(), String> {
        let url = user_url(&self.endpoint, access_key);
        self.send_json(
            self.http.put(&url),
            &json!({ "secret_key": secret_key }),
            "add user",
        )
        .await
    }

    pub async fn remove_user(&self, access_key: &str) -> Result<(), String> {
        let url = user_url(&self.endpoint, access_key);
        self.send(self.http.delete(&url), "remove user").await
    }

    pub async fn add_canned_policy(&self, name: &str, document: &Value) -> Result<(), String> {
        let url = policy_url(&self.endpoint, name);
        self.send_json(self.http.put(&url), document, "add policy")
            .await
    }

    pub async fn remove_canned_policy(&self, name: &str) -> Result<(), String> {
        let url = policy_url(&self.endpoint, name);
        self.send(self.http.delete(&url), "remove policy").await
    }

    pub async fn attach_policy_to_user(
        &self,
        access_key: &str,
        policy_name: &str,
    ) -> Result<(), String> {
        let url = format!("{}/policy", user_url(&self.endpoint, access_key));
        self.send_json(
            self.http.put(&url),
            &json!({ "policy_name": policy_name }),
            "attach policy",
        )
        .await
    }

    /// Creates the policy, the user, and the attachment as one logical
    /// operation, undoing earlier steps when a later one fails.
    pub async fn create_user_with_policy(
        &self,
        access_key: &str,
        secret_key: &str,
        policy_name: &str,
        document: &Value,
    ) -> Result<(), String> {
        self.add_canned_policy(policy_name, document).await?;
        if let Err(err) = self.add_user(access_key, secret_key).await {
            self.best_effort_remove_policy(policy_name).await;
            return Err(err);
        }
        if let Err(err) = self.attach_policy_to_user(access_key, policy_name).await {
            self.best_effort_remove_user(access_key).await;
            self.best_effort_remove_policy(policy_name).await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn best_effort_remove_user(&self, access_key: &str) {
        if let Err(err) = self.remove_user(access_key).await {
            tracing::error!(
                access_key = %mask_access_key(access_key),
                error = %err,
                "admin user rollback failed"
            );
        }
    }

    pub async fn best_effort_remove_policy(&self, policy_name: &str) {
        if let Err(err) = self.remove_canned_policy(policy_name).await {
            tracing::error!(policy_name, error = %err, "admin policy rollback failed");
        }
    }

    async fn send_json(
        &self,
        request: reqwest::RequestBuilder,
        body: &Value,
        action: &str,
    ) -> Result<(), String> {
        self.send(request.json(body), action).await
    }

    async fn send(&self, request: reqwest::RequestBuilder, action: &str) -> Result<(), String> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| format!("admin {action} failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!(
                "admin {action} failed: status {}",
                response.status()
            ));
        }
        Ok(())
    }
}

fn user_url(endpoint: &str, access_key: &str) -> String {
    format!("{endpoint}/api/v1/iam/users/{access_key}")
}

fn policy_url(endpoint: &str, name: &str) -> String {
    format!("{endpoint}/api/v1/iam/policies/{name}")
}

#[cfg(test)]
mod tests {
    use super::{policy_url, user_url, AdminClient};
    use crate::util::config::AdminConfig;

    #[test]
    fn urls_compose_endpoint_and_identifier() {
        assert_eq!(
            user_url("http://admin:9001", "AKIA1"),
            "http://admin:9001/api/v1/iam/users/AKIA1"
        );
        assert_eq!(
            policy_url("http://admin:9001", "AKIA1-s3-policy"),
            "http://admin:9001/api/v1/iam/policies/AKIA1-s3-policy"
        );
    }

    #[test]
    fn constructor_strips_trailing_slash() {
        let client = AdminClient::new(&AdminConfig {
            endpoint: "http://admin:9001/".into(),
            token: "token".into(),
        })
        .expect("client");
        assert_eq!(client.endpoint, "http://admin:9001");
    }
}
