use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// AWS-style policy document. Statement keys that this service does not
/// edit (Sid, Principal, Condition, ...) are captured in `extra` so they
/// round-trip verbatim through rewrites.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyDocument {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Statement")]
    pub statement: Vec<Statement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Statement {
    #[serde(rename = "Effect")]
    pub effect: String,
    #[serde(rename = "Action")]
    pub action: Value,
    #[serde(rename = "Resource", default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub const POLICY_TYPE_S3: &str = "s3";

pub fn policy_name_for(access_key: &str) -> String {
    format!("{access_key}-s3-policy")
}

pub fn bucket_arn_pair(bucket_name: &str) -> (String, String) {
    (
        format!("arn:aws:s3:::{bucket_name}"),
        format!("arn:aws:s3:::{bucket_name}/*"),
    )
}

impl PolicyDocument {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Appends the bucket ARN pair to every statement that carries a
    /// `Resource` array and does not already reference the bucket.
    /// Returns true when any statement changed; running it twice for the
    /// same bucket is a no-op.
    pub fn grant_bucket(&mut self, bucket_name: &str) -> bool {
        let (bucket_arn, object_arn) = bucket_arn_pair(bucket_name);
        let mut changed = false;
        for statement in &mut self.statement {
            let Some(resources) = statement.resource.as_mut() else {
                continue;
            };
            if resources.iter().any(|arn| arn == &bucket_arn || arn == &object_arn) {
                continue;
            }
            resources.push(bucket_arn.clone());
            resources.push(object_arn.clone());
            changed = true;
        }
        changed
    }
}

/// Seed document for a freshly created IAM user. Roles mirror the canned
/// grants the admin interface understands; unknown roles fall back to the
/// most permissive template.
pub fn role_template(role: &str) -> PolicyDocument {
    match role {
        "user" => PolicyDocument {
            version: "2012-10-17".into(),
            statement: vec![
                allow_statement(
                    &["s3:CreateBucket"],
                    Some(vec!["arn:aws:s3:::*".into()]),
                ),
                allow_statement(
                    &[
                        "s3:ListAllMyBuckets",
                        "s3:ListBucket",
                        "s3:GetBucketLocation",
                        "s3:DeleteBucket",
                    ],
                    Some(Vec::new()),
                ),
                allow_statement(
                    &["s3:GetObject", "s3:PutObject", "s3:DeleteObject"],
                    Some(Vec::new()),
                ),
            ],
        },
        "viewer" => PolicyDocument {
            version: "2012-10-17".into(),
            statement: vec![
                allow_statement(
                    &["s3:ListAllMyBuckets", "s3:ListBucket"],
                    Some(Vec::new()),
                ),
                allow_statement(&["s3:GetObject"], Some(Vec::new())),
            ],
        },
        _ => PolicyDocument {
            version: "2012-10-17".into(),
            statement: vec![
                allow_statement(
                    &[
                        "s3:CreateBucket",
                        "s3:DeleteBucket",
                        "s3:ListAllMyBuckets",
                        "s3:GetBucketLocation",
                        "s3:ListBucket",
                    ],
                    Some(vec!["arn:aws:s3:::*".into()]),
                ),
                allow_statement(&["s3:*"], Some(vec!["arn:aws:s3:::*/*".into()])),
            ],
        },
    }
}

fn allow_statement(actions: &[&str], resource: Option<Vec<String>>) -> Statement {
    Statement {
        effect: "Allow".into(),
        action: Value::Array(actions.iter().map(|a| Value::String((*a).into())).collect()),
        resource,
        extra: Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::{bucket_arn_pair, policy_name_for, role_template, PolicyDocument};
    use serde_json::json;

    #[test]
    fn policy_name_follows_access_key() {
        assert_eq!(policy_name_for("AKIA123"), "AKIA123-s3-policy");
    }

    #[test]
    fn grant_bucket_appends_arn_pair_once() {
        let mut doc = role_template("user");
        assert!(doc.grant_bucket("acme"));
        let (bucket_arn, object_arn) = bucket_arn_pair("acme");
        for statement in doc.statement.iter().filter(|s| s.resource.is_some()) {
            let resources = statement.resource.as_ref().expect("resource");
            assert!(resources.contains(&bucket_arn));
            assert!(resources.contains(&object_arn));
        }
        // Second run is a no-op.
        assert!(!doc.grant_bucket("acme"));
    }

    #[test]
    fn grant_bucket_skips_statements_without_resource() {
        let mut doc = PolicyDocument::from_value(&json!({
            "Version": "2012-10-17",
            "Statement": [
                {"Effect": "Allow", "Action": "sts:AssumeRole"}
            ]
        }))
        .expect("parse");
        assert!(!doc.grant_bucket("acme"));
        assert!(doc.statement[0].resource.is_none());
    }

    #[test]
    fn unknown_statement_keys_round_trip() {
        let original = json!({
            "Version": "2012-10-17",
            "Statement": [
                {
                    "Sid": "Keep",
                    "Effect": "Allow",
                    "Action": ["s3:GetObject"],
                    "Resource": [],
                    "Condition": {"StringEquals": {"aws:SourceVpc": "vpc-1"}}
                }
            ]
        });
        let mut doc = PolicyDocument::from_value(&original).expect("parse");
        doc.grant_bucket("acme");
        let value = doc.to_value().expect("serialize");
        assert_eq!(value["Statement"][0]["Sid"], "Keep");
        assert_eq!(
            value["Statement"][0]["Condition"]["StringEquals"]["aws:SourceVpc"],
            "vpc-1"
        );
    }

    #[test]
    fn grant_is_idempotent_on_serialized_form() {
        let mut first = role_template("viewer");
        first.grant_bucket("acme");
        let mut second = first.clone();
        second.grant_bucket("acme");
        assert_eq!(
            first.to_value().expect("first"),
            second.to_value().expect("second")
        );
    }

    #[test]
    fn templates_exist_for_all_roles() {
        for role in ["admin", "user", "viewer", "other"] {
            let doc = role_template(role);
            assert_eq!(doc.version, "2012-10-17");
            assert!(!doc.statement.is_empty());
        }
    }
}
