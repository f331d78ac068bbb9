use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub user_id: Uuid,
    pub exp: usize,
}

/// Local JWT verification applied after the external authorization service
/// has accepted the token. Only the configured HMAC family is accepted so a
/// token signed under a different scheme cannot slip through.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding: DecodingKey,
    algorithm: Algorithm,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl TokenVerifier {
    pub fn new(secret: &[u8], algorithm: &str) -> Result<Self, String> {
        let algorithm = parse_hmac_algorithm(algorithm)?;
        Ok(Self {
            decoding: DecodingKey::from_secret(secret),
            algorithm,
        })
    }

    pub fn verify(&self, token: &str) -> Result<Claims, String> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = true;
        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| "token decode failed".to_string())?;
        Ok(data.claims)
    }
}

fn parse_hmac_algorithm(raw: &str) -> Result<Algorithm, String> {
    match raw {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        _ => Err(format!("unsupported JWT algorithm: {raw}")),
    }
}

#[cfg(test)]
mod tests {
    use super::{Claims, TokenVerifier};
    use chrono::Utc;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use uuid::Uuid;

    fn issue(secret: &[u8], algorithm: Algorithm, user_id: Uuid, exp_offset: i64) -> String {
        let claims = Claims {
            sub: user_id.to_string(),
            user_id,
            exp: (Utc::now().timestamp() + exp_offset) as usize,
        };
        encode(
            &Header::new(algorithm),
            &claims,
            &EncodingKey::from_secret(secret),
        )
        .expect("encode")
    }

    #[test]
    fn verify_accepts_matching_secret_and_algorithm() {
        let verifier = TokenVerifier::new(b"secret", "HS256").expect("verifier");
        let user_id = Uuid::new_v4();
        let token = issue(b"secret", Algorithm::HS256, user_id, 3600);
        let claims = verifier.verify(&token).expect("verify");
        assert_eq!(claims.user_id, user_id);
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let verifier = TokenVerifier::new(b"secret", "HS256").expect("verifier");
        let token = issue(b"other", Algorithm::HS256, Uuid::new_v4(), 3600);
        assert_eq!(verifier.verify(&token).unwrap_err(), "token decode failed");
    }

    #[test]
    fn verify_rejects_algorithm_mismatch() {
        let verifier = TokenVerifier::new(b"secret", "HS256").expect("verifier");
        let token = issue(b"secret", Algorithm::HS384, Uuid::new_v4(), 3600);
        assert_eq!(verifier.verify(&token).unwrap_err(), "token decode failed");
    }

    #[test]
    fn verify_rejects_expired_token() {
        let verifier = TokenVerifier::new(b"secret", "HS256").expect("verifier");
        let token = issue(b"secret", Algorithm::HS256, Uuid::new_v4(), -3600);
        assert_eq!(verifier.verify(&token).unwrap_err(), "token decode failed");
    }

    #[test]
    fn constructor_rejects_non_hmac_algorithms() {
        let err = TokenVerifier::new(b"secret", "RS256").unwrap_err();
        assert!(err.contains("unsupported JWT algorithm"));
    }
}
