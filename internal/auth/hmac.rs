use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// SHA-256 of the empty byte string; used when a signed request carries no
/// body.
pub const EMPTY_BODY_HASH: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

pub fn hash_body(body: &[u8]) -> String {
    if body.is_empty() {
        return EMPTY_BODY_HASH.to_string();
    }
    hex::encode(Sha256::digest(body))
}

/// Canonical request form: `METHOD\nPATH\nTIMESTAMP\nsha256(body)`. PATH
/// excludes host and query string; TIMESTAMP is decimal Unix seconds.
pub fn string_to_sign(method: &str, path: &str, timestamp: i64, body_hash: &str) -> String {
    format!("{method}\n{path}\n{timestamp}\n{body_hash}")
}

pub fn sign(secret_key: &str, message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    let mut diff = left.len() ^ right.len();
    let max_len = left.len().max(right.len());
    let mut index = 0usize;
    while index < max_len {
        let left_byte = left.get(index).copied().unwrap_or(0);
        let right_byte = right.get(index).copied().unwrap_or(0);
        diff |= (left_byte ^ right_byte) as usize;
        index += 1;
    }
    diff == 0
}

/// Full signature check over the canonical request parts.
pub fn verify_signature(
    secret_key: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    body: &[u8],
    client_signature: &str,
) -> bool {
    let canonical = string_to_sign(method, path, timestamp, &hash_body(body));
    let expected = sign(secret_key, &canonical);
    constant_time_eq(expected.as_bytes(), client_signature.as_bytes())
}

pub fn within_replay_window(server_time: i64, client_time: i64, window_seconds: i64) -> bool {
    (server_time - client_time).abs() <= window_seconds
}

#[cfg(test)]
mod tests {
    use super::{
        constant_time_eq, hash_body, sign, string_to_sign, verify_signature,
        within_replay_window, EMPTY_BODY_HASH,
    };

    #[test]
    fn empty_body_uses_fixed_hash() {
        assert_eq!(hash_body(b""), EMPTY_BODY_HASH);
    }

    #[test]
    fn body_hash_is_lowercase_hex_sha256() {
        assert_eq!(
            hash_body(b"hello\nworld\n"),
            "0115e9ea7b747d71a60f0287ae5309ccbaa0c26d8b77d2b6577d1c4323c57863"
        );
    }

    #[test]
    fn canonical_string_joins_fields_with_newlines() {
        let canonical = string_to_sign("POST", "/api/v1/cloud/buckets", 1700000000, "abc");
        assert_eq!(canonical, "POST\n/api/v1/cloud/buckets\n1700000000\nabc");
    }

    #[test]
    fn signing_is_deterministic() {
        let canonical = string_to_sign("GET", "/x", 1, EMPTY_BODY_HASH);
        assert_eq!(sign("secret", &canonical), sign("secret", &canonical));
        assert_ne!(sign("secret", &canonical), sign("other", &canonical));
    }

    #[test]
    fn signature_is_64_hex_chars() {
        let signature = sign("secret", "message");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(signature, signature.to_lowercase());
    }

    #[test]
    fn verify_signature_accepts_matching_parts() {
        let timestamp = 1700000000;
        let canonical = string_to_sign("POST", "/upload", timestamp, &hash_body(b"data"));
        let signature = sign("secret", &canonical);
        assert!(verify_signature(
            "secret", "POST", "/upload", timestamp, b"data", &signature
        ));
        assert!(!verify_signature(
            "secret", "PUT", "/upload", timestamp, b"data", &signature
        ));
        assert!(!verify_signature(
            "secret", "POST", "/upload", timestamp, b"tampered", &signature
        ));
    }

    #[test]
    fn constant_time_eq_handles_length_mismatch() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn replay_window_boundary_is_inclusive() {
        assert!(within_replay_window(1000, 700, 300));
        assert!(within_replay_window(700, 1000, 300));
        assert!(!within_replay_window(1001, 700, 300));
        assert!(!within_replay_window(700, 1001, 300));
    }
}
