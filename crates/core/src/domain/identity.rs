use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Authenticated platform user. Therapists and patients share the same id space.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Server-side record of an issued bearer token. Only the digest is stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub token_sha256: String,
    pub user_id: UserId,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthSession {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

pub fn bearer_token_digest(token: &str) -> String {
    let digest = Sha256::digest(token.trim().as_bytes());
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest.as_slice() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
