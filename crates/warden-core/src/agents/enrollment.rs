use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::{AgentIdentity, ExecutionClass};

/// Hex SHA-256 of a bearer secret. Only digests are kept in memory or on disk.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub(crate) fn random_secret(prefix: &str) -> String {
    format!(
        "{prefix}_{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Single-use, time-boxed token a collaborator hands to a new endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DownloadGrant {
    pub download_token: String,
    pub execution_class: ExecutionClass,
    pub label: Option<String>,
    pub expires_in: Duration,
}

/// Credentials an endpoint receives in exchange for its download token.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConnectionBundle {
    pub agent_identity: AgentIdentity,
    pub session_token: String,
    pub execution_class: ExecutionClass,
    pub heartbeat_interval_ms: u64,
}

/// Durable side of an enrollment: who the agent is and the digest of its session token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnrollmentRecord {
    pub agent_identity: AgentIdentity,
    pub execution_class: ExecutionClass,
    pub token_hash: String,
    pub label: Option<String>,
    pub enrolled_at: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::{random_secret, token_digest};

    #[test]
    fn digest_is_stable_hex() {
        let digest = token_digest("abc");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, token_digest("abc"));
        assert_ne!(digest, token_digest("abd"));
    }

    #[test]
    fn secrets_are_prefixed_and_unique() {
        let first = random_secret("wdl");
        let second = random_secret("wdl");
        assert!(first.starts_with("wdl_"));
        assert_ne!(first, second);
    }
}
