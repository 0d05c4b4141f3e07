//! Single-use redeem codes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stored form of a redeem code. Only the digest of the plaintext is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemCode {
    pub code_hash: String,
    pub duration_ms: i64,
    #[serde(default)]
    pub used_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_by: Option<String>,
}

impl RedeemCode {
    pub fn new(code: &str, duration_ms: i64) -> Self {
        Self {
            code_hash: hash_code(code),
            duration_ms,
            used_at: 0,
            used_by: None,
        }
    }

    pub fn is_used(&self) -> bool {
        self.used_at != 0 || self.used_by.is_some()
    }

    pub(crate) fn mark_used(&mut self, tenant: &str, at_ms: i64) {
        self.used_at = at_ms;
        self.used_by = Some(tenant.to_string());
    }
}

/// Lowercase hex SHA-256 of the trimmed plaintext code.
pub fn hash_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.trim().as_bytes()))
}
