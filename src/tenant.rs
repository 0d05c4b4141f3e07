//! Tenant identity normalization.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical tenant key: a trimmed, non-empty workspace identifier ("baseId").
///
/// Construction goes through [`TenantKey::parse`], so a blank identifier is never
/// silently turned into a valid key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantKey(String);

impl TenantKey {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TenantKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Parse a comma separated tenant list, dropping blanks.
pub fn parse_tenant_list(raw: &str) -> Vec<TenantKey> {
    raw.split(',').filter_map(TenantKey::parse).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims() {
        let key = TenantKey::parse("  base-1 \n").unwrap();
        assert_eq!(key.as_str(), "base-1");
    }

    #[test]
    fn test_parse_rejects_blank() {
        assert!(TenantKey::parse("").is_none());
        assert!(TenantKey::parse("   ").is_none());
        assert!(TenantKey::parse("\t\n").is_none());
    }

    #[test]
    fn test_parse_tenant_list() {
        let list = parse_tenant_list("a, b,, ,c ");
        let names: Vec<&str> = list.iter().map(TenantKey::as_str).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_serde_transparent() {
        let key = TenantKey::parse("base-9").unwrap();
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"base-9\"");
    }
}
