//! Bucket key generation and parsing.

use crate::error::{Result, TollgateError};

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "rate-limit";

/// A key that uniquely identifies one bucket: one caller on one profile.
///
/// Rendered as `"{namespace}:{identity}:{profile}"`. Neither the namespace
/// nor the profile name may contain `:`, so the identity is everything
/// between the first and the last delimiter and may contain `:` itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Store namespace shared by all buckets of this service
    pub namespace: String,
    /// Caller identity from the identity resolver
    pub identity: String,
    /// The profile this bucket is charged against
    pub profile: String,
}

impl BucketKey {
    /// Create a key in the default namespace.
    pub fn new(identity: &str, profile: &str) -> Self {
        Self::with_namespace(DEFAULT_NAMESPACE, identity, profile)
    }

    /// Create a key in an explicit namespace.
    pub fn with_namespace(namespace: &str, identity: &str, profile: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            profile: profile.to_string(),
        }
    }

    /// Convert the key to the string used in the bucket store.
    pub fn to_store_key(&self) -> String {
        format!("{}:{}:{}", self.namespace, self.identity, self.profile)
    }

    /// Parse a store key back into its parts.
    pub fn parse(key: &str) -> Option<Self> {
        let first_sep = key.find(':')?;
        let last_sep = key.rfind(':')?;
        if first_sep == last_sep {
            return None;
        }

        let namespace = &key[..first_sep];
        let identity = &key[first_sep + 1..last_sep];
        let profile = &key[last_sep + 1..];
        if namespace.is_empty() || identity.is_empty() || profile.is_empty() {
            return None;
        }

        Some(Self::with_namespace(namespace, identity, profile))
    }
}

/// Check that a namespace can be used as the first key segment.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() || namespace.contains(':') {
        return Err(TollgateError::Configuration(format!(
            "key namespace '{}' must be non-empty and must not contain ':'",
            namespace
        )));
    }
    Ok(())
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_key_format() {
        let key = BucketKey::new("user:alice", "search");
        assert_eq!(key.to_store_key(), "rate-limit:user:alice:search");
        assert_eq!(key.to_string(), "rate-limit:user:alice:search");
    }

    #[test]
    fn test_bucket_key_parse() {
        let key = BucketKey::parse("rate-limit:ip:2001:db8::1:search").unwrap();
        assert_eq!(key.namespace, "rate-limit");
        assert_eq!(key.identity, "ip:2001:db8::1");
        assert_eq!(key.profile, "search");

        let rendered = BucketKey::with_namespace("tenant-a", "key:abc", "export");
        assert_eq!(BucketKey::parse(&rendered.to_store_key()), Some(rendered));
    }

    #[test]
    fn test_bucket_key_parse_invalid() {
        assert!(BucketKey::parse("invalid").is_none());
        assert!(BucketKey::parse("only:two").is_none());
        assert!(BucketKey::parse(":identity:profile").is_none());
        assert!(BucketKey::parse("ns:identity:").is_none());
    }

    #[test]
    fn test_distinct_pairs_give_distinct_keys() {
        // The same identity string from different sources stays apart.
        let a = BucketKey::new("user:10.0.0.1", "search");
        let b = BucketKey::new("ip:10.0.0.1", "search");
        assert_ne!(a.to_store_key(), b.to_store_key());

        let c = BucketKey::new("ip:10.0.0.1", "search");
        let d = BucketKey::new("ip:10.0.0.1", "upload");
        assert_ne!(c, d);
        assert_ne!(c.to_store_key(), d.to_store_key());
    }

    #[test]
    fn test_validate_namespace() {
        assert!(validate_namespace("rate-limit").is_ok());
        assert!(validate_namespace("").is_err());
        assert!(validate_namespace("a:b").is_err());
    }
}
