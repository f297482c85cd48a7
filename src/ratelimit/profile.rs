//! Rate limit profiles and the registry that serves them.
//!
//! Profiles are loaded once at startup from configuration and never change
//! afterwards. Every request resolves its endpoint's profile by name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};

/// Longest window whose length in milliseconds still fits an epoch timestamp.
pub const MAX_DURATION_SECONDS: u64 = i64::MAX as u64 / 1000;

/// Profile names are case-insensitive; this is their canonical form.
fn canonical_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// How a bucket regains tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Tokens return all at once when the epoch-aligned window rolls over.
    #[serde(alias = "FIXED_WINDOW", alias = "fixed-window")]
    FixedWindow,
    /// Tokens return continuously, proportionally to elapsed time.
    #[default]
    #[serde(alias = "GREEDY")]
    Greedy,
    /// The full limit returns at once after each complete period since the last refill.
    #[serde(alias = "INTERVAL")]
    Interval,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::FixedWindow => "fixed_window",
            Strategy::Greedy => "greedy",
            Strategy::Interval => "interval",
        };
        f.write_str(name)
    }
}

impl FromStr for Strategy {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed_window" => Ok(Strategy::FixedWindow),
            "greedy" => Ok(Strategy::Greedy),
            "interval" => Ok(Strategy::Interval),
            _ => Err(TollgateError::Configuration(format!(
                "invalid strategy '{}': expected fixed_window, greedy or interval",
                s
            ))),
        }
    }
}

/// A profile as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Tokens available per window (bucket capacity)
    pub limit: u64,
    /// Window length in seconds
    pub duration_seconds: u64,
    /// Refill strategy
    #[serde(default)]
    pub strategy: Strategy,
}

/// A validated, immutable rate limit profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitProfile {
    name: String,
    limit: u64,
    duration_seconds: u64,
    strategy: Strategy,
}

impl RateLimitProfile {
    /// Build a profile, rejecting values that could never be enforced.
    ///
    /// The name is stored lowercased.
    pub fn new(
        name: impl Into<String>,
        limit: u64,
        duration_seconds: u64,
        strategy: Strategy,
    ) -> Result<Self> {
        let name = canonical_name(&name.into());

        if name.is_empty() {
            return Err(TollgateError::Configuration(
                "profile name must not be empty".to_string(),
            ));
        }
        // ':' separates key segments, see BucketKey.
        if name.contains(':') {
            return Err(TollgateError::Configuration(format!(
                "profile name '{}' must not contain ':'",
                name
            )));
        }
        if limit == 0 {
            return Err(TollgateError::Configuration(format!(
                "profile '{}': limit must be greater than zero",
                name
            )));
        }
        if duration_seconds == 0 {
            return Err(TollgateError::Configuration(format!(
                "profile '{}': duration_seconds must be greater than zero",
                name
            )));
        }
        if duration_seconds > MAX_DURATION_SECONDS {
            return Err(TollgateError::Configuration(format!(
                "profile '{}': duration_seconds must not exceed {}",
                name, MAX_DURATION_SECONDS
            )));
        }

        Ok(Self {
            name,
            limit,
            duration_seconds,
            strategy,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bucket capacity and tokens granted per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn duration_seconds(&self) -> u64 {
        self.duration_seconds
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_seconds)
    }

    pub(crate) fn duration_millis(&self) -> i64 {
        (self.duration_seconds as i64).saturating_mul(1000)
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }
}

/// The set of named profiles known to the service.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, Arc<RateLimitProfile>>,
}

impl ProfileRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and load every configured profile.
    ///
    /// Any invalid entry fails the whole load.
    pub fn from_config(profiles: &HashMap<String, ProfileConfig>) -> Result<Self> {
        let mut registry = Self::new();
        for (name, config) in profiles {
            let profile = RateLimitProfile::new(
                name.as_str(),
                config.limit,
                config.duration_seconds,
                config.strategy,
            )?;
            if registry.profiles.contains_key(profile.name()) {
                return Err(TollgateError::Configuration(format!(
                    "rate limit profile '{}' is defined more than once",
                    profile.name()
                )));
            }
            registry
                .profiles
                .insert(profile.name().to_string(), Arc::new(profile));
        }

        info!(
            profiles = registry.profiles.len(),
            "Loaded rate limit profiles"
        );
        Ok(registry)
    }

    /// Load profiles from a YAML mapping of name to profile.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let profiles: HashMap<String, ProfileConfig> = serde_yaml::from_str(yaml).map_err(|e| {
            TollgateError::Configuration(format!("Failed to parse rate limit profiles: {}", e))
        })?;
        Self::from_config(&profiles)
    }

    /// Look up a profile by name, ignoring case.
    pub fn resolve(&self, name: &str) -> Result<Arc<RateLimitProfile>> {
        self.profiles
            .get(&canonical_name(name))
            .cloned()
            .ok_or_else(|| TollgateError::UnknownProfile(name.to_string()))
    }

    /// Fail unless every name refers to a loaded profile.
    pub fn ensure_defined<'a, I>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in names {
            if !self.profiles.contains_key(&canonical_name(name)) {
                return Err(TollgateError::Configuration(format!(
                    "endpoint references undefined rate limit profile '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Profile names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_profiles() {
        let yaml = r#"
search:
  limit: 5
  duration_seconds: 60
  strategy: greedy
export:
  limit: 100
  duration_seconds: 3600
  strategy: FIXED_WINDOW
login:
  limit: 3
  duration_seconds: 300
"#;
        let registry = ProfileRegistry::from_yaml(yaml).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.names(), vec!["export", "login", "search"]);

        let search = registry.resolve("search").unwrap();
        assert_eq!(search.limit(), 5);
        assert_eq!(search.duration_seconds(), 60);
        assert_eq!(search.strategy(), Strategy::Greedy);

        assert_eq!(
            registry.resolve("export").unwrap().strategy(),
            Strategy::FixedWindow
        );
        // Strategy defaults to greedy
        assert_eq!(registry.resolve("login").unwrap().strategy(), Strategy::Greedy);
    }

    #[test]
    fn test_resolve_unknown_profile() {
        let registry = ProfileRegistry::from_yaml("search: { limit: 5, duration_seconds: 60 }")
            .unwrap();

        let err = registry.resolve("missing").unwrap_err();
        assert!(matches!(err, TollgateError::UnknownProfile(ref name) if name == "missing"));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let yaml = "broken: { limit: 0, duration_seconds: 60 }";
        let err = ProfileRegistry::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TollgateError::Configuration(_)));
    }

    #[test]
    fn test_zero_duration_rejected() {
        let yaml = "broken: { limit: 10, duration_seconds: 0 }";
        assert!(ProfileRegistry::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_negative_values_rejected() {
        let yaml = "broken: { limit: -1, duration_seconds: 60 }";
        assert!(ProfileRegistry::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_name_with_delimiter_rejected() {
        assert!(RateLimitProfile::new("a:b", 1, 1, Strategy::Greedy).is_err());
        assert!(RateLimitProfile::new("  ", 1, 1, Strategy::Greedy).is_err());
    }

    #[test]
    fn test_duration_upper_bound() {
        assert!(RateLimitProfile::new("wide", 1, MAX_DURATION_SECONDS, Strategy::Greedy).is_ok());

        let err = RateLimitProfile::new("wide", 1, MAX_DURATION_SECONDS + 1, Strategy::Greedy)
            .unwrap_err();
        assert!(matches!(err, TollgateError::Configuration(_)));

        let yaml = format!("search: {{ limit: 5, duration_seconds: {} }}", u64::MAX / 2 + 1);
        assert!(ProfileRegistry::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let registry = ProfileRegistry::from_yaml("Search: { limit: 5, duration_seconds: 60 }")
            .unwrap();

        assert_eq!(registry.names(), vec!["search"]);
        assert_eq!(registry.resolve("SEARCH").unwrap().name(), "search");
        assert!(registry.resolve("search").is_ok());
        assert!(registry.ensure_defined(["Search"]).is_ok());
    }

    #[test]
    fn test_names_differing_only_in_case_collide() {
        let yaml = r#"
search: { limit: 5, duration_seconds: 60 }
Search: { limit: 9, duration_seconds: 60 }
"#;
        assert!(ProfileRegistry::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let yaml = "search: { limit: 5, duration_seconds: 60, strategy: leaky }";
        assert!(ProfileRegistry::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_ensure_defined() {
        let registry = ProfileRegistry::from_yaml("search: { limit: 5, duration_seconds: 60 }")
            .unwrap();

        assert!(registry.ensure_defined(["search"]).is_ok());
        assert!(registry.ensure_defined(["search", "upload"]).is_err());
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("GREEDY".parse::<Strategy>().unwrap(), Strategy::Greedy);
        assert_eq!("fixed-window".parse::<Strategy>().unwrap(), Strategy::FixedWindow);
        assert_eq!("Interval".parse::<Strategy>().unwrap(), Strategy::Interval);
        assert!("sliding".parse::<Strategy>().is_err());
        assert_eq!(Strategy::FixedWindow.to_string(), "fixed_window");
    }
}
