//! Configuration management for Tollgate.
//!
//! Settings are layered: an optional YAML file, then `TOLLGATE__*`
//! environment variables (`TOLLGATE__LIMITER__FAILURE_MODE=closed`), then
//! command line flags.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::http::header::HeaderName;
use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};
use crate::ratelimit::{
    validate_namespace, ChainedIdentityResolver, FailureMode, IdentitySource, LimiterSettings,
    ProfileConfig, ProfileRegistry, DEFAULT_NAMESPACE,
};

/// Command line arguments.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "tollgate", version, about = "Distributed token-bucket admission control")]
pub struct CliArgs {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on, overrides `server.listen_addr`
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Log level, overrides `logging.level`
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log output format, overrides `logging.format`
    #[arg(long, value_parser = ["text", "json"])]
    pub log_format: Option<String>,
}

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Limiter tuning and failure policy
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Bucket store selection
    #[serde(default)]
    pub store: StoreConfig,

    /// Caller identification
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Named rate limit profiles
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,

    /// Routes guarded by a profile
    #[serde(default)]
    pub endpoints: Vec<EndpointBinding>,

    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Identifier of this instance in logs
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            instance_id: default_instance_id(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// First segment of every bucket key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Behaviour when the store fails: `open` admits, `closed` refuses
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Bound on a single store round trip
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Compare-and-swap attempts per decision
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Bucket TTL in profile windows
    #[serde(default = "default_ttl_multiplier")]
    pub ttl_multiplier: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            failure_mode: FailureMode::default(),
            store_timeout_ms: default_store_timeout_ms(),
            max_retries: default_max_retries(),
            ttl_multiplier: default_ttl_multiplier(),
        }
    }
}

impl LimiterConfig {
    pub fn settings(&self) -> LimiterSettings {
        LimiterSettings {
            failure_mode: self.failure_mode,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            max_retries: self.max_retries,
            ttl_multiplier: self.ttl_multiplier,
        }
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_max_retries() -> u32 {
    10
}

fn default_ttl_multiplier() -> u32 {
    2
}

/// Which bucket store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process, for a single instance
    #[default]
    Memory,
    /// Shared Redis, for a fleet of instances
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL, required for the redis backend
    pub redis_url: Option<String>,

    /// How often the memory store drops expired buckets
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    30
}

/// Identity resolution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Sources tried in order
    #[serde(default = "default_identity_sources")]
    pub sources: Vec<IdentitySource>,

    /// Header carrying the API key
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            sources: default_identity_sources(),
            api_key_header: default_api_key_header(),
        }
    }
}

impl IdentityConfig {
    pub fn resolver(&self) -> ChainedIdentityResolver {
        ChainedIdentityResolver::new(self.sources.clone())
    }

    pub fn header_name(&self) -> Result<HeaderName> {
        HeaderName::try_from(self.api_key_header.to_ascii_lowercase()).map_err(|e| {
            TollgateError::Configuration(format!(
                "invalid api_key_header '{}': {}",
                self.api_key_header, e
            ))
        })
    }
}

fn default_identity_sources() -> Vec<IdentitySource> {
    ChainedIdentityResolver::default().sources().to_vec()
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

/// Binds a route pattern to the profile that guards it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointBinding {
    /// Route pattern as registered with the router, e.g. `/api/items/{id}`
    pub route: String,
    /// Profile name
    pub profile: String,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the layered configuration described by the command line.
    pub fn load(args: &CliArgs) -> Result<Self> {
        Self::load_with_env(args, Environment::with_prefix("TOLLGATE"))
    }

    fn load_with_env(args: &CliArgs, env: Environment) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = &args.config {
            builder = builder.add_source(File::from(path.as_path()).format(FileFormat::Yaml));
        }

        builder = builder.add_source(
            env.prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("identity.sources")
                .try_parsing(true),
        );

        builder = builder
            .set_override_option("server.listen_addr", args.listen.map(|a| a.to_string()))
            .and_then(|b| b.set_override_option("logging.level", args.log_level.clone()))
            .and_then(|b| b.set_override_option("logging.format", args.log_format.clone()))
            .map_err(config_error)?;

        let config: TollgateConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)?;

        config.validate()?;
        Ok(config)
    }

    /// Build the profile registry described by this configuration.
    pub fn profile_registry(&self) -> Result<ProfileRegistry> {
        ProfileRegistry::from_config(&self.profiles)
    }

    /// Route pattern to profile name (lowercased, as stored in the registry).
    pub fn endpoint_bindings(&self) -> HashMap<String, String> {
        self.endpoints
            .iter()
            .map(|b| (b.route.clone(), b.profile.trim().to_lowercase()))
            .collect()
    }

    /// Fail fast on anything that would only break at request time.
    pub fn validate(&self) -> Result<()> {
        validate_namespace(&self.limiter.namespace)?;

        if self.limiter.store_timeout_ms == 0 {
            return Err(TollgateError::Configuration(
                "limiter.store_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.limiter.ttl_multiplier == 0 {
            return Err(TollgateError::Configuration(
                "limiter.ttl_multiplier must be at least 1".to_string(),
            ));
        }

        match self.store.backend {
            StoreBackend::Redis if self.store.redis_url.is_none() => {
                return Err(TollgateError::Configuration(
                    "store.redis_url is required for the redis backend".to_string(),
                ));
            }
            StoreBackend::Memory if self.store.sweep_interval_secs == 0 => {
                return Err(TollgateError::Configuration(
                    "store.sweep_interval_secs must be greater than zero".to_string(),
                ));
            }
            _ => {}
        }

        if self.identity.sources.is_empty() {
            return Err(TollgateError::Configuration(
                "identity.sources must list at least one source".to_string(),
            ));
        }
        self.identity.header_name()?;

        let registry = self.profile_registry()?;
        registry.ensure_defined(self.endpoints.iter().map(|b| b.profile.as_str()))?;

        let mut routes = HashSet::new();
        for binding in &self.endpoints {
            if !binding.route.starts_with('/') {
                return Err(TollgateError::Configuration(format!(
                    "endpoint route '{}' must start with '/'",
                    binding.route
                )));
            }
            if !routes.insert(binding.route.as_str()) {
                return Err(TollgateError::Configuration(format!(
                    "endpoint route '{}' is bound more than once",
                    binding.route
                )));
            }
        }

        Ok(())
    }
}

fn config_error(err: config::ConfigError) -> TollgateError {
    TollgateError::Configuration(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Strategy;
    use std::io::Write;

    const SAMPLE: &str = r#"
server:
  listen_addr: "127.0.0.1:9000"
limiter:
  failure_mode: closed
  store_timeout_ms: 100
store:
  backend: redis
  redis_url: "redis://127.0.0.1:6379"
identity:
  sources: [api_key, forwarded_for, remote_addr]
  api_key_header: X-Client-Key
profiles:
  search: { limit: 5, duration_seconds: 60 }
  export: { limit: 10, duration_seconds: 3600, strategy: fixed_window }
endpoints:
  - { route: "/api/search", profile: search }
  - { route: "/api/export", profile: export }
logging:
  format: json
"#;

    #[test]
    fn test_default_config() {
        let config = TollgateConfig::default();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.limiter.namespace, "rate-limit");
        assert_eq!(config.limiter.failure_mode, FailureMode::Open);
        assert_eq!(config.limiter.max_retries, 10);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(
            config.identity.sources,
            vec![
                IdentitySource::Principal,
                IdentitySource::ApiKey,
                IdentitySource::RemoteAddr
            ]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let config = TollgateConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.server.listen_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(config.limiter.failure_mode, FailureMode::Closed);
        assert_eq!(
            config.limiter.settings().store_timeout,
            Duration::from_millis(100)
        );
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.identity.header_name().unwrap(), "x-client-key");

        let registry = config.profile_registry().unwrap();
        assert_eq!(
            registry.resolve("export").unwrap().strategy(),
            Strategy::FixedWindow
        );
        assert_eq!(
            config.endpoint_bindings().get("/api/search").map(String::as_str),
            Some("search")
        );
    }

    #[test]
    fn test_endpoint_with_undefined_profile() {
        let yaml = r#"
profiles:
  search: { limit: 5, duration_seconds: 60 }
endpoints:
  - { route: "/api/upload", profile: upload }
"#;
        let err = TollgateConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("upload"));
    }

    #[test]
    fn test_invalid_profile_fails_load() {
        let yaml = "profiles:\n  search: { limit: 0, duration_seconds: 60 }\n";
        assert!(TollgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_redis_requires_url() {
        let yaml = "store:\n  backend: redis\n";
        assert!(TollgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let yaml = r#"
profiles:
  search: { limit: 5, duration_seconds: 60 }
endpoints:
  - { route: "/api/search", profile: search }
  - { route: "/api/search", profile: search }
"#;
        assert!(TollgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_namespace_with_delimiter_rejected() {
        let yaml = "limiter:\n  namespace: \"a:b\"\n";
        assert!(TollgateConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_layered_load() {
        let mut file = tempfile_path("layered");
        file.1.write_all(SAMPLE.as_bytes()).unwrap();

        let args = CliArgs {
            config: Some(file.0.clone()),
            listen: Some("127.0.0.1:7000".parse().unwrap()),
            log_level: Some("debug".to_string()),
            log_format: None,
        };

        let env_vars = HashMap::from([
            ("TOLLGATE__LIMITER__MAX_RETRIES".to_string(), "25".to_string()),
            (
                "TOLLGATE__IDENTITY__SOURCES".to_string(),
                "principal,remote_addr".to_string(),
            ),
        ]);
        let env = Environment::with_prefix("TOLLGATE").source(Some(env_vars));

        let config = TollgateConfig::load_with_env(&args, env).unwrap();
        std::fs::remove_file(&file.0).ok();

        // CLI beats the file
        assert_eq!(config.server.listen_addr.to_string(), "127.0.0.1:7000");
        assert_eq!(config.logging.level, "debug");
        // Environment beats the file
        assert_eq!(config.limiter.max_retries, 25);
        assert_eq!(
            config.identity.sources,
            vec![IdentitySource::Principal, IdentitySource::RemoteAddr]
        );
        // The file fills in the rest
        assert_eq!(config.limiter.failure_mode, FailureMode::Closed);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.profiles.len(), 2);
    }

    #[test]
    fn test_mixed_case_profile_names_load_from_file() {
        let yaml = r#"
profiles:
  Search: { limit: 5, duration_seconds: 60 }
endpoints:
  - { route: "/api/search", profile: Search }
"#;
        // Both loading paths accept the same document.
        assert!(TollgateConfig::from_yaml(yaml).is_ok());

        let mut file = tempfile_path("mixed-case");
        file.1.write_all(yaml.as_bytes()).unwrap();
        let args = CliArgs {
            config: Some(file.0.clone()),
            ..CliArgs::default()
        };
        let env = Environment::with_prefix("TOLLGATE").source(Some(HashMap::new()));

        let config = TollgateConfig::load_with_env(&args, env).unwrap();
        std::fs::remove_file(&file.0).ok();

        let registry = config.profile_registry().unwrap();
        assert_eq!(registry.resolve("Search").unwrap().name(), "search");
        assert_eq!(
            config.endpoint_bindings().get("/api/search").map(String::as_str),
            Some("search")
        );
    }

    fn tempfile_path(name: &str) -> (PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!(
            "tollgate-{}-{}.yaml",
            name,
            uuid::Uuid::new_v4()
        ));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
