use std::num::{NonZeroU32, NonZeroUsize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::Deserialize;

use crate::jwks::is_asymmetric;

pub const DEFAULT_CACHE_MAX_AGE_SECS: u64 = 10 * 60 * 60;
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 5;
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 10;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 5;

/// Prefix of the environment variables that override file settings.
pub const ENV_PREFIX: &str = "KEYWARD_";

/// Error type for configuration operations.
#[derive(Debug)]
pub enum ConfigError {
    /// An I/O or YAML parsing error occurred while loading config files.
    Load(String),
    /// A setting is missing or out of range.
    Invalid { key: &'static str, message: String },
    /// The HTTP client could not be built from the settings.
    Client(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Load(msg) => write!(f, "Config load error: {msg}"),
            ConfigError::Invalid { key, message } => {
                write!(f, "Invalid config value for '{key}': {message}")
            }
            ConfigError::Client(msg) => write!(f, "Failed to build HTTP client: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(key: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        message: message.into(),
    }
}

/// Settings for token verification, key caching and JWKS fetching.
#[derive(Clone, Debug)]
pub struct VerifierConfig {
    /// URL of the provider's JWKS endpoint
    /// (e.g. https://idp.example.com/.well-known/openid-configuration/jwks)
    pub jwks_uri: String,

    /// Allowed JWT algorithms. Tokens using other algorithms are rejected.
    /// Default: RS256 only. Symmetric algorithms are never accepted.
    pub allowed_algorithms: Vec<Algorithm>,

    /// Age at which a cached key set must be refreshed (default: 36000, 10 hours)
    pub cache_max_age_secs: u64,

    /// Maximum number of providers whose key sets are cached (default: 5)
    pub cache_max_entries: usize,

    /// JWKS fetches allowed per provider in any rolling minute (default: 10)
    pub rate_limit_per_minute: u32,

    /// Timeout for a single JWKS fetch in seconds (default: 5)
    pub fetch_timeout_secs: u64,

    /// Clock skew tolerated on `exp` and `nbf` in seconds (default: 0)
    pub leeway_secs: u64,

    /// Expected `iss` claim, if it should be checked.
    pub issuer: Option<String>,

    /// Expected `aud` claim, if it should be checked.
    pub audience: Option<String>,
}

impl VerifierConfig {
    /// Create a config for the given JWKS endpoint with default settings.
    pub fn new(jwks_uri: impl Into<String>) -> Self {
        Self {
            jwks_uri: jwks_uri.into(),
            allowed_algorithms: vec![Algorithm::RS256],
            cache_max_age_secs: DEFAULT_CACHE_MAX_AGE_SECS,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            leeway_secs: 0,
            issuer: None,
            audience: None,
        }
    }

    /// Set the allowed JWT algorithms.
    pub fn with_allowed_algorithms(
        mut self,
        algorithms: impl IntoIterator<Item = Algorithm>,
    ) -> Self {
        self.allowed_algorithms = algorithms.into_iter().collect();
        self
    }

    /// Convenience method to allow a single algorithm.
    pub fn with_allowed_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.allowed_algorithms = vec![algorithm];
        self
    }

    /// Set the key set max age in seconds.
    pub fn with_cache_max_age(mut self, secs: u64) -> Self {
        self.cache_max_age_secs = secs;
        self
    }

    pub fn with_cache_max_entries(mut self, entries: usize) -> Self {
        self.cache_max_entries = entries;
        self
    }

    pub fn with_rate_limit_per_minute(mut self, fetches: u32) -> Self {
        self.rate_limit_per_minute = fetches;
        self
    }

    pub fn with_fetch_timeout(mut self, secs: u64) -> Self {
        self.fetch_timeout_secs = secs;
        self
    }

    pub fn with_leeway(mut self, secs: u64) -> Self {
        self.leeway_secs = secs;
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn cache_capacity(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.cache_max_entries)
            .ok_or_else(|| invalid("cache_max_entries", "must be at least 1"))
    }

    pub fn rate_limit(&self) -> Result<NonZeroU32, ConfigError> {
        NonZeroU32::new(self.rate_limit_per_minute)
            .ok_or_else(|| invalid("rate_limit_per_minute", "must be at least 1"))
    }

    /// Check every setting, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let uri = url::Url::parse(&self.jwks_uri)
            .map_err(|e| invalid("jwks_uri", format!("'{}' is not a URL: {e}", self.jwks_uri)))?;
        if !matches!(uri.scheme(), "http" | "https") {
            return Err(invalid(
                "jwks_uri",
                format!("unsupported scheme '{}'", uri.scheme()),
            ));
        }

        if self.allowed_algorithms.is_empty() {
            return Err(invalid("allowed_algorithms", "must not be empty"));
        }
        if let Some(alg) = self
            .allowed_algorithms
            .iter()
            .find(|alg| !is_asymmetric(**alg))
        {
            return Err(invalid(
                "allowed_algorithms",
                format!("symmetric algorithm {alg:?} cannot be used with a public key set"),
            ));
        }

        if self.cache_max_age_secs == 0 {
            return Err(invalid("cache_max_age_secs", "must be at least 1"));
        }
        self.cache_capacity()?;
        self.rate_limit()?;
        if self.fetch_timeout_secs == 0 {
            return Err(invalid("fetch_timeout_secs", "must be at least 1"));
        }
        Ok(())
    }

    /// Parse the `keyward:` section of a YAML document.
    ///
    /// Environment variables are not consulted; see [`load`](Self::load).
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let section = ConfigSection::from_yaml(yaml)?;
        let config = section.into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file, `.env`, and the
    /// process environment.
    ///
    /// Resolution order (lowest to highest priority):
    /// 1. the `keyward:` section of `path`, if given
    /// 2. `.env` file (loaded into process environment, never overwriting)
    /// 3. `KEYWARD_*` environment variables (e.g. `KEYWARD_JWKS_URI`)
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(path, |key| std::env::var(key).ok())
    }

    /// Like [`load`](Self::load), but `KEYWARD_*` variables are looked up
    /// through `env` once `.env` has been loaded.
    pub fn load_from(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let yaml = match path {
            Some(path) if path.exists() => Some(
                std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))?,
            ),
            Some(path) => {
                return Err(ConfigError::Load(format!(
                    "{}: file not found",
                    path.display()
                )))
            }
            None => None,
        };

        let _ = dotenvy::dotenv();
        Self::load_with_env(yaml.as_deref(), env)
    }

    /// Build from YAML text and a variable lookup, without touching the
    /// filesystem or the process environment.
    pub fn load_with_env(
        yaml: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut section = match yaml {
            Some(yaml) => ConfigSection::from_yaml(yaml)?,
            None => ConfigSection::default(),
        };
        section.overlay(env)?;
        let config = section.into_config()?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    keyward: ConfigSection,
}

/// Every setting optional, so the file and the environment can each supply
/// a part.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigSection {
    jwks_uri: Option<String>,
    allowed_algorithms: Option<Vec<Algorithm>>,
    cache_max_age_secs: Option<u64>,
    cache_max_entries: Option<usize>,
    rate_limit_per_minute: Option<u32>,
    fetch_timeout_secs: Option<u64>,
    leeway_secs: Option<u64>,
    issuer: Option<String>,
    audience: Option<String>,
}

impl ConfigSection {
    fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let file: ConfigFile =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Load(e.to_string()))?;
        Ok(file.keyward)
    }

    /// Overlay `KEYWARD_<FIELD>` variables.
    fn overlay(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let var = |name: &str| env(&format!("{ENV_PREFIX}{name}"));

        if let Some(uri) = var("JWKS_URI") {
            self.jwks_uri = Some(uri);
        }
        if let Some(list) = var("ALLOWED_ALGORITHMS") {
            let algorithms = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    Algorithm::from_str(s).map_err(|_| {
                        invalid("allowed_algorithms", format!("unknown algorithm '{s}'"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            self.allowed_algorithms = Some(algorithms);
        }
        if let Some(v) = var("CACHE_MAX_AGE_SECS") {
            self.cache_max_age_secs = Some(parse_number("cache_max_age_secs", &v)?);
        }
        if let Some(v) = var("CACHE_MAX_ENTRIES") {
            self.cache_max_entries = Some(parse_number("cache_max_entries", &v)?);
        }
        if let Some(v) = var("RATE_LIMIT_PER_MINUTE") {
            self.rate_limit_per_minute = Some(parse_number("rate_limit_per_minute", &v)?);
        }
        if let Some(v) = var("FETCH_TIMEOUT_SECS") {
            self.fetch_timeout_secs = Some(parse_number("fetch_timeout_secs", &v)?);
        }
        if let Some(v) = var("LEEWAY_SECS") {
            self.leeway_secs = Some(parse_number("leeway_secs", &v)?);
        }
        if let Some(issuer) = var("ISSUER") {
            self.issuer = Some(issuer);
        }
        if let Some(audience) = var("AUDIENCE") {
            self.audience = Some(audience);
        }
        Ok(())
    }

    fn into_config(self) -> Result<VerifierConfig, ConfigError> {
        let jwks_uri = self
            .jwks_uri
            .ok_or_else(|| invalid("jwks_uri", "is required"))?;
        let defaults = VerifierConfig::new(jwks_uri);
        Ok(VerifierConfig {
            allowed_algorithms: self
                .allowed_algorithms
                .unwrap_or(defaults.allowed_algorithms.clone()),
            cache_max_age_secs: self
                .cache_max_age_secs
                .unwrap_or(defaults.cache_max_age_secs),
            cache_max_entries: self.cache_max_entries.unwrap_or(defaults.cache_max_entries),
            rate_limit_per_minute: self
                .rate_limit_per_minute
                .unwrap_or(defaults.rate_limit_per_minute),
            fetch_timeout_secs: self
                .fetch_timeout_secs
                .unwrap_or(defaults.fetch_timeout_secs),
            leeway_secs: self.leeway_secs.unwrap_or(defaults.leeway_secs),
            issuer: self.issuer,
            audience: self.audience,
            ..defaults
        })
    }
}

fn parse_number<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(key, format!("'{raw}' is not a valid number")))
}
