//! Command implementations for the `keyward` CLI.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Args;
use keyward_security::{Algorithm, ConfigError, VerifierConfig};
use tracing::debug;

/// Key listing: `keyward keys`.
pub mod keys;

/// Terminal rendering of claims and key sets.
pub mod render;

/// Token verification: `keyward verify`.
pub mod verify;

/// Config file used when `--config` is not given, if it exists.
pub const DEFAULT_CONFIG_FILE: &str = "keyward.yaml";

const JWKS_URI_VAR: &str = "KEYWARD_JWKS_URI";

/// Where to find the provider, shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct ProviderArgs {
    /// YAML file with a `keyward:` section
    #[arg(long, short, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// JWKS endpoint; overrides the config file and KEYWARD_JWKS_URI
    #[arg(long, value_name = "URI")]
    pub jwks_uri: Option<String>,
}

impl ProviderArgs {
    /// Config file to read: `--config`, else `keyward.yaml` when present.
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config.clone().or_else(|| {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.exists().then_some(default)
        })
    }

    /// Load and validate the verifier configuration.
    pub fn load(&self) -> Result<VerifierConfig, ConfigError> {
        let path = self.config_path();
        let jwks_uri = self.jwks_uri.clone();
        let config = VerifierConfig::load_from(path.as_deref(), |key| match (key, &jwks_uri) {
            (JWKS_URI_VAR, Some(uri)) => Some(uri.clone()),
            _ => std::env::var(key).ok(),
        })?;
        debug!(
            config = ?path,
            jwks_uri = %config.jwks_uri,
            algorithms = ?config.allowed_algorithms,
            "Configuration loaded"
        );
        Ok(config)
    }
}

/// `clap` value parser for `--algorithm`.
pub fn parse_algorithm(raw: &str) -> Result<Algorithm, String> {
    let raw = raw.trim();
    Algorithm::from_str(raw)
        .or_else(|_| Algorithm::from_str(&raw.to_ascii_uppercase()))
        .map_err(|_| format!("unknown algorithm '{raw}'"))
}
