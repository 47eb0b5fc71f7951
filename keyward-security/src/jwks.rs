use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::FetchError;

/// Raw JWK structure as returned by a JWKS endpoint.
/// Extra fields are ignored; we only capture what is needed to build a
/// verification key.
#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    /// Key ID
    #[serde(default)]
    kid: Option<String>,
    /// Key type ("RSA", "EC", "OKP")
    kty: String,
    /// Algorithm the key is bound to (e.g. "RS256")
    #[serde(default)]
    alg: Option<String>,
    /// Intended use ("sig" or "enc")
    #[serde(default, rename = "use")]
    key_use: Option<String>,
    /// RSA modulus (base64url)
    #[serde(default)]
    n: Option<String>,
    /// RSA exponent (base64url)
    #[serde(default)]
    e: Option<String>,
    /// EC / OKP curve name
    #[serde(default)]
    crv: Option<String>,
    /// EC / OKP x coordinate (base64url)
    #[serde(default)]
    x: Option<String>,
    /// EC y coordinate (base64url)
    #[serde(default)]
    y: Option<String>,
}

/// JWKS response envelope.
#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

/// Kind of public key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFamily {
    Rsa,
    Ec,
    Okp,
}

/// Key family an algorithm verifies with, or `None` for HMAC algorithms,
/// which need a shared secret rather than a published key.
#[allow(unreachable_patterns)]
pub fn family_of(algorithm: Algorithm) -> Option<KeyFamily> {
    match algorithm {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => Some(KeyFamily::Rsa),
        Algorithm::ES256 | Algorithm::ES384 => Some(KeyFamily::Ec),
        Algorithm::EdDSA => Some(KeyFamily::Okp),
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => None,
        _ => None,
    }
}

pub fn is_asymmetric(algorithm: Algorithm) -> bool {
    family_of(algorithm).is_some()
}

/// A provider public key, ready for signature verification.
///
/// Immutable once built; shared between the cache and verifiers as
/// `Arc<SigningKey>`.
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    family: KeyFamily,
    algorithm: Option<Algorithm>,
    decoding_key: DecodingKey,
}

impl SigningKey {
    /// Build an RSA key from base64url modulus and exponent.
    pub fn from_rsa_components(
        kid: impl Into<String>,
        n: &str,
        e: &str,
        algorithm: Option<Algorithm>,
    ) -> Result<Self, jsonwebtoken::errors::Error> {
        Ok(Self {
            kid: kid.into(),
            family: KeyFamily::Rsa,
            algorithm,
            decoding_key: DecodingKey::from_rsa_components(n, e)?,
        })
    }

    /// Build an EC key from base64url curve coordinates.
    pub fn from_ec_components(
        kid: impl Into<String>,
        x: &str,
        y: &str,
        algorithm: Option<Algorithm>,
    ) -> Result<Self, jsonwebtoken::errors::Error> {
        Ok(Self {
            kid: kid.into(),
            family: KeyFamily::Ec,
            algorithm,
            decoding_key: DecodingKey::from_ec_components(x, y)?,
        })
    }

    /// Build an Ed25519 key from its base64url public point.
    pub fn from_ed_components(
        kid: impl Into<String>,
        x: &str,
        algorithm: Option<Algorithm>,
    ) -> Result<Self, jsonwebtoken::errors::Error> {
        Ok(Self {
            kid: kid.into(),
            family: KeyFamily::Okp,
            algorithm,
            decoding_key: DecodingKey::from_ed_components(x)?,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn family(&self) -> KeyFamily {
        self.family
    }

    /// Algorithm the provider bound this key to, if it declared one.
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.algorithm
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// Whether this key may verify a signature made with `algorithm`.
    pub fn supports(&self, algorithm: Algorithm) -> bool {
        family_of(algorithm) == Some(self.family)
            && self.algorithm.map_or(true, |bound| bound == algorithm)
    }

    fn from_jwk(jwk: &Jwk, kid: &str) -> Result<Self, String> {
        let algorithm = jwk
            .alg
            .as_deref()
            .map(|alg| {
                Algorithm::from_str(alg).map_err(|_| format!("unknown algorithm '{alg}'"))
            })
            .transpose()?;

        let key = match jwk.kty.as_str() {
            "RSA" => Self::from_rsa_components(
                kid,
                component(jwk, &jwk.n, "n")?,
                component(jwk, &jwk.e, "e")?,
                algorithm,
            ),
            "EC" => Self::from_ec_components(
                kid,
                component(jwk, &jwk.x, "x")?,
                component(jwk, &jwk.y, "y")?,
                algorithm,
            ),
            "OKP" if jwk.crv.as_deref() == Some("Ed25519") => {
                Self::from_ed_components(kid, component(jwk, &jwk.x, "x")?, algorithm)
            }
            other => return Err(format!("unsupported key type {other}")),
        };
        let key = key.map_err(|e| format!("invalid key material: {e}"))?;

        if let Some(alg) = algorithm {
            if !key.supports(alg) {
                return Err(format!("{} key cannot be bound to {alg:?}", jwk.kty));
            }
        }
        Ok(key)
    }
}

fn component<'a>(jwk: &Jwk, value: &'a Option<String>, name: &str) -> Result<&'a str, String> {
    value
        .as_deref()
        .ok_or_else(|| format!("{} key missing '{name}' component", jwk.kty))
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("family", &self.family)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// The signing keys a provider published at one point in time.
///
/// Replaced wholesale on refresh, never mutated.
#[derive(Debug)]
pub struct KeySet {
    provider: String,
    keys: Vec<Arc<SigningKey>>,
    fetched_at: DateTime<Utc>,
}

impl KeySet {
    pub fn new(provider: impl Into<String>, keys: impl IntoIterator<Item = SigningKey>) -> Self {
        Self {
            provider: provider.into(),
            keys: keys.into_iter().map(Arc::new).collect(),
            fetched_at: Utc::now(),
        }
    }

    /// Parse a JWKS document published by `provider`.
    ///
    /// Keys that cannot be used for signature verification are skipped; a
    /// document that is not a `{"keys": [...]}` object is an error.
    pub fn from_jwks_json(provider: impl Into<String>, body: &[u8]) -> Result<Self, FetchError> {
        let provider = provider.into();
        let document: JwksDocument = serde_json::from_slice(body)
            .map_err(|e| FetchError::Malformed(e.to_string()))?;

        let mut keys = Vec::with_capacity(document.keys.len());
        for jwk in &document.keys {
            let Some(kid) = jwk.kid.as_deref() else {
                debug!(provider = %provider, kty = %jwk.kty, "Skipping JWK without 'kid'");
                continue;
            };
            if jwk.key_use.as_deref().is_some_and(|u| u != "sig") {
                debug!(provider = %provider, kid, "Skipping non-signing JWK");
                continue;
            }
            match SigningKey::from_jwk(jwk, kid) {
                Ok(key) => keys.push(key),
                Err(reason) => warn!(provider = %provider, kid, %reason, "Skipping unusable JWK"),
            }
        }

        Ok(Self::new(provider, keys))
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn keys(&self) -> &[Arc<SigningKey>] {
        &self.keys
    }

    /// First key published under `kid`.
    pub fn find(&self, kid: &str) -> Option<Arc<SigningKey>> {
        self.keys.iter().find(|key| key.kid == kid).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Boxed future returned by [`JwksFetcher::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<KeySet, FetchError>> + Send + 'a>>;

/// Retrieves a provider's key set. One call is one outbound request.
///
/// Implement this to swap the HTTP transport (or to fake the provider in
/// tests). Calls are not rate limited; verification goes through
/// [`KeyResolver`](crate::KeyResolver), which is. The returned set must
/// carry `jwks_uri` as its provider.
pub trait JwksFetcher: Send + Sync + 'static {
    fn fetch<'a>(&'a self, jwks_uri: &'a str) -> FetchFuture<'a>;
}

/// [`JwksFetcher`] issuing a single HTTP `GET` per fetch.
#[derive(Clone)]
pub struct HttpJwksFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpJwksFetcher {
    /// Create a fetcher whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("keyward/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, timeout })
    }

    /// Use a preconfigured client. `timeout` is only reported in errors;
    /// the client's own timeout applies.
    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn map_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

impl JwksFetcher for HttpJwksFetcher {
    fn fetch<'a>(&'a self, jwks_uri: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .get(jwks_uri)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await
                .map_err(|e| self.map_error(e))?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }

            let body = response.bytes().await.map_err(|e| self.map_error(e))?;
            KeySet::from_jwks_json(jwks_uri, &body)
        })
    }
}
