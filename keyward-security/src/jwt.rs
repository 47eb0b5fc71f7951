use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use tracing::{debug, warn};

use crate::claims::IdTokenClaims;
use crate::config::{ConfigError, VerifierConfig};
use crate::error::SecurityError;
use crate::jwks::{is_asymmetric, HttpJwksFetcher};
use crate::resolver::KeyResolver;

/// Verifies tokens signed by the provider configured in [`VerifierConfig`].
///
/// Each call runs the same straight-line pipeline and stops at the first
/// failing step:
///
/// 1. decode the header (untrusted) for `kid` and `alg`
/// 2. check `alg` is allowed and asymmetric
/// 3. resolve the signing key through the shared [`KeyResolver`]
/// 4. verify the signature
/// 5. check `exp` / `nbf` (and `iss` / `aud` when configured)
///
/// Nothing is retried; see [`SecurityError::is_transient`] for deciding
/// whether to retry a whole verification.
///
/// # Example
///
/// ```ignore
/// let config = VerifierConfig::new("https://idp.example.com/.well-known/openid-configuration/jwks");
/// let verifier = Verifier::from_config(config)?;
/// let claims = verifier.verify(&token).await?;
/// println!("{} issued by {:?}", claims.sub, claims.iss);
/// ```
pub struct Verifier {
    resolver: Arc<KeyResolver>,
    config: VerifierConfig,
}

impl Verifier {
    /// Create a verifier that resolves keys through an existing resolver.
    pub fn new(resolver: Arc<KeyResolver>, config: VerifierConfig) -> Self {
        Self { resolver, config }
    }

    /// Validate `config` and build a verifier with its own HTTP fetcher,
    /// key cache and rate limiter.
    pub fn from_config(config: VerifierConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let fetcher = HttpJwksFetcher::new(config.fetch_timeout())
            .map_err(|e| ConfigError::Client(e.to_string()))?;
        let resolver = KeyResolver::from_config(Arc::new(fetcher), &config)?;
        Ok(Self::new(Arc::new(resolver), config))
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Arc<KeyResolver> {
        &self.resolver
    }

    /// Verify `token` against the configured algorithms.
    pub async fn verify(&self, token: &str) -> Result<IdTokenClaims, SecurityError> {
        self.verify_with_algorithms(token, &self.config.allowed_algorithms)
            .await
    }

    /// Verify `token`, accepting only the algorithms in `allowed`.
    ///
    /// Symmetric algorithms are refused even when listed.
    pub async fn verify_with_algorithms(
        &self,
        token: &str,
        allowed: &[Algorithm],
    ) -> Result<IdTokenClaims, SecurityError> {
        let header = decode_header(token).map_err(|e| match unsupported_algorithm(token) {
            Some(alg) => {
                warn!(algorithm = %alg, "Rejected unsupported JWT algorithm");
                SecurityError::DisallowedAlgorithm(alg)
            }
            None => SecurityError::MalformedToken(format!("Failed to decode header: {e}")),
        })?;
        let algorithm = header.alg;
        let kid = header.kid.ok_or_else(|| {
            SecurityError::MalformedToken("JWT header missing 'kid' field".into())
        })?;
        debug!(?algorithm, kid = %kid, "JWT header parsed");

        if !is_asymmetric(algorithm) || !allowed.contains(&algorithm) {
            warn!(?algorithm, kid = %kid, "Rejected JWT algorithm");
            return Err(SecurityError::DisallowedAlgorithm(format!("{algorithm:?}")));
        }

        let key = self.resolver.resolve(&self.config.jwks_uri, &kid).await?;
        if !key.supports(algorithm) {
            return Err(SecurityError::BadSignature(format!(
                "key '{kid}' ({:?}, bound to {:?}) cannot verify {algorithm:?}",
                key.family(),
                key.algorithm()
            )));
        }
        debug!(kid = %kid, "Signing key resolved");

        let validation = self.validation(algorithm);
        let token_data = decode::<serde_json::Value>(token, key.decoding_key(), &validation)
            .map_err(|e| {
                let err = map_jwt_error(e);
                warn!(kid = %kid, error = %err, "JWT verification failed");
                err
            })?;

        let claims = IdTokenClaims::from_claims(token_data.claims)?;
        debug!(sub = %claims.sub, kid = %kid, "JWT verified");
        Ok(claims)
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.algorithms = vec![algorithm];
        validation.leeway = self.config.leeway_secs;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &self.config.audience {
            validation.set_audience(&[audience]);
            validation.validate_aud = true;
        }
        validation
    }
}

/// The header's `alg` when it is a string `jsonwebtoken` does not know,
/// such as `none`. `None` for anything else, including an unreadable header.
fn unsupported_algorithm(token: &str) -> Option<String> {
    let segment = token.split('.').next()?;
    let bytes = URL_SAFE_NO_PAD.decode(segment.trim_end_matches('=')).ok()?;
    let header: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let alg = header.as_object()?.get("alg")?.as_str()?;
    Algorithm::from_str(alg).is_err().then(|| alg.to_owned())
}

/// Map a `jsonwebtoken` failure from the signature/claims stage.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> SecurityError {
    match err.kind() {
        JwtErrorKind::InvalidSignature => {
            SecurityError::BadSignature("signature does not match".into())
        }
        JwtErrorKind::ExpiredSignature => SecurityError::Expired,
        JwtErrorKind::ImmatureSignature => SecurityError::NotYetValid,
        JwtErrorKind::InvalidIssuer => SecurityError::InvalidClaims("Invalid issuer".into()),
        JwtErrorKind::InvalidAudience => SecurityError::InvalidClaims("Invalid audience".into()),
        JwtErrorKind::InvalidAlgorithm => {
            SecurityError::BadSignature("algorithm does not match the signing key".into())
        }
        JwtErrorKind::MissingRequiredClaim(claim) => {
            SecurityError::MalformedToken(format!("missing required claim '{claim}'"))
        }
        JwtErrorKind::InvalidRsaKey(_)
        | JwtErrorKind::InvalidEcdsaKey
        | JwtErrorKind::InvalidKeyFormat => SecurityError::BadSignature(err.to_string()),
        _ => SecurityError::MalformedToken(err.to_string()),
    }
}
