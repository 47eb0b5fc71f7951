use std::time::Duration;

/// Failure to retrieve or parse a provider's JWKS document.
///
/// `Clone` because one fetch result is fanned out to every caller that
/// joined the in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Transport-level failure (DNS, TLS, connection reset, ...).
    Network(String),

    /// The endpoint answered with a non-success HTTP status.
    Status(u16),

    /// The body was not a `{"keys": [...]}` document.
    Malformed(String),

    /// No response within the configured fetch timeout.
    Timeout(Duration),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Network(msg) => write!(f, "JWKS request failed: {msg}"),
            FetchError::Status(code) => write!(f, "JWKS endpoint returned HTTP {code}"),
            FetchError::Malformed(msg) => write!(f, "Malformed JWKS document: {msg}"),
            FetchError::Timeout(after) => {
                write!(f, "JWKS request timed out after {}ms", after.as_millis())
            }
        }
    }
}

impl std::error::Error for FetchError {}

/// Failure to produce a signing key for a `(provider, kid)` pair.
#[derive(Debug, Clone)]
pub enum KeyResolutionError {
    /// The key set could not be fetched.
    Fetch(FetchError),

    /// A refresh was needed but the provider's fetch budget is spent and no
    /// cached copy holds the key.
    RateLimited {
        provider: String,
        retry_after: Duration,
    },

    /// The provider's current key set does not contain this key id.
    UnknownKeyId { provider: String, kid: String },
}

impl std::fmt::Display for KeyResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyResolutionError::Fetch(err) => write!(f, "{err}"),
            KeyResolutionError::RateLimited {
                provider,
                retry_after,
            } => write!(
                f,
                "JWKS refresh for {provider} rate limited, retry in {}s",
                retry_after.as_secs().max(1)
            ),
            KeyResolutionError::UnknownKeyId { provider, kid } => {
                write!(f, "Unknown signing key '{kid}' for {provider}")
            }
        }
    }
}

impl std::error::Error for KeyResolutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeyResolutionError::Fetch(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FetchError> for KeyResolutionError {
    fn from(err: FetchError) -> Self {
        KeyResolutionError::Fetch(err)
    }
}

/// Errors produced while verifying a token.
#[derive(Debug)]
pub enum SecurityError {
    /// The token (or its header) could not be decoded, or a required
    /// header field / claim is missing.
    MalformedToken(String),

    /// The token declares an algorithm that is not accepted. Holds the
    /// header's `alg` as written, which may name an algorithm this crate
    /// does not implement (`none`, `ES512`, ...).
    DisallowedAlgorithm(String),

    /// No trusted key could be obtained for the token's `kid`.
    UntrustedKey(KeyResolutionError),

    /// The signature does not verify against the resolved key.
    BadSignature(String),

    /// The `exp` claim is in the past.
    Expired,

    /// The `nbf` claim is in the future.
    NotYetValid,

    /// Issuer or audience did not match the configuration.
    InvalidClaims(String),
}

/// Flat classification of a [`SecurityError`], suitable for metrics labels
/// and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedToken,
    DisallowedAlgorithm,
    FetchError,
    RateLimited,
    UnknownKeyId,
    BadSignature,
    Expired,
    NotYetValid,
    InvalidClaims,
}

impl SecurityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecurityError::MalformedToken(_) => ErrorKind::MalformedToken,
            SecurityError::DisallowedAlgorithm(_) => ErrorKind::DisallowedAlgorithm,
            SecurityError::UntrustedKey(KeyResolutionError::Fetch(_)) => ErrorKind::FetchError,
            SecurityError::UntrustedKey(KeyResolutionError::RateLimited { .. }) => {
                ErrorKind::RateLimited
            }
            SecurityError::UntrustedKey(KeyResolutionError::UnknownKeyId { .. }) => {
                ErrorKind::UnknownKeyId
            }
            SecurityError::BadSignature(_) => ErrorKind::BadSignature,
            SecurityError::Expired => ErrorKind::Expired,
            SecurityError::NotYetValid => ErrorKind::NotYetValid,
            SecurityError::InvalidClaims(_) => ErrorKind::InvalidClaims,
        }
    }

    /// Whether retrying the whole verification later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::FetchError | ErrorKind::RateLimited)
    }
}

impl std::fmt::Display for SecurityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityError::MalformedToken(msg) => write!(f, "Malformed token: {msg}"),
            SecurityError::DisallowedAlgorithm(alg) => {
                write!(f, "Disallowed JWT algorithm: {alg}")
            }
            SecurityError::UntrustedKey(err) => write!(f, "Untrusted signing key: {err}"),
            SecurityError::BadSignature(msg) => write!(f, "Bad signature: {msg}"),
            SecurityError::Expired => write!(f, "Token expired"),
            SecurityError::NotYetValid => write!(f, "Token not yet valid"),
            SecurityError::InvalidClaims(msg) => write!(f, "Invalid claims: {msg}"),
        }
    }
}

impl std::error::Error for SecurityError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SecurityError::UntrustedKey(err) => Some(err),
            _ => None,
        }
    }
}

impl From<KeyResolutionError> for SecurityError {
    fn from(err: KeyResolutionError) -> Self {
        SecurityError::UntrustedKey(err)
    }
}
