pub mod cache;
pub mod claims;
pub mod config;
pub mod error;
pub mod jwks;
pub mod jwt;
pub mod resolver;

// Re-export primary public types for convenience.
pub use cache::KeyCache;
pub use claims::{Audience, IdTokenClaims};
pub use config::{ConfigError, VerifierConfig};
pub use error::{ErrorKind, FetchError, KeyResolutionError, SecurityError};
pub use jwks::{HttpJwksFetcher, JwksFetcher, KeyFamily, KeySet, SigningKey};
pub use jwt::Verifier;
pub use resolver::KeyResolver;

// Re-export so callers can name algorithms without depending on jsonwebtoken.
pub use jsonwebtoken::Algorithm;

pub mod prelude {
    //! Re-exports of the most commonly used verification types.
    pub use crate::{
        Algorithm, IdTokenClaims, KeyResolver, SecurityError, Verifier, VerifierConfig,
    };
}
