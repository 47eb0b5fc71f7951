use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SecurityError;

/// The `aud` claim: one audience or several.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == audience,
            Audience::Many(auds) => auds.iter().any(|aud| aud == audience),
        }
    }
}

/// Claims of a verified token.
///
/// Standard claims are lifted into fields; everything else, including
/// provider-specific claims such as `bankid_pid`, stays reachable through
/// [`custom`](Self::custom). `claims` is the payload exactly as signed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Subject claim ("sub") - unique user identifier at the issuer.
    pub sub: String,

    /// Issuer claim ("iss").
    pub iss: Option<String>,

    /// Audience claim ("aud").
    pub aud: Option<Audience>,

    /// Expiry ("exp"), seconds since the epoch.
    pub exp: i64,

    /// Issued-at ("iat"), seconds since the epoch.
    pub iat: Option<i64>,

    /// Not-before ("nbf"), seconds since the epoch.
    pub nbf: Option<i64>,

    /// Time the end user authenticated ("auth_time").
    pub auth_time: Option<i64>,

    /// Scopes from "scope" (list or space-delimited string) or "scp".
    pub scopes: Vec<String>,

    /// Upstream identity provider ("idp"), when the issuer brokers logins.
    pub idp: Option<String>,

    /// Raw claims for advanced access.
    pub claims: serde_json::Value,
}

impl IdTokenClaims {
    /// Project a verified payload.
    ///
    /// Fails with `MalformedToken` when the payload is not a JSON object or
    /// lacks `sub` or a numeric `exp`.
    pub fn from_claims(claims: serde_json::Value) -> Result<Self, SecurityError> {
        if !claims.is_object() {
            return Err(SecurityError::MalformedToken(
                "token payload is not a JSON object".into(),
            ));
        }

        let sub = string_claim(&claims, "sub").ok_or_else(|| {
            SecurityError::MalformedToken("token payload missing 'sub' claim".into())
        })?;
        let exp = timestamp_claim(&claims, "exp").ok_or_else(|| {
            SecurityError::MalformedToken("token payload missing numeric 'exp' claim".into())
        })?;
        let aud = claims
            .get("aud")
            .and_then(|v| serde_json::from_value::<Audience>(v.clone()).ok());

        Ok(Self {
            sub,
            iss: string_claim(&claims, "iss"),
            aud,
            exp,
            iat: timestamp_claim(&claims, "iat"),
            nbf: timestamp_claim(&claims, "nbf"),
            auth_time: timestamp_claim(&claims, "auth_time"),
            scopes: scopes(&claims),
            idp: string_claim(&claims, "idp"),
            claims,
        })
    }

    /// Any claim by name.
    pub fn custom(&self, name: &str) -> Option<&serde_json::Value> {
        self.claims.get(name)
    }

    /// A string claim by name.
    pub fn custom_str(&self, name: &str) -> Option<&str> {
        self.custom(name).and_then(|v| v.as_str())
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.iat.and_then(|ts| DateTime::from_timestamp(ts, 0))
    }

    pub fn auth_time_at(&self) -> Option<DateTime<Utc>> {
        self.auth_time.and_then(|ts| DateTime::from_timestamp(ts, 0))
    }

    /// Claims that are not lifted into a field, sorted by name.
    pub fn extra_claims(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        const LIFTED: &[&str] = &[
            "sub", "iss", "aud", "exp", "iat", "nbf", "auth_time", "scope", "scp", "idp",
        ];
        let mut extra: Vec<(&str, &serde_json::Value)> = self
            .claims
            .as_object()
            .into_iter()
            .flat_map(|map| map.iter())
            .filter(|(name, _)| !LIFTED.contains(&name.as_str()))
            .map(|(name, value)| (name.as_str(), value))
            .collect();
        extra.sort_unstable_by_key(|(name, _)| *name);
        extra.into_iter()
    }
}

fn string_claim(claims: &serde_json::Value, name: &str) -> Option<String> {
    claims.get(name).and_then(|v| v.as_str()).map(String::from)
}

/// NumericDate claims may be integers or floats; fractions are dropped.
fn timestamp_claim(claims: &serde_json::Value, name: &str) -> Option<i64> {
    let value = claims.get(name)?;
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

fn scopes(claims: &serde_json::Value) -> Vec<String> {
    let raw = claims.get("scope").or_else(|| claims.get("scp"));
    match raw {
        Some(serde_json::Value::String(spaced)) => {
            spaced.split_whitespace().map(String::from).collect()
        }
        Some(serde_json::Value::Array(list)) => list
            .iter()
            .filter_map(|v| v.as_str())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}
