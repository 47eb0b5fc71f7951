#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use keyward_security::{FetchError, JwksFetcher, KeySet};
use keyward_security::jwks::FetchFuture;
use rand::rngs::OsRng;
use rsa::pkcs8::EncodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};

pub const PROVIDER: &str = "https://idp.example.test/.well-known/openid-configuration/jwks";

/// RSA-2048 key material for signing test tokens.
pub struct TestKey {
    pub encoding_key: EncodingKey,
    pub n: String,
    pub e: String,
}

impl TestKey {
    fn generate() -> Self {
        let private_key = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        let pem = private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        Self {
            encoding_key: EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap(),
            n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
        }
    }

    /// JWK entry publishing this key under `kid`, bound to RS256.
    pub fn jwk(&self, kid: &str) -> Value {
        json!({
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": kid,
            "n": self.n,
            "e": self.e,
        })
    }
}

/// Key generation is slow in debug builds; share one per test binary.
pub fn signing_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(TestKey::generate)
}

/// A second, unrelated key pair.
pub fn other_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(TestKey::generate)
}

/// JWKS document publishing [`signing_key`] under each of `kids`.
pub fn jwks_for(kids: &[&str]) -> Value {
    let keys: Vec<Value> = kids.iter().map(|kid| signing_key().jwk(kid)).collect();
    json!({ "keys": keys })
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Standard claims for a token valid for the next hour.
pub fn claims_for(sub: &str) -> Value {
    let now = now();
    json!({
        "sub": sub,
        "iss": "https://idp.example.test",
        "aud": "keyward-tests",
        "iat": now,
        "exp": now + 3600,
    })
}

/// Sign `claims` with [`signing_key`], RS256, under `kid`.
pub fn mint(kid: &str, claims: &Value) -> String {
    mint_with(signing_key(), Algorithm::RS256, Some(kid), claims)
}

pub fn mint_with(key: &TestKey, alg: Algorithm, kid: Option<&str>, claims: &Value) -> String {
    let mut header = Header::new(alg);
    header.kid = kid.map(String::from);
    encode(&header, claims, &key.encoding_key).unwrap()
}

/// An unsigned token with an arbitrary header; the signature segment is junk.
pub fn forge(header: &Value, claims: &Value) -> String {
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
        URL_SAFE_NO_PAD.encode(b"not-a-signature"),
    )
}

/// In-memory identity provider: serves a JWKS document, or a failure, and
/// counts how often it was asked.
pub struct FakeProvider {
    document: Mutex<Value>,
    failure: Mutex<Option<FetchError>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(document: Value) -> Self {
        Self {
            document: Mutex::new(document),
            failure: Mutex::new(None),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn publishing(kids: &[&str]) -> Self {
        Self::new(jwks_for(kids))
    }

    pub fn failing(err: FetchError) -> Self {
        let provider = Self::new(jwks_for(&[]));
        provider.fail_with(err);
        provider
    }

    /// Every fetch takes `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn publish(&self, document: Value) {
        *self.document.lock().unwrap() = document;
    }

    pub fn fail_with(&self, err: FetchError) {
        *self.failure.lock().unwrap() = Some(err);
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl JwksFetcher for FakeProvider {
    fn fetch<'a>(&'a self, jwks_uri: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let failure = self.failure.lock().unwrap().clone();
            if let Some(err) = failure {
                return Err(err);
            }
            let body = self.document.lock().unwrap().to_string();
            KeySet::from_jwks_json(jwks_uri, body.as_bytes())
        })
    }
}
