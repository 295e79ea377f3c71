//! PKCE (Proof Key for Code Exchange) support for the automatic-return flow.
//!
//! Implements RFC 7636 S256. The verifier never leaves the server until the token
//! exchange; it is parked in the ephemeral store keyed by the state key.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Duration;
use log::*;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::cache::EphemeralStore;

/// Length of generated code verifiers (the RFC 7636 maximum).
pub const VERIFIER_LENGTH: usize = 128;

/// How long a verifier stays retrievable.
pub const VERIFIER_TTL_SECONDS: i64 = 300;

/// PKCE code verifier (random string).
#[derive(Debug, Clone)]
pub struct PkceVerifier(String);

impl PkceVerifier {
    /// Generate a new random PKCE verifier of [`VERIFIER_LENGTH`] alphanumeric characters.
    pub fn generate() -> Self {
        let verifier = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(VERIFIER_LENGTH)
            .map(char::from)
            .collect();
        Self(verifier)
    }

    /// Create a PKCE verifier from an existing string.
    pub fn from_string(verifier: String) -> Self {
        Self(verifier)
    }

    /// Get the verifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate the corresponding code challenge.
    pub fn challenge(&self) -> PkceChallenge {
        PkceChallenge::from_verifier(self)
    }
}

/// PKCE code challenge (SHA256 hash of verifier).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkceChallenge(String);

impl PkceChallenge {
    /// `BASE64URL-ENCODE(SHA256(ASCII(code_verifier)))` without padding.
    pub fn from_verifier(verifier: &PkceVerifier) -> Self {
        let hash = Sha256::digest(verifier.as_str().as_bytes());
        Self(URL_SAFE_NO_PAD.encode(hash))
    }

    /// Get the challenge string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Whether `challenge` was derived from `verifier`.
pub fn verify_challenge(verifier: &str, challenge: &str) -> bool {
    PkceVerifier::from_string(verifier.to_string())
        .challenge()
        .as_str()
        == challenge
}

fn store_key(state_key: &str) -> String {
    format!("pkce:{}", state_key)
}

/// Generates challenges and parks their verifiers in the ephemeral store.
#[derive(Clone)]
pub struct PkceGenerator {
    store: Arc<dyn EphemeralStore>,
    ttl: Duration,
}

impl PkceGenerator {
    /// Create a generator with the default five minute verifier lifetime.
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self::with_ttl(store, Duration::seconds(VERIFIER_TTL_SECONDS))
    }

    /// Create a generator with a custom verifier lifetime.
    pub fn with_ttl(store: Arc<dyn EphemeralStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Generate a verifier for `state_key`, store it, and return the challenge.
    pub async fn generate(&self, state_key: &str) -> PkceChallenge {
        let verifier = PkceVerifier::generate();
        let challenge = verifier.challenge();
        self.store
            .set(&store_key(state_key), verifier.0, self.ttl)
            .await;
        trace!("Stored PKCE verifier for state key {}", state_key);
        challenge
    }

    /// Retrieve the verifier stored for `state_key`. Each verifier can be read once.
    pub async fn retrieve_verifier(&self, state_key: &str) -> Option<PkceVerifier> {
        self.store
            .take(&store_key(state_key))
            .await
            .map(PkceVerifier::from_string)
    }
}
