//! Signed `state` parameter for OAuth flows.
//!
//! The state travels through the provider redirect and back, so it carries everything
//! the callback needs: the per-attempt random key (CSRF binding and PKCE lookup) and the
//! return URL. The packed form is `base64url(json) "." base64url(hmac_sha256(json))`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{state_error, Error};

type HmacSha256 = Hmac<Sha256>;

/// Length of the random state key.
pub const STATE_KEY_LENGTH: usize = 50;

/// Upper bound on packed state accepted from a callback.
const MAX_PACKED_LENGTH: usize = 4096;

/// State created per authorization request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowState {
    pub key: String,
    pub return_url: Option<String>,
}

impl FlowState {
    /// Create a state with a fresh random key.
    pub fn new(return_url: Option<String>) -> Self {
        Self {
            key: random_key(),
            return_url,
        }
    }
}

fn random_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(STATE_KEY_LENGTH)
        .map(char::from)
        .collect()
}

/// Packs and verifies [`FlowState`] values.
#[derive(Clone)]
pub struct StateCodec {
    secret: SecretString,
}

impl StateCodec {
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }

    fn mac(&self) -> Result<HmacSha256, Error> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| state_error("Invalid state signing key"))
    }

    /// Produce the opaque, URL-safe token placed in the `state` query parameter.
    pub fn pack(&self, state: &FlowState) -> Result<String, Error> {
        let payload = serde_json::to_vec(state).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: crate::error::ErrorKind::MalformedState,
        })?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        let tag = mac.finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    /// Verify and decode a packed state. Any modification is rejected.
    pub fn unpack(&self, packed: &str) -> Result<FlowState, Error> {
        if packed.len() > MAX_PACKED_LENGTH {
            return Err(state_error("State parameter is too long"));
        }

        let (payload_b64, tag_b64) = packed
            .split_once('.')
            .ok_or_else(|| state_error("State parameter is missing its signature"))?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| state_error("State payload is not valid base64url"))?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| state_error("State signature is not valid base64url"))?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        mac.verify_slice(&tag)
            .map_err(|_| state_error("State signature does not match"))?;

        serde_json::from_slice(&payload).map_err(|_| state_error("State payload is not valid"))
    }
}
