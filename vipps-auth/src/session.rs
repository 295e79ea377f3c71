//! The Vipps session established after a successful token exchange.
//!
//! A [`Session`] holds the access token and its expiry. User claims are fetched lazily
//! through a [`UserInfoSource`] the first time they are needed and cached on the
//! instance. Sessions serialize to JSON so the web layer can keep them in the browser
//! session store between requests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;

use crate::error::{response_error, Error};

/// Something that can turn an access token into user claims.
#[async_trait]
pub trait UserInfoSource: Send + Sync {
    async fn fetch_user_info(&self, access_token: &str) -> Result<Claims, Error>;
}

/// Token endpoint response body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub expires_in: Option<i64>,
    pub token_type: Option<String>,
    pub id_token: Option<String>,
    pub scope: Option<String>,
}

/// Postal address as returned in the `address` claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street_address: Option<String>,
    pub postal_code: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub formatted: Option<String>,
    pub address_type: Option<String>,
}

/// User claims returned by the userinfo endpoint.
///
/// Kept as the raw JSON object; accessors return `None` for absent claims and for
/// claims of the wrong type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    pub fn new(claims: Map<String, Value>) -> Self {
        Self(claims)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    fn string(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn sub(&self) -> Option<&str> {
        self.string("sub")
    }

    pub fn sid(&self) -> Option<&str> {
        self.string("sid")
    }

    pub fn email(&self) -> Option<&str> {
        self.string("email")
    }

    pub fn email_verified(&self) -> Option<bool> {
        self.0.get("email_verified").and_then(Value::as_bool)
    }

    pub fn given_name(&self) -> Option<&str> {
        self.string("given_name")
    }

    pub fn family_name(&self) -> Option<&str> {
        self.string("family_name")
    }

    /// The full name (`name` claim).
    pub fn display_name(&self) -> Option<&str> {
        self.string("name")
    }

    pub fn phone_number(&self) -> Option<&str> {
        self.string("phone_number")
    }

    pub fn nin(&self) -> Option<&str> {
        self.string("nin")
    }

    pub fn address(&self) -> Option<Address> {
        self.0
            .get("address")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Birth date in strict `YYYY-MM-DD` form. Anything else yields `None`.
    pub fn birthdate(&self) -> Option<NaiveDate> {
        self.string("birthdate").and_then(parse_birthdate)
    }
}

fn parse_birthdate(value: &str) -> Option<NaiveDate> {
    let bytes = value.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    if !bytes
        .iter()
        .enumerate()
        .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit())
    {
        return None;
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

/// An authenticated Vipps session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "StoredSession", into = "StoredSession")]
pub struct Session {
    access_token: SecretString,
    expires_at: DateTime<Utc>,
    claims: OnceCell<Claims>,
}

/// Serialized form of [`Session`].
#[derive(Serialize, Deserialize)]
struct StoredSession {
    access_token: String,
    expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    claims: Option<Claims>,
}

impl From<StoredSession> for Session {
    fn from(stored: StoredSession) -> Self {
        let claims = match stored.claims {
            Some(claims) => OnceCell::new_with(Some(claims)),
            None => OnceCell::new(),
        };
        Session {
            access_token: SecretString::new(stored.access_token),
            expires_at: stored.expires_at,
            claims,
        }
    }
}

impl From<Session> for StoredSession {
    fn from(session: Session) -> Self {
        StoredSession {
            access_token: session.access_token.expose_secret().clone(),
            expires_at: session.expires_at,
            claims: session.claims.into_inner(),
        }
    }
}

impl Session {
    pub fn new(access_token: SecretString, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token,
            expires_at,
            claims: OnceCell::new(),
        }
    }

    /// Build a session from a token endpoint response received at `now`.
    ///
    /// A missing `expires_in` is treated as zero, producing an already expired session.
    pub fn from_token_response(response: TokenResponse, now: DateTime<Utc>) -> Result<Self, Error> {
        let access_token = response
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| response_error("Token response has no access_token"))?;
        let expires_in = response.expires_in.unwrap_or(0);

        Ok(Self::new(
            SecretString::new(access_token),
            now + Duration::seconds(expires_in),
        ))
    }

    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// User claims, fetched through `source` on first use and cached afterwards.
    pub async fn claims(&self, source: &dyn UserInfoSource) -> Result<&Claims, Error> {
        self.claims
            .get_or_try_init(|| source.fetch_user_info(self.access_token.expose_secret()))
            .await
    }

    /// Claims if they were already fetched.
    pub fn cached_claims(&self) -> Option<&Claims> {
        self.claims.get()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Time left until expiry. Negative once expired.
    pub fn expires_in(&self) -> Duration {
        self.expires_in_at(Utc::now())
    }

    pub fn expires_in_at(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }
}
