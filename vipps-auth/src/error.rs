//! Error types for the `vipps-auth` crate.
//!
//! Follows the same pattern as the other workspace crates: a root `Error` struct holding
//! an `ErrorKind` and an optional source for error chaining.

use std::error::Error as StdError;
use std::fmt;

/// Top-level error type for vipps-auth.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Kinds of failure a login attempt can end in.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    /// Missing credentials or an endpoint that cannot be resolved. Site administrator facing.
    Configuration,
    /// The `state` parameter failed integrity verification or could not be decoded.
    MalformedState,
    /// The PKCE verifier expired before the provider redirected back.
    RequestTimeout,
    /// The provider answered the token request with a 4xx. Holds the response body.
    ProviderRejected(String),
    /// The provider answered with a body the flow cannot use.
    InvalidProviderResponse,
    /// The provider did not assert a verified email address.
    VerifiedEmailRequired,
    /// No linked or matching account exists and public registration is turned off.
    RegistrationClosed,
    /// The provider could not be reached or answered with a server error.
    Network,
    /// The user store failed.
    Storage,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Configuration => write!(f, "Vipps login is not configured correctly"),
            ErrorKind::MalformedState => write!(f, "Malformed state parameter"),
            ErrorKind::RequestTimeout => write!(
                f,
                "Authorization was not completed within the timeframe. Please try again."
            ),
            ErrorKind::ProviderRejected(body) => write!(f, "Provider rejected request: {}", body),
            ErrorKind::InvalidProviderResponse => write!(f, "Invalid response from Vipps"),
            ErrorKind::VerifiedEmailRequired => write!(
                f,
                "You need to have a vipps-verified email to use this feature."
            ),
            ErrorKind::RegistrationClosed => write!(
                f,
                "You are not registered with this site. New registrations is currently turned off."
            ),
            ErrorKind::Network => write!(f, "Unable to reach Vipps"),
            ErrorKind::Storage => write!(f, "User storage error"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // Failing to decode a body is the provider's fault, everything else is transport.
        let error_kind = if err.is_decode() {
            ErrorKind::InvalidProviderResponse
        } else if err.is_builder() {
            ErrorKind::Configuration
        } else {
            ErrorKind::Network
        };

        Error {
            source: Some(Box::new(err)),
            error_kind,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::InvalidProviderResponse,
        }
    }
}

impl Error {
    /// Create an error of the given kind without a source.
    pub fn new(error_kind: ErrorKind) -> Self {
        Error {
            source: None,
            error_kind,
        }
    }
}

/// Helper function to create configuration errors.
pub fn config_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Configuration,
    }
}

/// Helper function to create malformed state errors.
pub fn state_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::MalformedState,
    }
}

/// Helper function to create invalid provider response errors.
pub fn response_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::InvalidProviderResponse,
    }
}

/// Helper function to create user storage errors.
pub fn storage_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Storage,
    }
}
