use std::error::Error as StdError;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_login::tower_sessions::session;
use log::*;
use vipps_auth::ErrorKind;

use crate::auth::Backend;
use crate::flash::Level;

pub type Result<T> = core::result::Result<T, Error>;

pub(crate) const GENERIC_LOGIN_FAILURE: &str = "Something went wrong while logging you in. \
     Please try again, if the error persists contact the site administrator.";

#[derive(Debug)]
pub enum Error {
    Vipps(vipps_auth::Error),
    Session(session::Error),
    Auth(Box<dyn StdError + Send + Sync>),
}

impl StdError for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> core::result::Result<(), std::fmt::Error> {
        match self {
            Error::Vipps(err) => write!(fmt, "{err}"),
            Error::Session(err) => write!(fmt, "Session store error: {err}"),
            Error::Auth(err) => write!(fmt, "Login session error: {err}"),
        }
    }
}

impl Error {
    /// Text shown to the user in a flash message.
    pub fn user_message(&self) -> String {
        let Error::Vipps(err) = self else {
            return GENERIC_LOGIN_FAILURE.to_string();
        };
        match &err.error_kind {
            ErrorKind::MalformedState | ErrorKind::Configuration | ErrorKind::Storage => {
                GENERIC_LOGIN_FAILURE.to_string()
            }
            ErrorKind::ProviderRejected(body) => format!("Login Failed: {body}"),
            ErrorKind::InvalidProviderResponse | ErrorKind::Network => {
                format!("Login Failed: {err}")
            }
            ErrorKind::RequestTimeout
            | ErrorKind::VerifiedEmailRequired
            | ErrorKind::RegistrationClosed => err.to_string(),
        }
    }

    pub fn level(&self) -> Level {
        match self {
            Error::Vipps(vipps_auth::Error {
                error_kind: ErrorKind::VerifiedEmailRequired | ErrorKind::RegistrationClosed,
                ..
            }) => Level::Warning,
            _ => Level::Error,
        }
    }
}

// Only reached when the flash message itself cannot be stored.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        error!("Responding with internal error: {self}");
        (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL SERVER ERROR").into_response()
    }
}

impl From<vipps_auth::Error> for Error {
    fn from(err: vipps_auth::Error) -> Self {
        Error::Vipps(err)
    }
}

impl From<session::Error> for Error {
    fn from(err: session::Error) -> Self {
        Error::Session(err)
    }
}

impl From<axum_login::Error<Backend>> for Error {
    fn from(err: axum_login::Error<Backend>) -> Self {
        Error::Auth(Box::new(err))
    }
}
