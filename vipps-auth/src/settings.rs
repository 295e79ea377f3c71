//! Static Vipps login settings.
//!
//! Settings are read-only to the flow engine. They are built once at startup (see
//! `service::config::Config::vipps_settings`) and shared behind an `Arc`.

use std::fmt;
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{config_error, Error};

/// Base URL for the production API.
pub const PROD_URL: &str = "https://api.vipps.no";

/// Base URL for the test API.
pub const TEST_URL: &str = "https://apitest.vipps.no";

/// Scopes requested by every flow regardless of settings.
const BASE_SCOPES: [&str; 2] = ["openid", "api_version_2"];

/// Vipps API environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Test,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Test => "test",
            Environment::Production => "production",
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            Environment::Test => TEST_URL,
            Environment::Production => PROD_URL,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct EnvironmentParseError;

impl FromStr for Environment {
    type Err = EnvironmentParseError;
    fn from_str(value: &str) -> Result<Environment, Self::Err> {
        match value.to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(EnvironmentParseError),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The two login flow variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    /// Full login: the provider identity is linked to a local account.
    Login,
    /// Continue with Vipps: only a Vipps session is established.
    Continue,
}

impl Flow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flow::Login => "login",
            Flow::Continue => "continue",
        }
    }

    /// Path of the callback the provider redirects back to.
    pub fn callback_path(&self) -> &'static str {
        match self {
            Flow::Login => "/vipps/login/callback",
            Flow::Continue => "/vipps/continue/callback",
        }
    }

    /// Path that starts this flow.
    pub fn start_path(&self) -> &'static str {
        match self {
            Flow::Login => "/vipps/login",
            Flow::Continue => "/vipps/continue",
        }
    }
}

/// Client credentials for one environment.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: SecretString,
    pub subscription_key: SecretString,
}

impl Credentials {
    pub fn new(client_id: &str, client_secret: &str, subscription_key: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: SecretString::new(client_secret.to_string()),
            subscription_key: SecretString::new(subscription_key.to_string()),
        }
    }

    fn is_complete(&self) -> bool {
        !self.client_id.trim().is_empty()
            && !self.client_secret.expose_secret().trim().is_empty()
            && !self.subscription_key.expose_secret().trim().is_empty()
    }
}

/// Claim scopes a flow asks the user to share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeSelection {
    pub address: bool,
    pub birth_date: bool,
    pub email: bool,
    pub name: bool,
    pub phone_number: bool,
    pub nin: bool,
}

impl Default for ScopeSelection {
    fn default() -> Self {
        Self {
            address: false,
            birth_date: false,
            email: true,
            name: true,
            phone_number: true,
            nin: false,
        }
    }
}

impl ScopeSelection {
    /// Ordered scope list, always starting with `openid` and the API version marker.
    pub fn scopes(&self) -> Vec<&'static str> {
        let mut scopes = BASE_SCOPES.to_vec();
        let optional = [
            (self.address, "address"),
            (self.birth_date, "birthDate"),
            (self.email, "email"),
            (self.name, "name"),
            (self.phone_number, "phoneNumber"),
            (self.nin, "nin"),
        ];
        scopes.extend(
            optional
                .iter()
                .filter(|(enabled, _)| *enabled)
                .map(|(_, scope)| *scope),
        );
        scopes
    }
}

/// Per-flow configuration.
#[derive(Debug, Clone, Default)]
pub struct FlowSettings {
    pub scopes: ScopeSelection,
    /// Enables the PKCE "automatic return from Vipps app" variant.
    pub automatic_return: bool,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: Environment,
    pub test_credentials: Credentials,
    pub production_credentials: Credentials,
    pub login: FlowSettings,
    pub continue_flow: FlowSettings,
    /// Path to a template overriding the password confirmation prompt.
    pub verify_template: Option<String>,
    /// Public origin of the site, e.g. `https://shop.example.no`.
    pub site_url: String,
    /// Overrides the environment base URL. Used to point the engine at a mock provider.
    pub api_base_url: Option<String>,
    /// Key used to sign the `state` parameter.
    pub state_secret: SecretString,
}

impl Settings {
    pub fn in_test(&self) -> bool {
        self.environment == Environment::Test
    }

    pub fn in_production(&self) -> bool {
        !self.in_test()
    }

    /// Base API URL of the active environment.
    pub fn base_url(&self) -> &str {
        self.api_base_url
            .as_deref()
            .unwrap_or_else(|| self.environment.base_url())
            .trim_end_matches('/')
    }

    /// Credentials of the active environment.
    pub fn credentials(&self) -> &Credentials {
        match self.environment {
            Environment::Test => &self.test_credentials,
            Environment::Production => &self.production_credentials,
        }
    }

    pub fn flow(&self, flow: Flow) -> &FlowSettings {
        match flow {
            Flow::Login => &self.login,
            Flow::Continue => &self.continue_flow,
        }
    }

    pub fn scopes(&self, flow: Flow) -> Vec<&'static str> {
        self.flow(flow).scopes.scopes()
    }

    pub fn automatic_return(&self, flow: Flow) -> bool {
        self.flow(flow).automatic_return
    }

    /// Redirect URI registered with Vipps for the given flow.
    pub fn redirect_uri(&self, flow: Flow) -> String {
        format!("{}{}", self.site_url.trim_end_matches('/'), flow.callback_path())
    }

    /// Checks the invariants every flow call relies on.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.credentials().is_complete() {
            return Err(config_error(&format!(
                "Client ID, client secret and subscription key cannot be blank in {} mode",
                self.environment
            )));
        }
        if self.state_secret.expose_secret().len() < 32 {
            return Err(config_error("State secret must be at least 32 bytes"));
        }
        if url::Url::parse(&self.site_url).is_err() {
            return Err(config_error("Site URL must be an absolute URL"));
        }
        Ok(())
    }
}
