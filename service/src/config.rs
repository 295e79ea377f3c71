use clap::builder::TypedValueParser as _;
use clap::{ArgAction, Parser};
use dotenvy::dotenv;
use log::{warn, LevelFilter};
use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::SecretString;
use std::fmt;
use std::str::FromStr;
use vipps_auth::settings::{Credentials, Environment, FlowSettings, ScopeSelection, Settings};

/// Length of the state signing key generated when none is configured.
const GENERATED_STATE_SECRET_LENGTH: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub enum RustEnv {
    Development,
    Production,
    Staging,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RustEnvParseError;

impl FromStr for RustEnv {
    type Err = RustEnvParseError;
    fn from_str(level: &str) -> Result<RustEnv, Self::Err> {
        match level.to_lowercase().as_str() {
            "development" => Ok(RustEnv::Development),
            "production" => Ok(RustEnv::Production),
            "staging" => Ok(RustEnv::Staging),
            _ => Err(RustEnvParseError),
        }
    }
}

impl fmt::Display for RustEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RustEnv::Development => write!(f, "development"),
            RustEnv::Production => write!(f, "production"),
            RustEnv::Staging => write!(f, "staging"),
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// The host interface to listen for incoming connections
    #[arg(short, long, env, default_value = "127.0.0.1")]
    pub interface: Option<String>,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env, default_value_t = 4000)]
    pub port: u16,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,

    /// Set the Rust runtime environment to use.
    #[arg(
    short,
    long,
    env,
    default_value_t = RustEnv::Development,
    value_parser = clap::builder::PossibleValuesParser::new([
        "DEVELOPMENT", "PRODUCTION", "STAGING",
        "development", "production", "staging"
    ])
        .map(|s| s.parse::<RustEnv>().unwrap()),
    )]
    pub runtime_env: RustEnv,

    /// Session expiry duration in seconds (default: 24 hours = 86400 seconds)
    #[arg(long, env, default_value_t = 86400)]
    pub backend_session_expiry_seconds: u64,

    /// Which Vipps API environment to talk to.
    #[arg(
        long,
        env,
        default_value_t = Environment::Test,
        value_parser = clap::builder::PossibleValuesParser::new([
            "TEST", "PRODUCTION", "PROD", "test", "production", "prod"
        ])
            .map(|s| s.parse::<Environment>().unwrap()),
    )]
    pub vipps_environment: Environment,

    /// Client ID for the Vipps test environment
    #[arg(long, env, default_value = "")]
    vipps_test_client_id: String,

    /// Client secret for the Vipps test environment
    #[arg(long, env, default_value = "")]
    vipps_test_client_secret: String,

    /// Subscription key for the Vipps test environment
    #[arg(long, env, default_value = "")]
    vipps_test_subscription_key: String,

    /// Client ID for the Vipps production environment
    #[arg(long, env, default_value = "")]
    vipps_prod_client_id: String,

    /// Client secret for the Vipps production environment
    #[arg(long, env, default_value = "")]
    vipps_prod_client_secret: String,

    /// Subscription key for the Vipps production environment
    #[arg(long, env, default_value = "")]
    vipps_prod_subscription_key: String,

    /// Overrides the Vipps API base URL. Override in tests to point at a mock server.
    #[arg(long, env)]
    vipps_api_base_url: Option<String>,

    /// Public origin of this site, used to build the Vipps redirect URIs.
    #[arg(long, env, default_value = "http://localhost:4000")]
    pub site_url: String,

    /// Key used to sign the OAuth `state` parameter (at least 32 bytes).
    /// A random key is generated when unset, so attempts in flight fail after a restart.
    #[arg(long, env)]
    state_secret: Option<String>,

    /// Request the address scope in the login flow
    #[arg(long, env, default_value_t = false, action = ArgAction::Set)]
    pub login_scope_address: bool,

    /// Request the birthDate scope in the login flow
    #[arg(long, env, default_value_t = false, action = ArgAction::Set)]
    pub login_scope_birth_date: bool,

    /// Request the email scope in the login flow
    #[arg(long, env, default_value_t = true, action = ArgAction::Set)]
    pub login_scope_email: bool,

    /// Request the name scope in the login flow
    #[arg(long, env, default_value_t = true, action = ArgAction::Set)]
    pub login_scope_name: bool,

    /// Request the phoneNumber scope in the login flow
    #[arg(long, env, default_value_t = true, action = ArgAction::Set)]
    pub login_scope_phone_number: bool,

    /// Request the nin scope in the login flow
    #[arg(long, env, default_value_t = false, action = ArgAction::Set)]
    pub login_scope_nin: bool,

    /// Request the address scope in the continue flow
    #[arg(long, env, default_value_t = false, action = ArgAction::Set)]
    pub continue_scope_address: bool,

    /// Request the birthDate scope in the continue flow
    #[arg(long, env, default_value_t = false, action = ArgAction::Set)]
    pub continue_scope_birth_date: bool,

    /// Request the email scope in the continue flow
    #[arg(long, env, default_value_t = true, action = ArgAction::Set)]
    pub continue_scope_email: bool,

    /// Request the name scope in the continue flow
    #[arg(long, env, default_value_t = true, action = ArgAction::Set)]
    pub continue_scope_name: bool,

    /// Request the phoneNumber scope in the continue flow
    #[arg(long, env, default_value_t = true, action = ArgAction::Set)]
    pub continue_scope_phone_number: bool,

    /// Request the nin scope in the continue flow
    #[arg(long, env, default_value_t = false, action = ArgAction::Set)]
    pub continue_scope_nin: bool,

    /// Use the "automatic return from Vipps app" (PKCE) variant for the login flow
    #[arg(long, env, default_value_t = false, action = ArgAction::Set)]
    pub login_automatic_return: bool,

    /// Use the "automatic return from Vipps app" (PKCE) variant for the continue flow
    #[arg(long, env, default_value_t = false, action = ArgAction::Set)]
    pub continue_automatic_return: bool,

    /// Path to a template overriding the password confirmation page.
    /// `{{error}}` is replaced with the field error, if any.
    #[arg(long, env)]
    verify_template: Option<String>,

    /// Allow Vipps users without a local account to register one.
    #[arg(long, env, default_value_t = false, action = ArgAction::Set)]
    pub allow_public_registration: bool,

    /// Timeout in seconds for every request to Vipps
    #[arg(long, env, default_value_t = 10)]
    pub http_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn set_vipps_api_base_url(mut self, base_url: String) -> Self {
        self.vipps_api_base_url = Some(base_url);
        self
    }

    pub fn vipps_api_base_url(&self) -> Option<String> {
        self.vipps_api_base_url.clone()
    }

    pub fn verify_template(&self) -> Option<String> {
        self.verify_template.clone()
    }

    pub fn runtime_env(&self) -> RustEnv {
        self.runtime_env.clone()
    }

    pub fn is_production(&self) -> bool {
        self.runtime_env() == RustEnv::Production
    }

    fn state_secret(&self) -> SecretString {
        match &self.state_secret {
            Some(secret) => SecretString::new(secret.clone()),
            None => {
                warn!("STATE_SECRET is not set, generating a random state signing key");
                SecretString::new(
                    rand::thread_rng()
                        .sample_iter(&Alphanumeric)
                        .take(GENERATED_STATE_SECRET_LENGTH)
                        .map(char::from)
                        .collect(),
                )
            }
        }
    }

    /// Builds the Vipps login settings from the parsed configuration.
    pub fn vipps_settings(&self) -> Settings {
        Settings {
            environment: self.vipps_environment,
            test_credentials: Credentials::new(
                &self.vipps_test_client_id,
                &self.vipps_test_client_secret,
                &self.vipps_test_subscription_key,
            ),
            production_credentials: Credentials::new(
                &self.vipps_prod_client_id,
                &self.vipps_prod_client_secret,
                &self.vipps_prod_subscription_key,
            ),
            login: FlowSettings {
                scopes: ScopeSelection {
                    address: self.login_scope_address,
                    birth_date: self.login_scope_birth_date,
                    email: self.login_scope_email,
                    name: self.login_scope_name,
                    phone_number: self.login_scope_phone_number,
                    nin: self.login_scope_nin,
                },
                automatic_return: self.login_automatic_return,
            },
            continue_flow: FlowSettings {
                scopes: ScopeSelection {
                    address: self.continue_scope_address,
                    birth_date: self.continue_scope_birth_date,
                    email: self.continue_scope_email,
                    name: self.continue_scope_name,
                    phone_number: self.continue_scope_phone_number,
                    nin: self.continue_scope_nin,
                },
                automatic_return: self.continue_automatic_return,
            },
            verify_template: self.verify_template(),
            site_url: self.site_url.clone(),
            api_base_url: self.vipps_api_base_url(),
            state_secret: self.state_secret(),
        }
    }
}
