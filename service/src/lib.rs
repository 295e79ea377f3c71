use config::Config;
use log::info;
use std::time::Duration;
use vipps_auth::http::HttpClientBuilder;
use vipps_auth::settings::{Flow, Settings};

pub mod config;
pub mod logging;

/// Builds and validates the Vipps login settings.
pub fn init_vipps_settings(config: &Config) -> Result<Settings, vipps_auth::Error> {
    let settings = config.vipps_settings();

    info!(
        "Vipps login config: environment={}, base_url={}, site_url={}, \
         login_scopes=[{}], continue_scopes=[{}], login_automatic_return={}, \
         continue_automatic_return={}, public_registration={}",
        settings.environment,
        settings.base_url(),
        settings.site_url,
        settings.scopes(Flow::Login).join(" "),
        settings.scopes(Flow::Continue).join(" "),
        settings.automatic_return(Flow::Login),
        settings.automatic_return(Flow::Continue),
        config.allow_public_registration,
    );

    settings.validate()?;

    Ok(settings)
}

/// Builds the HTTP client shared by every call to Vipps.
pub fn init_http_client(config: &Config) -> Result<reqwest::Client, vipps_auth::Error> {
    let client = HttpClientBuilder::new()
        .with_timeout(Duration::from_secs(config.http_timeout_secs))
        .build()?;
    Ok(client)
}
