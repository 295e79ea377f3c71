//! OpenID discovery document resolution.

use std::sync::Arc;

use chrono::Duration;
use log::*;
use serde_json::{Map, Value};

use crate::cache::EphemeralStore;
use crate::error::{config_error, response_error, Error, ErrorKind};
use crate::settings::{Environment, Settings};

/// Path of the discovery document below the environment base URL.
pub const DISCOVERY_PATH: &str = "/access-management-1.0/access/.well-known/openid-configuration";

/// How long a fetched discovery document is reused.
pub const DISCOVERY_TTL_SECONDS: i64 = 3600;

const CACHE_KEY_PREFIX: &str = "vipps-login-openid-configuration";

/// Cache key of the discovery document for `environment`.
pub fn cache_key(environment: Environment) -> String {
    format!("{}:{}", CACHE_KEY_PREFIX, environment.as_str())
}

/// Resolves logical endpoint names (`authorization_endpoint`, `token_endpoint`, ...)
/// against the provider's discovery document.
#[derive(Clone)]
pub struct DiscoveryResolver {
    http_client: reqwest::Client,
    store: Arc<dyn EphemeralStore>,
    discovery_url: String,
    cache_key: String,
    ttl: Duration,
}

impl DiscoveryResolver {
    pub fn new(
        settings: &Settings,
        http_client: reqwest::Client,
        store: Arc<dyn EphemeralStore>,
    ) -> Self {
        Self::with_ttl(
            settings,
            http_client,
            store,
            Duration::seconds(DISCOVERY_TTL_SECONDS),
        )
    }

    pub fn with_ttl(
        settings: &Settings,
        http_client: reqwest::Client,
        store: Arc<dyn EphemeralStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            http_client,
            store,
            discovery_url: format!("{}{}", settings.base_url(), DISCOVERY_PATH),
            cache_key: cache_key(settings.environment),
            ttl,
        }
    }

    /// Resolve `endpoint_name` to a URL.
    ///
    /// Uses the cached document when present, otherwise fetches and caches a fresh one.
    /// When the document lacks the endpoint, `default_url` is returned; without a default
    /// this is a configuration error.
    pub async fn resolve(
        &self,
        endpoint_name: &str,
        default_url: Option<&str>,
    ) -> Result<String, Error> {
        let document = self.document().await?;

        match document.get(endpoint_name).and_then(Value::as_str) {
            Some(url) => Ok(url.to_string()),
            None => match default_url {
                Some(default_url) => {
                    debug!(
                        "Discovery document has no {}, using default {}",
                        endpoint_name, default_url
                    );
                    Ok(default_url.to_string())
                }
                None => Err(config_error(&format!(
                    "OpenID configuration has no {} and no default value is provided",
                    endpoint_name
                ))),
            },
        }
    }

    /// Drop the cached document. Called when settings are saved.
    pub async fn invalidate(&self) {
        info!("Invalidating cached OpenID configuration");
        self.store.delete(&self.cache_key).await;
    }

    async fn document(&self) -> Result<Map<String, Value>, Error> {
        if let Some(raw) = self.store.get(&self.cache_key).await {
            match parse_document(&raw) {
                Ok(document) => return Ok(document),
                Err(_) => {
                    warn!("Dropping unreadable cached OpenID configuration");
                    self.store.delete(&self.cache_key).await;
                }
            }
        }

        let raw = self.fetch().await?;
        let document = parse_document(&raw)
            .inspect_err(|e| warn!("Unusable OpenID configuration: {}", e))?;
        self.store.set(&self.cache_key, raw, self.ttl).await;
        Ok(document)
    }

    async fn fetch(&self) -> Result<String, Error> {
        debug!("Fetching OpenID configuration from {}", self.discovery_url);

        let response = self
            .http_client
            .get(&self.discovery_url)
            .send()
            .await
            .inspect_err(|e| warn!("Failed to fetch OpenID configuration: {:?}", e))?;

        let status = response.status();
        if !status.is_success() {
            warn!("OpenID configuration request failed with status {}", status);
            return Err(Error {
                source: Some(format!("Discovery returned {}", status).into()),
                error_kind: ErrorKind::Network,
            });
        }

        Ok(response.text().await?)
    }
}

/// Only a JSON object is a usable discovery document.
fn parse_document(raw: &str) -> Result<Map<String, Value>, Error> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(document) => Ok(document),
        _ => Err(response_error("OpenID configuration is not a JSON object")),
    }
}
