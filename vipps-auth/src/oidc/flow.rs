//! The Vipps authorization code flow.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::*;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use super::discovery::DiscoveryResolver;
use super::pkce::PkceGenerator;
use super::state::{FlowState, StateCodec};
use crate::cache::EphemeralStore;
use crate::error::{response_error, Error, ErrorKind};
use crate::session::{Claims, Session, TokenResponse, UserInfoSource};
use crate::settings::{Flow, Settings};

const FALLBACK_AUTH_PATH: &str = "/access-management-1.0/access/oauth2/auth";
const FALLBACK_TOKEN_PATH: &str = "/access-management-1.0/access/oauth2/token";
const FALLBACK_USERINFO_PATH: &str = "/vipps-userinfo-api/userinfo";

const AUTOMATIC_RETURN_FLOW: &str = "automatic_return_from_vipps_app";

/// A ready-to-use authorization URL and the state it embeds.
///
/// The caller binds `state.key` to the browser session so the callback can be matched
/// to the browser that started the attempt.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: FlowState,
}

#[derive(Debug, Serialize)]
struct TokenExchangeRequest<'a> {
    grant_type: &'a str,
    code: &'a str,
    redirect_uri: &'a str,
    client_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code_verifier: Option<&'a str>,
}

/// Builds authorization URLs and exchanges authorization codes for sessions.
#[derive(Clone)]
pub struct FlowEngine {
    settings: Arc<Settings>,
    http_client: reqwest::Client,
    discovery: DiscoveryResolver,
    pkce: PkceGenerator,
    state_codec: StateCodec,
}

impl FlowEngine {
    /// Create an engine. `http_client` should be built with
    /// [`crate::http::HttpClientBuilder`] so every provider call carries a timeout.
    pub fn new(
        settings: Arc<Settings>,
        http_client: reqwest::Client,
        store: Arc<dyn EphemeralStore>,
    ) -> Self {
        let discovery = DiscoveryResolver::new(&settings, http_client.clone(), store.clone());
        let state_codec = StateCodec::new(settings.state_secret.clone());
        Self {
            settings,
            http_client,
            discovery,
            pkce: PkceGenerator::new(store),
            state_codec,
        }
    }

    /// Replace the PKCE generator, e.g. to change the verifier lifetime.
    pub fn with_pkce(mut self, pkce: PkceGenerator) -> Self {
        self.pkce = pkce;
        self
    }

    /// Replace the discovery resolver, e.g. to change the cache lifetime.
    pub fn with_discovery(mut self, discovery: DiscoveryResolver) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn discovery(&self) -> &DiscoveryResolver {
        &self.discovery
    }

    /// Verify and decode a `state` parameter received on a callback.
    pub fn unpack_state(&self, packed_state: &str) -> Result<FlowState, Error> {
        self.state_codec.unpack(packed_state)
    }

    fn fallback(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url(), path)
    }

    /// Build the URL the browser is redirected to in order to start `flow`.
    pub async fn build_authorization_url(
        &self,
        flow: Flow,
        return_url: Option<String>,
    ) -> Result<AuthorizationRequest, Error> {
        self.settings.validate()?;

        let state = FlowState::new(return_url);
        let packed_state = self.state_codec.pack(&state)?;

        let endpoint = self
            .discovery
            .resolve(
                "authorization_endpoint",
                Some(&self.fallback(FALLBACK_AUTH_PATH)),
            )
            .await?;
        let mut url = Url::parse(&endpoint).map_err(|e| Error {
            source: Some(Box::new(e)),
            error_kind: ErrorKind::Configuration,
        })?;

        let challenge = if self.settings.automatic_return(flow) {
            Some(self.pkce.generate(&state.key).await)
        } else {
            None
        };

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.settings.credentials().client_id)
                .append_pair("response_type", "code")
                .append_pair("scope", &self.settings.scopes(flow).join(" "))
                .append_pair("state", &packed_state)
                .append_pair("redirect_uri", &self.settings.redirect_uri(flow));

            if let Some(challenge) = &challenge {
                query
                    .append_pair("requested_flow", AUTOMATIC_RETURN_FLOW)
                    .append_pair("code_challenge", challenge.as_str())
                    .append_pair("code_challenge_method", "S256");
            }
        }

        debug!("Built {} authorization URL", flow.as_str());

        Ok(AuthorizationRequest {
            url: url.into(),
            state,
        })
    }

    /// Exchange an authorization code received on the callback of `flow` for a session.
    pub async fn exchange_code(
        &self,
        flow: Flow,
        code: &str,
        packed_state: &str,
    ) -> Result<Session, Error> {
        self.settings.validate()?;

        let state = self.state_codec.unpack(packed_state)?;

        let verifier = if self.settings.automatic_return(flow) {
            match self.pkce.retrieve_verifier(&state.key).await {
                Some(verifier) => Some(verifier),
                None => {
                    info!("PKCE verifier missing or expired for {} flow", flow.as_str());
                    return Err(Error::new(ErrorKind::RequestTimeout));
                }
            }
        } else {
            None
        };

        let token_url = self
            .discovery
            .resolve("token_endpoint", Some(&self.fallback(FALLBACK_TOKEN_PATH)))
            .await?;

        let credentials = self.settings.credentials();
        let redirect_uri = self.settings.redirect_uri(flow);
        let request = TokenExchangeRequest {
            grant_type: "authorization_code",
            code,
            redirect_uri: &redirect_uri,
            client_id: &credentials.client_id,
            code_verifier: verifier.as_ref().map(|v| v.as_str()),
        };

        debug!("Exchanging Vipps authorization code for tokens");

        let response = self
            .http_client
            .post(&token_url)
            .basic_auth(
                &credentials.client_id,
                Some(credentials.client_secret.expose_secret()),
            )
            .form(&request)
            .send()
            .await
            .inspect_err(|e| warn!("Failed to exchange Vipps authorization code: {:?}", e))?;

        let body = read_success_body(response, "token").await?;
        let tokens: TokenResponse = serde_json::from_str(&body)
            .inspect_err(|e| warn!("Failed to parse Vipps token response: {:?}", e))?;

        let session = Session::from_token_response(tokens, Utc::now())?;
        info!("Successfully exchanged Vipps authorization code for a session");
        Ok(session)
    }

    /// Fetch the user's claims with `access_token`.
    pub async fn fetch_user_info(&self, access_token: &str) -> Result<Claims, Error> {
        let userinfo_url = self
            .discovery
            .resolve(
                "userinfo_endpoint",
                Some(&self.fallback(FALLBACK_USERINFO_PATH)),
            )
            .await?;

        let response = self
            .http_client
            .get(&userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .inspect_err(|e| warn!("Failed to get Vipps user info: {:?}", e))?;

        let body = read_success_body(response, "userinfo").await?;
        match serde_json::from_str::<Value>(&body)? {
            Value::Object(claims) => Ok(Claims::new(claims)),
            _ => Err(response_error("Userinfo response is not a JSON object")),
        }
    }
}

#[async_trait]
impl UserInfoSource for FlowEngine {
    async fn fetch_user_info(&self, access_token: &str) -> Result<Claims, Error> {
        FlowEngine::fetch_user_info(self, access_token).await
    }
}

/// Body of a 2xx response. Client errors carry the body, server errors are transport failures.
async fn read_success_body(response: reqwest::Response, what: &str) -> Result<String, Error> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        Ok(body)
    } else if status.is_client_error() {
        warn!("Vipps {} request rejected with {}: {}", what, status, body);
        Err(Error::new(ErrorKind::ProviderRejected(body)))
    } else {
        warn!("Vipps {} request failed with {}", what, status);
        Err(Error {
            source: Some(format!("Vipps {} endpoint returned {}", what, status).into()),
            error_kind: ErrorKind::Network,
        })
    }
}
