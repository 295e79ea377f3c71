//! Controller for the Vipps login and continue flows.
//!
//! Every failure ends in a flash message and a redirect. The provider never shows
//! the user a raw error page from this site.

use crate::auth::{AuthSession, SiteUser};
use crate::error::{Error, GENERIC_LOGIN_FAILURE};
use crate::flash::{self, Level};
use crate::AppState;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::{Form, Json};
use axum_login::tower_sessions::{session, Session};
use log::*;
use serde::Deserialize;
use serde_json::json;
use vipps_auth::error::{response_error, state_error};
use vipps_auth::linkage::FieldError;
use vipps_auth::oidc::FlowState;
use vipps_auth::redirect::{decode_return_param, sanitize_return_url};
use vipps_auth::{Claims, Flow, LinkageOutcome, PasswordConfirmation, Session as VippsSession};

/// Browser session key of the Vipps session.
pub const VIPPS_SESSION_KEY: &str = "vipps_login";
const STATE_KEY: &str = "vipps_state_key";
const VERIFY_RETURN_KEY: &str = "vipps_verify_return";

const HOME: &str = "/";
pub const VERIFY_PATH: &str = "/vipps/login/verify";

const SESSION_EXPIRED: &str = "Session expired. Please log in again.";
const LOGGED_IN: &str = "You are now logged in";

/// Query parameters for starting a flow or logging out
#[derive(Debug, Deserialize)]
pub struct ReturnParams {
    /// base64url encoded return URL
    pub r: Option<String>,
}

/// Query parameters the provider redirects back with
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyForm {
    pub password: String,
}

/// GET /vipps/login
pub async fn login(
    State(app_state): State<AppState>,
    session: Session,
    Query(params): Query<ReturnParams>,
) -> Response {
    start(&app_state, &session, Flow::Login, &params).await
}

/// GET /vipps/continue
pub async fn continue_with_vipps(
    State(app_state): State<AppState>,
    session: Session,
    Query(params): Query<ReturnParams>,
) -> Response {
    start(&app_state, &session, Flow::Continue, &params).await
}

/// GET /vipps/login/callback
pub async fn login_callback(
    State(app_state): State<AppState>,
    mut auth_session: AuthSession,
    session: Session,
    Query(params): Query<CallbackParams>,
) -> Response {
    let return_to = callback_return_url(&app_state, &params);

    if let Some(user) = &auth_session.user {
        let message = format!("You're already logged in as {}.", user.0.friendly_name());
        return flash_and_redirect(&session, Level::Warning, message, &return_to).await;
    }

    if let Some(message) = provider_error(&params) {
        return abandon(&session, message, &return_to).await;
    }

    match complete_login(&app_state, &mut auth_session, &session, &params).await {
        Ok(target) => Redirect::to(&target).into_response(),
        Err(err) => fail(&session, err, &return_to).await,
    }
}

/// GET /vipps/continue/callback
pub async fn continue_callback(
    State(app_state): State<AppState>,
    session: Session,
    Query(params): Query<CallbackParams>,
) -> Response {
    let return_to = callback_return_url(&app_state, &params);

    if let Some(message) = provider_error(&params) {
        return abandon(&session, message, &return_to).await;
    }

    match complete_continue(&app_state, &session, &params).await {
        Ok(target) => flash_and_redirect(&session, Level::Success, LOGGED_IN, &target).await,
        Err(err) => fail(&session, err, &return_to).await,
    }
}

/// GET /vipps/login/verify
///
/// Asks for the password of the local account that uses the Vipps email.
pub async fn verify(State(app_state): State<AppState>, session: Session) -> Response {
    match verification_claims(&app_state, &session).await {
        Ok(Some(claims)) => render_verify(&app_state, &claims, None).await,
        Ok(None) => flash_and_redirect(&session, Level::Error, SESSION_EXPIRED, HOME).await,
        Err(err) => fail(&session, err, HOME).await,
    }
}

/// POST /vipps/login/verify
pub async fn confirm(
    State(app_state): State<AppState>,
    mut auth_session: AuthSession,
    session: Session,
    Form(form): Form<VerifyForm>,
) -> Response {
    let claims = match verification_claims(&app_state, &session).await {
        Ok(Some(claims)) => claims,
        Ok(None) => {
            return flash_and_redirect(&session, Level::Error, SESSION_EXPIRED, HOME).await
        }
        Err(err) => return fail(&session, err, HOME).await,
    };

    match app_state
        .linker
        .confirm_password(&claims, &form.password)
        .await
    {
        Ok(PasswordConfirmation::Linked(user)) => {
            match finish_verification(&mut auth_session, &session, user).await {
                Ok(target) => Redirect::to(&target).into_response(),
                Err(err) => fail(&session, err, HOME).await,
            }
        }
        Ok(PasswordConfirmation::Rejected(field_error)) => {
            render_verify(&app_state, &claims, Some(&field_error)).await
        }
        Err(err) => fail(&session, err.into(), HOME).await,
    }
}

/// GET /vipps/forget
///
/// Drops the Vipps session and keeps any local login.
pub async fn forget(session: Session) -> Result<impl IntoResponse, Error> {
    session.remove_value(VIPPS_SESSION_KEY).await?;
    Ok(Redirect::to(HOME))
}

/// GET /vipps/logout
pub async fn logout(
    State(app_state): State<AppState>,
    mut auth_session: AuthSession,
    session: Session,
    Query(params): Query<ReturnParams>,
) -> Result<impl IntoResponse, Error> {
    let target = return_url(&app_state, &params).unwrap_or_else(|| HOME.to_string());

    session.remove_value(VIPPS_SESSION_KEY).await?;
    if let Some(user) = auth_session.logout().await? {
        info!("Logged out user {}", user.0.id);
    }

    Ok(Redirect::to(&target))
}

/// GET /vipps/status
///
/// The logged in user, the Vipps session and the pending flash messages. Reading the
/// status consumes the flash messages.
pub async fn status(
    auth_session: AuthSession,
    session: Session,
) -> Result<impl IntoResponse, Error> {
    let vipps_session = load_vipps_session(&session).await?;
    let flashes = flash::take(&session).await?;

    let user = auth_session.user.as_ref().map(|SiteUser(user)| {
        json!({
            "id": user.id,
            "email": user.email,
            "name": user.friendly_name(),
        })
    });
    let vipps = vipps_session.as_ref().map(|vipps_session| {
        let claims = vipps_session.cached_claims();
        json!({
            "sub": claims.and_then(Claims::sub),
            "email": claims.and_then(Claims::email),
            "name": claims.and_then(Claims::display_name),
            "expires_in": vipps_session.expires_in().num_seconds(),
        })
    });

    Ok(Json(json!({
        "user": user,
        "vipps": vipps,
        "flashes": flashes,
    })))
}

async fn start(
    app_state: &AppState,
    session: &Session,
    flow: Flow,
    params: &ReturnParams,
) -> Response {
    let return_url = return_url(app_state, params);
    let fallback = return_url.clone().unwrap_or_else(|| HOME.to_string());

    match begin(app_state, session, flow, return_url).await {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(err) => fail(session, err, &fallback).await,
    }
}

async fn begin(
    app_state: &AppState,
    session: &Session,
    flow: Flow,
    return_url: Option<String>,
) -> Result<String, Error> {
    let request = app_state
        .engine
        .build_authorization_url(flow, return_url)
        .await?;
    session.insert(STATE_KEY, &request.state.key).await?;
    debug!("Starting Vipps {} flow", flow.as_str());
    Ok(request.url)
}

async fn complete_login(
    app_state: &AppState,
    auth_session: &mut AuthSession,
    session: &Session,
    params: &CallbackParams,
) -> Result<String, Error> {
    let (code, packed_state) = callback_code(params)?;
    let state = verified_state(app_state, session, packed_state).await?;

    let vipps_session = app_state
        .engine
        .exchange_code(Flow::Login, code, packed_state)
        .await?;
    let claims = vipps_session.claims(&app_state.engine).await?.clone();
    let outcome = app_state.linker.link(&claims).await?;
    session.insert(VIPPS_SESSION_KEY, &vipps_session).await?;

    let return_to = state.return_url.unwrap_or_else(|| HOME.to_string());
    match outcome {
        LinkageOutcome::LoggedIn(user) | LinkageOutcome::Registered(user) => {
            auth_session.login(&SiteUser(user)).await?;
            Ok(return_to)
        }
        LinkageOutcome::ConfirmationRequired { user } => {
            debug!("Asking user {} to confirm their password", user.id);
            session.insert(VERIFY_RETURN_KEY, &return_to).await?;
            Ok(VERIFY_PATH.to_string())
        }
    }
}

async fn complete_continue(
    app_state: &AppState,
    session: &Session,
    params: &CallbackParams,
) -> Result<String, Error> {
    let (code, packed_state) = callback_code(params)?;
    let state = verified_state(app_state, session, packed_state).await?;

    let vipps_session = app_state
        .engine
        .exchange_code(Flow::Continue, code, packed_state)
        .await?;
    let claims = vipps_session.claims(&app_state.engine).await?.clone();
    app_state.linker.continue_session(&claims).await?;
    session.insert(VIPPS_SESSION_KEY, &vipps_session).await?;

    Ok(state.return_url.unwrap_or_else(|| HOME.to_string()))
}

async fn finish_verification(
    auth_session: &mut AuthSession,
    session: &Session,
    user: vipps_auth::LocalUser,
) -> Result<String, Error> {
    auth_session.login(&SiteUser(user)).await?;
    let target: Option<String> = session.remove(VERIFY_RETURN_KEY).await?;
    Ok(target.unwrap_or_else(|| HOME.to_string()))
}

/// Claims of the live Vipps session waiting for password confirmation.
async fn verification_claims(
    app_state: &AppState,
    session: &Session,
) -> Result<Option<Claims>, Error> {
    let Some(vipps_session) = load_vipps_session(session).await? else {
        return Ok(None);
    };
    let claims = vipps_session.claims(&app_state.engine).await?;
    Ok(Some(claims.clone()))
}

/// The stored Vipps session. An expired session is removed.
pub async fn load_vipps_session(
    session: &Session,
) -> Result<Option<VippsSession>, session::Error> {
    let Some(vipps_session) = session.get::<VippsSession>(VIPPS_SESSION_KEY).await? else {
        return Ok(None);
    };
    if vipps_session.is_expired() {
        debug!("Removing expired Vipps session");
        session.remove_value(VIPPS_SESSION_KEY).await?;
        return Ok(None);
    }
    Ok(Some(vipps_session))
}

/// Unpacks the callback state and checks it belongs to this browser session.
async fn verified_state(
    app_state: &AppState,
    session: &Session,
    packed_state: &str,
) -> Result<FlowState, Error> {
    let state = app_state.engine.unpack_state(packed_state)?;
    let bound: Option<String> = session.remove(STATE_KEY).await?;
    if bound.as_deref() != Some(state.key.as_str()) {
        warn!("Callback state is not bound to this browser session");
        return Err(state_error("State key does not match the browser session").into());
    }
    Ok(state)
}

fn callback_code(params: &CallbackParams) -> Result<(&str, &str), Error> {
    let code = params.code.as_deref().filter(|code| !code.is_empty());
    let state = params.state.as_deref().filter(|state| !state.is_empty());
    match (code, state) {
        (Some(code), Some(state)) => Ok((code, state)),
        _ => Err(response_error("Callback is missing code or state").into()),
    }
}

/// Message for an `error` the provider redirected back with.
fn provider_error(params: &CallbackParams) -> Option<String> {
    let error = params.error.as_deref()?;
    info!("Vipps returned error: {}", error);
    Some(
        params
            .error_description
            .clone()
            .filter(|description| !description.is_empty())
            .unwrap_or_else(|| GENERIC_LOGIN_FAILURE.to_string()),
    )
}

/// Return URL carried by a callback's state, or the home page.
///
/// The signature is checked here too, so a forged state cannot pick the target.
fn callback_return_url(app_state: &AppState, params: &CallbackParams) -> String {
    params
        .state
        .as_deref()
        .and_then(|packed| app_state.engine.unpack_state(packed).ok())
        .and_then(|state| state.return_url)
        .unwrap_or_else(|| HOME.to_string())
}

fn return_url(app_state: &AppState, params: &ReturnParams) -> Option<String> {
    params
        .r
        .as_deref()
        .and_then(decode_return_param)
        .and_then(|url| sanitize_return_url(&app_state.settings().site_url, &url))
}

/// End an attempt the provider reported as failed.
async fn abandon(session: &Session, message: String, target: &str) -> Response {
    if let Err(err) = session.remove_value(STATE_KEY).await {
        return Error::from(err).into_response();
    }
    flash_and_redirect(session, Level::Error, message, target).await
}

async fn flash_and_redirect(
    session: &Session,
    level: Level,
    message: impl Into<String>,
    target: &str,
) -> Response {
    match flash::push(session, level, message).await {
        Ok(()) => Redirect::to(target).into_response(),
        Err(err) => Error::from(err).into_response(),
    }
}

async fn fail(session: &Session, err: Error, target: &str) -> Response {
    warn!("Vipps login failed: {}", err);
    flash_and_redirect(session, err.level(), err.user_message(), target).await
}

async fn render_verify(
    app_state: &AppState,
    claims: &Claims,
    field_error: Option<&FieldError>,
) -> Response {
    let email = escape_html(claims.email().unwrap_or_default());
    let error = field_error
        .map(|field_error| escape_html(&field_error.message))
        .unwrap_or_default();

    let template = match &app_state.settings().verify_template {
        Some(path) => match tokio::fs::read_to_string(path).await {
            Ok(template) => Some(template),
            Err(err) => {
                warn!("Unable to read verify template {}: {}", path, err);
                None
            }
        },
        None => None,
    };

    let page = match template {
        Some(template) => template
            .replace("{{email}}", &email)
            .replace("{{error}}", &error),
        None => default_verify_page(&email, &error),
    };
    (StatusCode::OK, Html(page)).into_response()
}

fn default_verify_page(email: &str, error: &str) -> String {
    let error = if error.is_empty() {
        String::new()
    } else {
        format!("<p class=\"error\">{error}</p>")
    };
    format!(
        "<!doctype html>\n<html><head><title>Confirm your account</title></head><body>\
         <h1>Confirm your account</h1>\
         <p>An account using {email} already exists. \
         Enter its password to connect it to Vipps.</p>{error}\
         <form method=\"post\" action=\"{VERIFY_PATH}\">\
         <input type=\"password\" name=\"password\" autocomplete=\"current-password\" required>\
         <button type=\"submit\">Connect</button></form></body></html>"
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user_store::MemoryUserStore;
    use axum::body::Body;
    use axum::http::{header, Request};
    use axum::Router;
    use events::EventPublisher;
    use mockito::{Mock, ServerGuard};
    use secrecy::SecretString;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;
    use vipps_auth::cache::MemoryStore;
    use vipps_auth::http::HttpClientBuilder;
    use vipps_auth::linkage::{RegistrationPolicy, UserStore};
    use vipps_auth::oidc::discovery::DISCOVERY_PATH;
    use vipps_auth::redirect::encode_return_param;
    use vipps_auth::settings::{Credentials, Environment, FlowSettings, Settings};
    use vipps_auth::{AccountLinker, FlowEngine};

    const SITE: &str = "http://localhost:4000";
    const PASSWORD: &str = "hunter22";

    struct TestApp {
        app: Router,
        store: Arc<MemoryUserStore>,
        server: ServerGuard,
        _discovery: Mock,
    }

    fn settings(base_url: &str, verify_template: Option<String>) -> Settings {
        Settings {
            environment: Environment::Test,
            test_credentials: Credentials::new("test-client", "test-secret", "test-sub-key"),
            production_credentials: Credentials::new("", "", ""),
            login: FlowSettings::default(),
            continue_flow: FlowSettings::default(),
            verify_template,
            site_url: SITE.to_string(),
            api_base_url: Some(base_url.to_string()),
            state_secret: SecretString::new("0123456789abcdef0123456789abcdef".to_string()),
        }
    }

    async fn test_app_with(policy: RegistrationPolicy, verify_template: Option<String>) -> TestApp {
        let mut server = mockito::Server::new_async().await;
        let url = server.url();
        let discovery = server
            .mock("GET", DISCOVERY_PATH)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "authorization_endpoint": format!("{url}/auth"),
                    "token_endpoint": format!("{url}/token"),
                    "userinfo_endpoint": format!("{url}/userinfo"),
                })
                .to_string(),
            )
            .create_async()
            .await;

        let store = Arc::new(MemoryUserStore::new());
        let engine = FlowEngine::new(
            Arc::new(settings(&url, verify_template)),
            HttpClientBuilder::new().build().unwrap(),
            Arc::new(MemoryStore::new()),
        );
        let linker = AccountLinker::new(store.clone(), EventPublisher::new(), policy);
        let app = crate::app(
            AppState::new(engine, linker),
            time::Duration::days(1),
            false,
        );

        TestApp {
            app,
            store,
            server,
            _discovery: discovery,
        }
    }

    async fn test_app(policy: RegistrationPolicy) -> TestApp {
        test_app_with(policy, None).await
    }

    fn kari_claims() -> Value {
        json!({
            "sub": "sub-1",
            "email": "kari@example.no",
            "email_verified": true,
            "given_name": "Kari",
            "family_name": "Nordmann",
            "name": "Kari Nordmann",
        })
    }

    async fn mock_provider(server: &mut ServerGuard, expires_in: i64, claims: Value) -> (Mock, Mock) {
        let token = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "access_token": "at-1",
                    "expires_in": expires_in,
                    "token_type": "Bearer",
                })
                .to_string(),
            )
            .create_async()
            .await;
        let userinfo = server
            .mock("GET", "/userinfo")
            .match_header("authorization", "Bearer at-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(claims.to_string())
            .create_async()
            .await;
        (token, userinfo)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        cookie: Option<&str>,
        form: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        let request = match form {
            Some(form) => builder
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(form.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(request).await.unwrap()
    }

    fn session_cookie(response: &Response) -> Option<String> {
        response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(str::to_string)
    }

    /// Follow the session cookie if the response replaced it.
    fn refresh(cookie: &mut String, response: &Response) {
        if let Some(new_cookie) = session_cookie(response) {
            *cookie = new_cookie;
        }
    }

    fn location(response: &Response) -> String {
        response.headers()[header::LOCATION]
            .to_str()
            .unwrap()
            .to_string()
    }

    fn state_param(url: &str) -> String {
        url.split("state=")
            .nth(1)
            .and_then(|rest| rest.split('&').next())
            .unwrap()
            .to_string()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn status_json(app: &Router, cookie: &str) -> Value {
        let response = send(app, "GET", "/vipps/status", Some(cookie), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    /// Start `path` and return the session cookie and the packed state.
    async fn start_flow(
        app: &Router,
        path: &str,
        return_url: Option<&str>,
        cookie: Option<&str>,
    ) -> (String, String) {
        let uri = match return_url {
            Some(return_url) => format!("{}?r={}", path, encode_return_param(return_url)),
            None => path.to_string(),
        };
        let response = send(app, "GET", &uri, cookie, None).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let mut session = cookie.unwrap_or_default().to_string();
        refresh(&mut session, &response);
        (session, state_param(&location(&response)))
    }

    async fn log_in(test: &TestApp, return_url: Option<&str>) -> String {
        let (mut cookie, state) = start_flow(&test.app, "/vipps/login", return_url, None).await;
        let response = send(
            &test.app,
            "GET",
            &format!("/vipps/login/callback?code=abc&state={state}"),
            Some(&cookie),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        refresh(&mut cookie, &response);
        cookie
    }

    #[tokio::test]
    async fn test_health_check() {
        let test = test_app(RegistrationPolicy::Open).await;
        let response = send(&test.app, "GET", "/health", None, None).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "healthy");
    }

    #[tokio::test]
    async fn test_login_redirects_to_vipps() {
        let test = test_app(RegistrationPolicy::Open).await;
        let response = send(&test.app, "GET", "/vipps/login", None, None).await;

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let url = location(&response);
        assert!(url.starts_with(&format!("{}/auth?", test.server.url())));
        assert!(url.contains("client_id=test-client"));
        assert!(url.contains("response_type=code"));
        assert!(!url.contains("code_challenge"));
        assert!(session_cookie(&response).is_some());
    }

    #[tokio::test]
    async fn test_login_registers_new_user_and_returns() {
        let mut test = test_app(RegistrationPolicy::Open).await;
        let (token, userinfo) = mock_provider(&mut test.server, 3600, kari_claims()).await;

        let (mut cookie, state) =
            start_flow(&test.app, "/vipps/login", Some("/checkout"), None).await;
        let response = send(
            &test.app,
            "GET",
            &format!("/vipps/login/callback?code=abc&state={state}"),
            Some(&cookie),
            None,
        )
        .await;

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/checkout");
        refresh(&mut cookie, &response);

        let status = status_json(&test.app, &cookie).await;
        assert_eq!(status["user"]["email"], "kari@example.no");
        assert_eq!(status["user"]["name"], "Kari");
        assert_eq!(status["vipps"]["sub"], "sub-1");
        assert!(test.store.linked_user_id("sub-1").await.is_some());

        token.assert_async().await;
        userinfo.assert_async().await;
    }

    #[tokio::test]
    async fn test_foreign_return_url_is_dropped() {
        let mut test = test_app(RegistrationPolicy::Open).await;
        let _provider = mock_provider(&mut test.server, 3600, kari_claims()).await;

        let (cookie, state) =
            start_flow(&test.app, "/vipps/login", Some("https://evil.example/"), None).await;
        let response = send(
            &test.app,
            "GET",
            &format!("/vipps/login/callback?code=abc&state={state}"),
            Some(&cookie),
            None,
        )
        .await;

        assert_eq!(location(&response), "/");
    }

    #[tokio::test]
    async fn test_callback_error_flashes_description() {
        let test = test_app(RegistrationPolicy::Open).await;
        let (mut cookie, state) =
            start_flow(&test.app, "/vipps/login", Some("/checkout"), None).await;

        let response = send(
            &test.app,
            "GET",
            &format!(
                "/vipps/login/callback?error=access_denied&error_description=User%20cancelled&state={state}"
            ),
            Some(&cookie),
            None,
        )
        .await;
        assert_eq!(location(&response), "/checkout");
        refresh(&mut cookie, &response);

        let status = status_json(&test.app, &cookie).await;
        assert_eq!(status["flashes"][0]["level"], "error");
        assert_eq!(status["flashes"][0]["message"], "User cancelled");
        assert!(status["user"].is_null());
    }

    #[tokio::test]
    async fn test_callback_error_consumes_state_key() {
        let mut test = test_app(RegistrationPolicy::Open).await;
        let (token, _) = mock_provider(&mut test.server, 3600, kari_claims()).await;
        let token = token.expect(0);
        let (mut cookie, state) = start_flow(&test.app, "/vipps/login", None, None).await;

        let response = send(
            &test.app,
            "GET",
            &format!("/vipps/login/callback?error=access_denied&state={state}"),
            Some(&cookie),
            None,
        )
        .await;
        refresh(&mut cookie, &response);
        status_json(&test.app, &cookie).await;

        let response = send(
            &test.app,
            "GET",
            &format!("/vipps/login/callback?code=abc&state={state}"),
            Some(&cookie),
            None,
        )
        .await;
        refresh(&mut cookie, &response);

        let status = status_json(&test.app, &cookie).await;
        assert_eq!(status["flashes"][0]["message"], GENERIC_LOGIN_FAILURE);
        assert!(status["user"].is_null());
        assert!(status["vipps"].is_null());
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_callback_error_without_description_is_generic() {
        let test = test_app(RegistrationPolicy::Open).await;
        let (mut cookie, _) = start_flow(&test.app, "/vipps/login", None, None).await;

        let response = send(
            &test.app,
            "GET",
            "/vipps/login/callback?error=server_error",
            Some(&cookie),
            None,
        )
        .await;
        assert_eq!(location(&response), "/");
        refresh(&mut cookie, &response);

        let status = status_json(&test.app, &cookie).await;
        assert_eq!(status["flashes"][0]["message"], GENERIC_LOGIN_FAILURE);
    }

    #[tokio::test]
    async fn test_callback_from_another_browser_is_rejected() {
        let mut test = test_app(RegistrationPolicy::Open).await;
        let (token, _) = mock_provider(&mut test.server, 3600, kari_claims()).await;
        let token = token.expect(0);

        let (_, state) = start_flow(&test.app, "/vipps/login", None, None).await;
        let response = send(
            &test.app,
            "GET",
            &format!("/vipps/login/callback?code=abc&state={state}"),
            None,
            None,
        )
        .await;

        assert_eq!(location(&response), "/");
        let cookie = session_cookie(&response).unwrap();
        let status = status_json(&test.app, &cookie).await;
        assert_eq!(status["flashes"][0]["message"], GENERIC_LOGIN_FAILURE);
        assert!(status["user"].is_null());
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_tampered_state_is_rejected() {
        let test = test_app(RegistrationPolicy::Open).await;
        let (mut cookie, state) = start_flow(&test.app, "/vipps/login", None, None).await;

        let tampered = format!("x{}", state);
        let response = send(
            &test.app,
            "GET",
            &format!("/vipps/login/callback?code=abc&state={tampered}"),
            Some(&cookie),
            None,
        )
        .await;
        assert_eq!(location(&response), "/");
        refresh(&mut cookie, &response);

        let status = status_json(&test.app, &cookie).await;
        assert_eq!(status["flashes"][0]["message"], GENERIC_LOGIN_FAILURE);
    }

    #[tokio::test]
    async fn test_token_rejection_shows_provider_body() {
        let mut test = test_app(RegistrationPolicy::Open).await;
        let _token = test
            .server
            .mock("POST", "/token")
            .with_status(400)
            .with_body("invalid_grant")
            .create_async()
            .await;

        let cookie = log_in(&test, None).await;
        let status = status_json(&test.app, &cookie).await;

        assert_eq!(status["flashes"][0]["message"], "Login Failed: invalid_grant");
        assert!(status["vipps"].is_null());
    }

    #[tokio::test]
    async fn test_registration_closed_flashes_warning() {
        let mut test = test_app(RegistrationPolicy::Closed).await;
        let _provider = mock_provider(&mut test.server, 3600, kari_claims()).await;

        let cookie = log_in(&test, None).await;
        let status = status_json(&test.app, &cookie).await;

        assert_eq!(status["flashes"][0]["level"], "warning");
        assert!(status["flashes"][0]["message"]
            .as_str()
            .unwrap()
            .starts_with("You are not registered"));
        assert!(status["user"].is_null());
        assert!(status["vipps"].is_null());
        assert!(test.store.linked_user_id("sub-1").await.is_none());
    }

    #[tokio::test]
    async fn test_unverified_email_is_refused() {
        let mut test = test_app(RegistrationPolicy::Open).await;
        let mut claims = kari_claims();
        claims["email_verified"] = json!(false);
        let _provider = mock_provider(&mut test.server, 3600, claims).await;

        let cookie = log_in(&test, None).await;
        let status = status_json(&test.app, &cookie).await;

        assert_eq!(
            status["flashes"][0]["message"],
            "You need to have a vipps-verified email to use this feature."
        );
        assert!(status["user"].is_null());
        assert!(status["vipps"].is_null());
    }

    #[tokio::test]
    async fn test_already_logged_in_user_gets_warning() {
        let mut test = test_app(RegistrationPolicy::Open).await;
        let (token, _) = mock_provider(&mut test.server, 3600, kari_claims()).await;

        let cookie = log_in(&test, None).await;
        let (mut cookie, state) = start_flow(&test.app, "/vipps/login", None, Some(&cookie)).await;
        let response = send(
            &test.app,
            "GET",
            &format!("/vipps/login/callback?code=abc&state={state}"),
            Some(&cookie),
            None,
        )
        .await;
        assert_eq!(location(&response), "/");
        refresh(&mut cookie, &response);

        let status = status_json(&test.app, &cookie).await;
        assert_eq!(
            status["flashes"][0]["message"],
            "You're already logged in as Kari."
        );
        token.expect(1).assert_async().await;
    }

    #[tokio::test]
    async fn test_matching_email_requires_password() {
        let mut test = test_app(RegistrationPolicy::Open).await;
        let _provider = mock_provider(&mut test.server, 3600, kari_claims()).await;
        let existing = test.store.add_user("kari@example.no", PASSWORD).await;

        let (mut cookie, state) =
            start_flow(&test.app, "/vipps/login", Some("/orders"), None).await;
        let response = send(
            &test.app,
            "GET",
            &format!("/vipps/login/callback?code=abc&state={state}"),
            Some(&cookie),
            None,
        )
        .await;
        assert_eq!(location(&response), VERIFY_PATH);
        refresh(&mut cookie, &response);
        assert!(status_json(&test.app, &cookie).await["user"].is_null());

        let response = send(&test.app, "GET", VERIFY_PATH, Some(&cookie), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("kari@example.no"));

        let response = send(&test.app, "POST", VERIFY_PATH, Some(&cookie), Some("password=wrong")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("Invalid password"));
        assert!(test.store.linked_user_id("sub-1").await.is_none());

        let response = send(
            &test.app,
            "POST",
            VERIFY_PATH,
            Some(&cookie),
            Some(&format!("password={PASSWORD}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/orders");
        refresh(&mut cookie, &response);

        let status = status_json(&test.app, &cookie).await;
        assert_eq!(status["user"]["id"], existing.id.to_string());
        assert_eq!(test.store.linked_user_id("sub-1").await, Some(existing.id));
    }

    #[tokio::test]
    async fn test_verify_without_vipps_session_redirects_home() {
        let test = test_app(RegistrationPolicy::Open).await;

        let response = send(&test.app, "GET", VERIFY_PATH, None, None).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/");

        let cookie = session_cookie(&response).unwrap();
        let status = status_json(&test.app, &cookie).await;
        assert_eq!(status["flashes"][0]["message"], SESSION_EXPIRED);
    }

    #[tokio::test]
    async fn test_verify_uses_configured_template() {
        let path = std::env::temp_dir().join(format!("vipps-verify-{}.html", uuid::Uuid::new_v4()));
        std::fs::write(&path, "<p>Custom for {{email}}</p><em>{{error}}</em>").unwrap();

        let mut test = test_app_with(
            RegistrationPolicy::Open,
            Some(path.to_string_lossy().to_string()),
        )
        .await;
        let _provider = mock_provider(&mut test.server, 3600, kari_claims()).await;
        test.store.add_user("kari@example.no", PASSWORD).await;

        let cookie = log_in(&test, None).await;
        let response = send(&test.app, "POST", VERIFY_PATH, Some(&cookie), Some("password=wrong")).await;

        assert_eq!(
            body_text(response).await,
            "<p>Custom for kari@example.no</p><em>Invalid password</em>"
        );
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_continue_sets_only_vipps_session() {
        let mut test = test_app(RegistrationPolicy::Open).await;
        let _provider = mock_provider(&mut test.server, 3600, kari_claims()).await;

        let (mut cookie, state) =
            start_flow(&test.app, "/vipps/continue", Some("/kasse"), None).await;
        let response = send(
            &test.app,
            "GET",
            &format!("/vipps/continue/callback?code=abc&state={state}"),
            Some(&cookie),
            None,
        )
        .await;
        assert_eq!(location(&response), "/kasse");
        refresh(&mut cookie, &response);

        let status = status_json(&test.app, &cookie).await;
        assert!(status["user"].is_null());
        assert_eq!(status["vipps"]["email"], "kari@example.no");
        assert_eq!(status["vipps"]["name"], "Kari Nordmann");
        assert_eq!(status["flashes"][0]["message"], LOGGED_IN);
        assert!(test.store.find_by_email("kari@example.no").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_vipps_session_is_removed_on_read() {
        let mut test = test_app(RegistrationPolicy::Open).await;
        let _provider = mock_provider(&mut test.server, 0, kari_claims()).await;

        let (mut cookie, state) = start_flow(&test.app, "/vipps/continue", None, None).await;
        let response = send(
            &test.app,
            "GET",
            &format!("/vipps/continue/callback?code=abc&state={state}"),
            Some(&cookie),
            None,
        )
        .await;
        refresh(&mut cookie, &response);

        let status = status_json(&test.app, &cookie).await;
        assert!(status["vipps"].is_null());
    }

    #[tokio::test]
    async fn test_forget_keeps_local_login() {
        let mut test = test_app(RegistrationPolicy::Open).await;
        let _provider = mock_provider(&mut test.server, 3600, kari_claims()).await;

        let mut cookie = log_in(&test, None).await;
        let response = send(&test.app, "GET", "/vipps/forget", Some(&cookie), None).await;
        assert_eq!(location(&response), "/");
        refresh(&mut cookie, &response);

        let status = status_json(&test.app, &cookie).await;
        assert!(status["vipps"].is_null());
        assert_eq!(status["user"]["email"], "kari@example.no");
    }

    #[tokio::test]
    async fn test_logout_clears_both_sessions() {
        let mut test = test_app(RegistrationPolicy::Open).await;
        let _provider = mock_provider(&mut test.server, 3600, kari_claims()).await;

        let mut cookie = log_in(&test, None).await;
        let response = send(
            &test.app,
            "GET",
            &format!("/vipps/logout?r={}", encode_return_param("/bye")),
            Some(&cookie),
            None,
        )
        .await;
        assert_eq!(location(&response), "/bye");
        refresh(&mut cookie, &response);

        let status = status_json(&test.app, &cookie).await;
        assert!(status["user"].is_null());
        assert!(status["vipps"].is_null());
    }

    #[tokio::test]
    async fn test_logout_ignores_foreign_return_url() {
        let test = test_app(RegistrationPolicy::Open).await;
        let response = send(
            &test.app,
            "GET",
            &format!("/vipps/logout?r={}", encode_return_param("https://evil.example/")),
            None,
            None,
        )
        .await;

        assert_eq!(location(&response), "/");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<a href=\"x\">Tom & 'Jerry'</a>"),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; &#39;Jerry&#39;&lt;/a&gt;"
        );
    }
}
