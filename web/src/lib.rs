use std::sync::Arc;

use axum::Router;
use axum_login::tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer};
use axum_login::AuthManagerLayerBuilder;
use log::*;
use service::config::Config;
use time::Duration;
use tokio::net::TcpListener;
use vipps_auth::{AccountLinker, FlowEngine, Settings};

use crate::auth::Backend;

pub mod auth;
mod controller;
mod error;
pub mod flash;
mod router;
pub mod user_store;

pub use error::{Error, Result};

#[derive(Clone)]
pub struct AppState {
    pub engine: FlowEngine,
    pub linker: AccountLinker,
}

impl AppState {
    pub fn new(engine: FlowEngine, linker: AccountLinker) -> Self {
        Self { engine, linker }
    }

    pub fn settings(&self) -> &Settings {
        self.engine.settings()
    }
}

/// The routes wrapped in the session and login layers.
///
/// Cookies use `SameSite=Lax`: the callback is a cross-site redirect from Vipps and
/// must carry the session that started the flow.
pub fn app(app_state: AppState, session_expiry: Duration, secure_cookies: bool) -> Router {
    let backend = Backend::new(Arc::clone(app_state.linker.store()));
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(secure_cookies)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(session_expiry));
    let auth_layer = AuthManagerLayerBuilder::new(backend, session_layer).build();

    router::define_routes(app_state).layer(auth_layer)
}

pub async fn init_server(app_state: AppState, config: &Config) -> std::io::Result<()> {
    let session_expiry =
        Duration::seconds(i64::try_from(config.backend_session_expiry_seconds).unwrap_or(i64::MAX));
    let app = app(app_state, session_expiry, config.is_production());

    let host = config.interface.as_deref().unwrap_or("127.0.0.1");
    let address = format!("{}:{}", host, config.port);
    info!("Server starting... listening for connections on http://{address}");

    let listener = TcpListener::bind(&address).await?;
    axum::serve(listener, app).await
}
