use async_trait::async_trait;
use events::{EventHandler, EventPublisher, LoginEvent};
use log::{error, info};
use service::{config::Config, logging::Logger};
use std::sync::Arc;
use std::time::Duration;
use vipps_auth::cache::MemoryStore;
use vipps_auth::linkage::RegistrationPolicy;
use vipps_auth::{AccountLinker, FlowEngine};
use web::user_store::MemoryUserStore;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

struct LogEvents;

#[async_trait]
impl EventHandler for LogEvents {
    async fn handle(&self, event: &LoginEvent) {
        info!("Vipps login event {}: {:?}", event.name(), event);
    }
}

#[tokio::main]
async fn main() {
    let config = Config::new();
    if let Err(e) = Logger::init_logger(&config) {
        eprintln!("Failed to initialize logger: {e}");
        std::process::exit(1);
    }

    info!("Starting up Vipps login [{}]...", config.runtime_env());

    let settings = match service::init_vipps_settings(&config) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            error!("Invalid Vipps login configuration: {e}");
            std::process::exit(1);
        }
    };

    let http_client = match service::init_http_client(&config) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build HTTP client: {e}");
            std::process::exit(1);
        }
    };

    // PKCE verifiers of abandoned attempts are never read again.
    let secrets = MemoryStore::new();
    let purge_secrets = secrets.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            purge_secrets.purge_expired();
        }
    });

    let engine = FlowEngine::new(settings, http_client, Arc::new(secrets));
    let publisher = EventPublisher::new().with_handler(Arc::new(LogEvents));
    let linker = AccountLinker::new(
        Arc::new(MemoryUserStore::new()),
        publisher,
        RegistrationPolicy::from(config.allow_public_registration),
    );

    let app_state = web::AppState::new(engine, linker);
    if let Err(e) = web::init_server(app_state, &config).await {
        error!("Server failed: {e}");
        std::process::exit(1);
    }
}
