use crate::{controller::health_check_controller, AppState};
use axum::{routing::get, Router};

use crate::controller::vipps_controller;

pub fn define_routes(app_state: AppState) -> Router {
    Router::new()
        .merge(health_routes())
        .merge(vipps_login_routes(app_state.clone()))
        .merge(vipps_continue_routes(app_state.clone()))
        .merge(vipps_session_routes(app_state))
}

fn health_routes() -> Router {
    Router::new().route("/health", get(health_check_controller::health_check))
}

fn vipps_login_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/vipps/login", get(vipps_controller::login))
        .route("/vipps/login/callback", get(vipps_controller::login_callback))
        .route(
            vipps_controller::VERIFY_PATH,
            get(vipps_controller::verify).post(vipps_controller::confirm),
        )
        .with_state(app_state)
}

fn vipps_continue_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/vipps/continue", get(vipps_controller::continue_with_vipps))
        .route(
            "/vipps/continue/callback",
            get(vipps_controller::continue_callback),
        )
        .with_state(app_state)
}

fn vipps_session_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/vipps/forget", get(vipps_controller::forget))
        .route("/vipps/logout", get(vipps_controller::logout))
        .route("/vipps/status", get(vipps_controller::status))
        .with_state(app_state)
}
