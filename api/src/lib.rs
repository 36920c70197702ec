//! HTTP trigger surface for the sync system.
//!
//! Exposes `POST /run` (and `GET /run` for manual triggering) to start a
//! sync run and return its summary, plus a `GET /healthz` liveness probe.
//! Runs are serialized behind an in-process guard: the warehouse merge is
//! not safe under concurrent runs of the same entity.

use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::{App, HttpServer, web};
use config::shared::AppConfig;
use tracing_actix_web::TracingLogger;

pub mod routes;

/// Shared server state.
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Single-active-run guard; `try_lock` failure means a run is active.
    pub run_lock: tokio::sync::Mutex<()>,
}

/// Builds and binds the HTTP server.
pub fn run_server(config: Arc<AppConfig>) -> std::io::Result<Server> {
    let address = (config.api.host.clone(), config.api.port);
    let state = web::Data::new(AppState {
        config,
        run_lock: tokio::sync::Mutex::new(()),
    });

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(state.clone())
            .route("/healthz", web::get().to(routes::health))
            .route("/run", web::post().to(routes::trigger_run))
            .route("/run", web::get().to(routes::trigger_run_query))
    })
    .bind(address)?
    .run();

    Ok(server)
}
