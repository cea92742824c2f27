mod handlers;
mod preview;

use std::path::PathBuf;

use axum::{
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::build::{BuildHandle, BuildOrchestrator};
use crate::config::ServerConfig;
use crate::db::Database;
use crate::notify::NotificationBus;
use crate::persistence::Persistence;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub persistence: Persistence,
    pub bus: NotificationBus,
    pub builds: BuildHandle,
    pub built_root: PathBuf,
}

impl AppState {
    /// Wire the subsystem together and start the build worker.
    ///
    /// The worker stops when `cancel` fires.
    pub fn start(db: Database, config: &ServerConfig, cancel: CancellationToken) -> Self {
        let persistence = Persistence::new(db.clone(), config.content_root());
        let bus = NotificationBus::new(config.bus_capacity);
        let builds = BuildOrchestrator::new(
            persistence.clone(),
            bus.clone(),
            config.build_command(),
            config.built_root(),
        )
        .spawn(cancel);

        Self {
            db,
            persistence,
            bus,
            builds,
            built_root: config.built_root(),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // Builds
        .route("/build", post(handlers::trigger_build))
        .route("/build", get(handlers::build_status))
        // Trees (collaboration engine load/store hooks)
        .route("/trees", get(handlers::list_trees))
        .route("/trees/{tree}", get(handlers::load_tree))
        .route("/trees/{tree}", post(handlers::store_tree))
        // Health
        .route("/health", get(handlers::health));

    let built = ServeDir::new(&state.built_root);

    Router::new()
        .nest("/api", api)
        .route("/preview/{tree}", get(preview::preview_socket))
        .nest_service("/built", built)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
