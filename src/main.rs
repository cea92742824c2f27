use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use forest_server::api::{self, AppState};
use forest_server::build::BuildOrchestrator;
use forest_server::config::ServerConfig;
use forest_server::db;
use forest_server::notify::NotificationBus;
use forest_server::persistence::Persistence;

#[derive(Parser)]
#[command(name = "forest-server")]
#[command(about = "Collaborative forest editing with live build previews")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve(ServerConfig),
    /// Flush dirty trees and run one build, then exit
    ///
    /// Safe to run next to a server on the same forest: the two take turns
    /// through a lock file in the forest directory.
    Build(ServerConfig),
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "forest_server=debug,tower_http=debug".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn open_database(config: &ServerConfig) -> anyhow::Result<db::Database> {
    let db = db::Database::open(config.database_path())?;
    db.migrate()?;
    Ok(db)
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    tracing::info!(forest = %config.forest_dir.display(), "Starting forest server");

    let db = open_database(&config)?;
    std::fs::create_dir_all(config.content_root())?;
    std::fs::create_dir_all(config.built_root())?;

    let cancel = CancellationToken::new();
    let state = AppState::start(db, &config, cancel.clone());
    let builds = state.builds.clone();
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    tracing::info!("Forest server listening on http://{}", config.bind_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        })
        .await?;

    builds.shutdown().await;
    Ok(())
}

async fn build(config: ServerConfig) -> anyhow::Result<()> {
    let db = open_database(&config)?;
    let persistence = Persistence::new(db, config.content_root());
    let orchestrator = BuildOrchestrator::new(
        persistence,
        NotificationBus::default(),
        config.build_command(),
        config.built_root(),
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let Some(result) = orchestrator.build_once(&cancel).await else {
        anyhow::bail!("Build cancelled");
    };
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);

    if !result.success {
        anyhow::bail!("Build failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Some(Commands::Serve(config)) => serve(config).await,
        Some(Commands::Build(config)) => build(config).await,
        None => serve(ServerConfig::from_env()).await,
    }
}
