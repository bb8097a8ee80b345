//! # Conduit Node
//!
//! Intent intake, routing, dispatch and report aggregation behind one API
//! server. Optionally hosts a handler of its own.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use clap::Parser;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod aggregator;
mod api;
mod config;
mod registry;
mod sinks;
mod state;
#[cfg(test)]
mod testing;

use config::NodeConfig;
use state::AppState;

/// Conduit node.
#[derive(Debug, Parser)]
#[command(name = "conduit-node", version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, env = "CONDUIT_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration.
    #[arg(short, long, env = "CONDUIT_LISTEN")]
    listen: Option<SocketAddr>,

    /// Log filter, overriding the configuration. `RUST_LOG` wins over both.
    #[arg(long)]
    log_level: Option<String>,
}

/// Run the Conduit node server.
pub async fn run_server(config: NodeConfig) -> anyhow::Result<()> {
    info!("🚀 Conduit Node starting...");

    let state = AppState::from_config(&config).await?;
    if state.handler.is_some() {
        info!("🧩 Hosting handler for target {}", config.handler.target);
    }

    let app = create_router(state);

    info!("🌐 Listening on http://{}", config.listen);

    let listener = TcpListener::bind(config.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Conduit Node stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Create the API router.
fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(api::health::health_check))

        // Intent API
        .route("/api/v1/intent", post(api::intent::submit_intent))
        .route(
            "/api/v1/intent/:id",
            get(api::intent::get_intent).delete(api::intent::withdraw_intent),
        )
        .route("/api/v1/intents", get(api::intent::list_intents))

        // Reports
        .route("/api/v1/reports", post(api::report::submit_report))

        // Twin store
        .route("/api/v1/endpoints/:target", put(api::endpoints::register_endpoint))
        .route("/api/v1/twin/:id", get(api::endpoints::twin_records))

        // Hosted handler
        .route("/api/v1/subintents", post(api::handler::accept_sub_intent))
        .route("/api/v1/subintents/:id", delete(api::handler::withdraw_sub_intent))

        // WebSocket endpoints
        .route("/ws/intent/:id", get(api::ws::intent_stream))

        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = NodeConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    run_server(config).await
}
