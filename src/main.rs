//! Terra Quiz Server
//!
//! Authoritative coordination server for multiplayer quiz sessions.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use terra_quiz::network::AuthConfig;
use terra_quiz::presence::NullNotifier;
use terra_quiz::{MemoryStore, QuizServer, ReconcileConfig, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(Level::INFO.to_string())),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let config = ServerConfig::from_env();
    let auth = AuthConfig::from_env();
    let reconcile = ReconcileConfig::from_env();

    info!("Terra Quiz Server v{}", VERSION);
    info!("bind address: {}", config.bind_addr);
    if !auth.is_configured() {
        info!("no auth provider configured; all authentication will be rejected");
    }

    let server = QuizServer::new(
        config,
        auth,
        reconcile,
        Arc::new(MemoryStore::new()),
        Arc::new(NullNotifier),
    );

    server.run().await.context("server exited with error")
}
