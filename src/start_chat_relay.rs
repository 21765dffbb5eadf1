//! Startup helpers for the chat relay server.

use std::process::ExitCode;

use crate::config::ChatRelayConfig;
use crate::server::{self, AppState};

/// Run the server until Ctrl+C (used by the `chat-relay-server` binary).
///
/// # Returns
/// `ExitCode::SUCCESS` on graceful shutdown, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting chat relay v{}", env!("CARGO_PKG_VERSION"));

    let config = match ChatRelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };
    tracing::info!("Provider endpoint: {}", config.provider.base_url);
    tracing::info!("SQLite database: {}", config.storage.sqlite_path.display());

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = rt.block_on(serve_until_ctrl_c(config)) {
        tracing::error!("Server error: {e}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

async fn serve_until_ctrl_c(
    config: ChatRelayConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let port = config.server.port;
    let state = AppState::new(config).await?;
    server::run_server_with_shutdown(state, port, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown requested");
    })
    .await
}
