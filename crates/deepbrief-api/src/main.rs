use anyhow::Result;
use axum::Router;
use deepbrief_api::config::AppConfig;
use deepbrief_api::routes::build_router;
use deepbrief_api::state::AppState;
use deepbrief_api::telemetry::init_tracing;
use deepbrief_core::ConfigLoader;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let app_config = AppConfig::from_env()?;
    let research_config = ConfigLoader::load(None)?;
    let state = AppState::try_new(&app_config, research_config)?;

    let app: Router = build_router(state);

    let listener = TcpListener::bind(&app_config.listen_addr).await?;
    info!(address = %app_config.listen_addr, "deepbrief-api listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| {
            error!(error = %err, "server shutdown with error");
            err
        })?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            stream.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
