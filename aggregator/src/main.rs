mod api;
mod config;
mod db;
mod errors;
mod models;
mod state;

use crate::config::Settings;
use crate::errors::ApiError;
use crate::state::AppState;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;

    // Local state (sqlite + cached keys) lives under DATA_DIR.
    std::fs::create_dir_all(&settings.data_dir).map_err(|_| ApiError::Internal)?;

    let db_path = settings.data_dir.join("aggregator.sqlite");
    let db_url = format!("sqlite:{}", db_path.to_string_lossy());

    let db = db::connect(&db_url).await?;
    db::init_schema(&db).await?;

    let addr = settings.addr.clone();
    let state = AppState::new(db, settings).await?;

    // Warm the stage keys so the first submission does not pay for setup.
    let warm = state.clone();
    tokio::spawn(async move {
        if let Err(err) = warm.ensure_keys().await {
            tracing::error!(error = %err, "stage key setup failed");
        }
    });

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|_| ApiError::Internal)?;

    tracing::info!(%addr, "aggregator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .map_err(|_| ApiError::Internal)?;

    Ok(())
}
