//! Certificate issuance service

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use certissue_service::{
    routes, AppState, BotApiChannel, Components, Config, ConsoleChannel, DeliveryChannel,
    HttpPlatformClient, Stores, TextCertificateGenerator,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "certissue_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();
    tracing::info!(
        port = config.port,
        database = ?config.database_path,
        platform = %config.platform.base_url,
        admins = config.admin_ids.len(),
        "Loaded configuration"
    );

    let catalog = config.load_catalog()?;
    let catalog_ref = Arc::new(catalog.clone());

    let stores = match &config.database_path {
        Some(path) => Stores::sqlite(path).with_context(|| format!("opening database {}", path))?,
        None => {
            tracing::warn!("DATABASE_PATH not set, using in-memory stores");
            Stores::in_memory()
        }
    };

    let delivery: Arc<dyn DeliveryChannel> = match config.bot.clone() {
        Some(bot) => Arc::new(BotApiChannel::new(bot).map_err(anyhow::Error::msg)?),
        None => {
            tracing::warn!("BOT_TOKEN not set, delivering to console");
            Arc::new(ConsoleChannel::new())
        }
    };

    let platform = HttpPlatformClient::new(
        &config.platform.base_url,
        Duration::from_secs(config.platform.timeout_secs),
    )?;

    let generator =
        TextCertificateGenerator::new(&config.artifact_dir, catalog_ref, config.watermark);

    let (state, workers) = AppState::build(
        &config,
        catalog,
        Components {
            stores,
            platform: Arc::new(platform),
            generator: Arc::new(generator),
            delivery,
        },
    )?;
    state.queue.recover()?;
    let state = Arc::new(state);

    // Create router
    let app = routes::create_router(state.clone());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Service listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Give in-flight notifications a moment; the rest stay pending
    if tokio::time::timeout(Duration::from_secs(10), state.queue.wait_idle())
        .await
        .is_err()
    {
        tracing::warn!(
            pending = state.queue.outstanding(),
            "Shutting down with pending notifications"
        );
    }
    workers.shutdown();

    Ok(())
}
