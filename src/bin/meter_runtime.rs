//! Meter Runtime - headless detection session
//!
//! This binary wires the meter pipeline end to end:
//! - Initializes SQLite database with schema
//! - Connects the detection and rating gateways
//! - Starts a detection session and drives it with the playback ticker
//! - Stops cleanly on CTRL+C
//!
//! Usage:
//!   cargo run --release --bin meter_runtime
//!
//! Environment variables:
//!   METERFLOW_DB_PATH - SQLite database path (default: meterflow.db)
//!   ENABLE_PIPELINE - Master switch (default: false)
//!   DETECTION_URL / RATING_URL - Gateway endpoints
//!   TRIGGER_INTERVAL_MS - Ticker interval (default: 1000)

use dotenv::dotenv;
use log::{error, info, warn};
use meterflow::pipeline::{
    config::PipelineConfig,
    db::{apply_embedded_schema, run_schema_migrations, SqliteStore},
    detection::HttpDetectionGateway,
    engine::{MeterPipeline, PipelineOptions},
    rating::HttpRatingGateway,
    ticker::playback_ticker_task,
    DetectionGateway, RatingGateway,
};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

type RuntimeResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[tokio::main]
async fn main() -> RuntimeResult<()> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Meter Runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = PipelineConfig::from_env();

    if !config.enabled {
        info!("⚠️  Pipeline is DISABLED (set ENABLE_PIPELINE=true to activate)");
        info!("   └─ Exiting gracefully...");
        return Ok(());
    }

    config.validate()?;

    info!("✅ Pipeline ENABLED");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Source: {}", config.source_ref);
    info!("   ├─ Trigger interval: {}ms", config.trigger_interval_ms);
    info!("   ├─ Min trigger spacing: {}s", config.min_trigger_spacing);
    info!("   └─ Duplicate tolerance: {} over last {} readings", config.duplicate_tolerance, config.history_limit);

    // Initialize database
    info!("🔧 Initializing database...");
    let mut conn = Connection::open(&config.db_path)?;

    // Run schema migrations (idempotent)
    if Path::new(&config.schema_dir).exists() {
        run_schema_migrations(&mut conn, &config.schema_dir)?;
    } else {
        warn!("⚠️  Schema directory {} not found, using embedded schema", config.schema_dir);
        apply_embedded_schema(&conn)?;
    }
    drop(conn); // Close temporary connection

    let store = Arc::new(SqliteStore::open(&config.db_path, &config.user_id)?);
    info!("✅ Database initialized (user: {})", store.user_id());

    // Gateways
    let timeout = Duration::from_secs(config.gateway_timeout_secs);
    let detector: Arc<dyn DetectionGateway> = Arc::new(HttpDetectionGateway::new(
        &config.detection_url,
        config.detection_api_key.clone(),
        timeout,
    )?);
    let rating: Arc<dyn RatingGateway> = Arc::new(HttpRatingGateway::new(&config.rating_url, timeout)?);

    let pipeline = Arc::new(MeterPipeline::new(
        detector,
        rating,
        store,
        PipelineOptions::from(&config),
    ));
    info!("✅ MeterPipeline created");

    match pipeline.daily_limit().await {
        Ok(Some(limit)) => info!("💰 Daily cost limit: ₹{}", limit),
        Ok(None) => info!("💰 No daily cost limit set"),
        Err(e) => warn!("⚠️  Could not read daily cost limit: {}", e),
    }

    pipeline.start().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ticker_pipeline = pipeline.clone();
    let interval_ms = config.trigger_interval_ms;
    let ticker = tokio::spawn(async move {
        playback_ticker_task(ticker_pipeline, interval_ms, shutdown_rx).await
    });
    info!("   └─ ✅ Playback ticker spawned");

    info!("");
    info!("🔄 Press CTRL+C to shutdown gracefully");

    // Wait for CTRL+C
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    pipeline.stop();
    let _ = shutdown_tx.send(true);

    match ticker.await {
        Ok(ticks) => info!("   └─ Ticker fired {} triggers", ticks),
        Err(e) => error!("❌ Ticker task failed: {}", e),
    }

    let snapshot = pipeline.snapshot();
    info!("📊 Session summary");
    info!("   ├─ Initial reading: {:?}", snapshot.initial_reading);
    info!("   ├─ Last reading: {}", snapshot.reading.as_deref().unwrap_or("-"));
    info!("   └─ Last bill: ₹{:.2}", snapshot.bill_amount);

    info!("✅ Meter runtime stopped");
    Ok(())
}
