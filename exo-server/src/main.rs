use std::sync::Arc;

use clap::Parser;
use exo_core::{ExoConfig, ModelBundle};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use exo_server::http;
use exo_server::state::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "exo.toml")]
    config: String,

    /// Check the database and model artifacts, then exit.
    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match ExoConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    let default_level = config
        .service
        .log_level
        .parse()
        .unwrap_or(tracing::Level::INFO);
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .init();

    let pool = match exo_core::db::create_pool(&config.database) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Invalid database configuration: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        let mut healthy = true;
        match exo_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                healthy = false;
            }
        }
        match ModelBundle::load(&config.model) {
            Ok(bundle) => println!("✅ Model loaded: {} features", bundle.feature_names.len()),
            Err(e) => {
                println!("❌ Model artifacts unavailable: {}", e);
                healthy = false;
            }
        }
        if !healthy {
            std::process::exit(1);
        }
        return Ok(());
    }

    let state = Arc::new(AppState::from_config(config, pool));

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    http::start_http_server(state, tx.subscribe()).await
}
