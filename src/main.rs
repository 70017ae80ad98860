use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use snowball_engine::config::{load_config, Config};
use snowball_engine::database::create_db_pool;
use snowball_engine::models::Result;
use snowball_engine::server::build_rocket;
use snowball_engine::worker::spawn_candidate_sweeper;

use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Load configuration
    let config = match load_config("config.yml").await {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config.yml: {}. Using defaults.", e);
            Config::default()
        }
    };

    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(
                format!("snowball_engine={}", config.logging.level)
                    .parse()
                    .unwrap_or_else(|_| "snowball_engine=info".parse().unwrap()),
            ),
        )
        .init();

    // Initialize database
    info!("Initializing database...");
    let db_pool = create_db_pool(&config.server.database_path).await?;

    // Background sweep for expired forward candidates
    let sweeper = spawn_candidate_sweeper(
        db_pool.clone(),
        config.retention.candidate_retention_hours,
        config.retention.sweep_interval_seconds,
    );

    let rocket = build_rocket(config, db_pool);

    // Add graceful shutdown
    tokio::select! {
        result = rocket.launch() => {
            result?;
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    sweeper.abort();
    Ok(())
}
