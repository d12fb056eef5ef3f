use anyhow::Result;
use tracing::{info, error};
use std::sync::Arc;
use tokio::signal;

use agentwatch::config::Config;
use agentwatch::daemon::Daemon;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first; logging setup needs the log directory.
    let config = Config::load()?;
    init_logging(&config)?;

    info!("Starting agentwatch v{}", env!("CARGO_PKG_VERSION"));

    let daemon = Arc::new(Daemon::new(config).await?);
    let daemon_clone = daemon.clone();

    // Handle shutdown signals
    let shutdown_handle = tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                daemon_clone.shutdown().await;
            }
            Err(err) => {
                error!("Failed to listen for shutdown signal: {}", err);
            }
        }
    });

    let daemon_handle = {
        let daemon = daemon.clone();
        tokio::spawn(async move {
            if let Err(e) = daemon.run().await {
                error!("Daemon error: {}", e);
            }
        })
    };

    tokio::select! {
        _ = daemon_handle => {
            info!("Daemon completed");
        }
        _ = shutdown_handle => {
            info!("Shutdown initiated");
        }
    }

    info!("agentwatch shutting down");
    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    std::fs::create_dir_all(&config.logging.directory)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("agentwatch")
        .filename_suffix("log")
        .build(&config.logging.directory)
        .expect("Failed to create file appender");

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .json();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(file_layer)
        .with(console_layer)
        .init();

    Ok(())
}
