use anyhow::{Context, Result};
use moodscan_core::OnnxEmotionAnalyzer;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod error;
mod server;
mod upload;

use config::Config;
use server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        detector = %config.detector,
        filename_policy = ?config.filename_policy,
        "moodscand starting"
    );

    // Models load before the listener binds.
    let analyzer =
        OnnxEmotionAnalyzer::load(&config.model_dir, config.detector, config.intra_threads)
            .context("failed to load emotion analysis models")?;
    let engine = engine::spawn_engine(Box::new(analyzer))?;

    let running = Server::bind(&config, engine).await?.start()?;
    tracing::info!(address = %running.local_addr(), "moodscand ready");

    shutdown_signal().await?;
    tracing::info!("moodscand shutting down");
    running.stop().await
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
