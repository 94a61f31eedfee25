#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod config;
mod db;
mod discord;
#[cfg(test)]
mod testing;
mod tracker;
mod utils;
mod web;

use cli::Cli;
use config::Config;
use tracker::{AlertTracker, TrackerSettings};
use web::WebServer;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    utils::logging::init_tracing(&config.logging.level, &config.logging.format);
    info!("guild defense bot starting up");

    let db_manager = db::DatabaseManager::new(&config.database).await?;
    db_manager.migrate().await?;

    let discord_client = Arc::new(discord::DiscordClient::new(&config));
    let tracker = Arc::new(AlertTracker::new(
        db_manager.alert_store(),
        discord_client.clone(),
        TrackerSettings::from_config(&config),
    ));
    discord_client.set_tracker(tracker.clone()).await;
    tracker.start_background_tasks();

    let web_server = WebServer::new(&config.web);
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start().await {
            error!("web server error: {}", e);
        }
    });

    let gateway = discord_client.clone();
    let discord_handle = tokio::spawn(async move {
        if let Err(e) = gateway.start().await {
            error!("discord client error: {}", e);
        }
    });

    tokio::select! {
        _ = web_handle => {},
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("failed to listen for shutdown signal: {}", e);
            }
        }
    }

    discord_handle.abort();
    discord_client.stop().await?;
    info!("guild defense bot shutting down");
    Ok(())
}
