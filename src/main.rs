mod bot;
mod config;
mod error;
mod pid;
mod rate_limiter;
mod registry;
mod restart;
mod roles;
mod store;

use std::sync::Arc;

use anyhow::Result;
use teloxide::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::RunMode;
use crate::pid::PidManager;
use crate::registry::CommandRegistry;
use crate::restart::{LaunchSpec, Restarter, RESTARTED_FROM_ENV};
use crate::store::{now_ts, JsonStore};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!(version = store::BOT_VERSION, "KOMIHUB starting...");

    let config = Arc::new(config::load_config()?);
    tracing::info!(data_dir = %config.data_dir.display(), mode = %config.mode, "Configuration loaded");

    let store = Arc::new(JsonStore::open(&config.data_dir, config.owner_id, &config.bot_name).await?);

    let pids = Arc::new(
        PidManager::new(&config.data_dir, config.process_patterns.clone())
            .with_kill_timeout(config.kill_timeout()),
    );
    match pids.save_bot_pid(None).await {
        Ok(pid) => tracing::info!(pid = pid, "Bot PID saved"),
        Err(e) => tracing::warn!("Failed to save bot PID: {e}"),
    }

    let restarted_from = std::env::var(RESTARTED_FROM_ENV).ok();
    match &restarted_from {
        Some(parent) => {
            tracing::info!(parent_pid = %parent, "Launched by restart, predecessor handles the sweep")
        }
        None => {
            let killed = pids.cleanup_old_instances().await;
            if killed > 0 {
                tracing::info!(killed = killed, "Cleaned up old instances");
            }
        }
    }

    if config.mode == RunMode::Webhook {
        if restarted_from.is_none() && !pids.kill_server().await {
            tracing::warn!("Could not stop the previous webhook server");
        }
        if let Err(e) = pids.save_server_pid(None).await {
            tracing::warn!("Failed to save server PID: {e}");
        }
        // The predecessor keeps the port until its health window has passed.
        let wait = match restarted_from {
            Some(_) => config.health_window() + config.port_wait(),
            None => config.port_wait(),
        };
        if !pids.wait_for_port_free(config.port, wait).await {
            tracing::warn!(port = config.port, "Port still busy, binding anyway");
        }
    }

    let bot = Bot::new(&config.telegram_token);
    let bot_username = match bot.get_me().await {
        Ok(me) => me.username.clone().unwrap_or_else(|| format!("bot_{}", config.owner_id)),
        Err(e) => {
            tracing::warn!("Failed to fetch bot identity: {e}");
            format!("bot_{}", config.owner_id)
        }
    };
    tracing::info!(username = %bot_username, "Bot identity");

    let registry = CommandRegistry::build(&store.disabled_commands().await);
    let restarter = Arc::new(Restarter::new(
        pids.clone(),
        LaunchSpec::current()?,
        config.health_window(),
    ));

    let bot_name = config.bot_name.clone();
    store
        .update_bot_stats(|stats| {
            stats.bot_name = bot_name;
            stats.online_since = now_ts();
        })
        .await;

    let state = bot::AppState::new(
        config.clone(),
        store,
        pids,
        restarter,
        registry,
        bot_username,
    );

    // Register commands with Telegram
    state.publish_commands(&bot).await;
    if !state.sync_bot_profile().await {
        tracing::warn!("Failed to write bot profile");
    }

    tracing::info!("Bot starting...");
    bot::build_and_run(bot, state).await?;

    Ok(())
}
