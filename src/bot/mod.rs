pub mod admin;
pub mod chat;
pub mod commands;
pub mod events;
pub mod gate;
pub mod moderation;
pub mod system;
pub mod util;

use std::net::SocketAddr;
use std::sync::Arc;

use teloxide::dispatching::{UpdateFilterExt, UpdateHandler};
use teloxide::prelude::*;
use teloxide::update_listeners::webhooks;
use tokio::sync::{Mutex, RwLock};

use crate::config::{Config, RunMode};
use crate::pid::PidManager;
use crate::rate_limiter::RateLimiter;
use crate::registry::CommandRegistry;
use crate::restart::Restarter;
use crate::store::{now_ts, BotFeatures, BotProfile, BotSettings, JsonStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<JsonStore>,
    pub pids: Arc<PidManager>,
    pub restarter: Arc<Restarter>,
    pub registry: Arc<RwLock<CommandRegistry>>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
    pub bot_username: Arc<String>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        store: Arc<JsonStore>,
        pids: Arc<PidManager>,
        restarter: Arc<Restarter>,
        registry: CommandRegistry,
        bot_username: String,
    ) -> Self {
        let limiter = RateLimiter::new(
            config.rate_limit.max_requests,
            std::time::Duration::from_secs(config.rate_limit.window_secs),
        );
        Self {
            config,
            store,
            pids,
            restarter,
            registry: Arc::new(RwLock::new(registry)),
            rate_limiter: Arc::new(Mutex::new(limiter)),
            bot_username: Arc::new(bot_username),
        }
    }

    /// Owner from config, or listed in any roster.
    pub async fn is_admin(&self, user_id: i64) -> bool {
        self.config.is_owner(user_id) || self.store.is_admin(user_id, None).await
    }

    /// Rewrites `bots/<username>.json` from the live registry, keeping the
    /// original creation time.
    pub async fn sync_bot_profile(&self) -> bool {
        let created_at = self
            .store
            .load_bot_profile(&self.bot_username)
            .await
            .map(|p| p.created_at)
            .unwrap_or_else(now_ts);

        let profile = BotProfile {
            bot_username: self.bot_username.to_string(),
            bot_name: self.config.bot_name.clone(),
            owner_id: self.config.owner_id,
            created_at,
            commands: self.registry.read().await.snapshot(),
            settings: BotSettings {
                language: "en".to_string(),
                maintenance_mode: self.config.maintenance_mode,
                auto_backup: true,
            },
            features: BotFeatures {
                hot_reload: true,
                user_tracking: true,
                broadcast_system: true,
                admin_management: true,
            },
        };
        self.store.save_bot_profile(&profile).await
    }

    /// Pushes the public command menu to Telegram.
    pub async fn publish_commands(&self, bot: &Bot) {
        let commands = self.registry.read().await.telegram_commands();
        if let Err(e) = bot.set_my_commands(commands).await {
            tracing::warn!("Failed to set bot commands: {e}");
        }
    }
}

fn is_slash_text(msg: Message) -> bool {
    msg.text().is_some_and(|t| t.starts_with('/'))
}

pub fn schema() -> UpdateHandler<anyhow::Error> {
    let messages = Update::filter_message()
        .branch(
            dptree::filter(|msg: Message| msg.new_chat_members().is_some())
                .endpoint(events::handle_new_members),
        )
        .branch(
            dptree::filter_async(gate::admit)
                .branch(
                    dptree::entry()
                        .filter_command::<commands::Command>()
                        .endpoint(commands::handle_command),
                )
                .branch(dptree::filter(is_slash_text).endpoint(events::handle_unknown_command)),
        );

    dptree::entry()
        .branch(messages)
        .branch(Update::filter_chat_member().endpoint(events::handle_chat_member))
}

pub async fn build_and_run(bot: Bot, state: AppState) -> anyhow::Result<()> {
    let mut dispatcher = Dispatcher::builder(bot.clone(), schema())
        .dependencies(dptree::deps![state.clone()])
        .error_handler(LoggingErrorHandler::with_custom_text(
            "An error has occurred in the dispatcher",
        ))
        .enable_ctrlc_handler()
        .build();

    match state.config.mode {
        RunMode::Polling => {
            tracing::info!("Starting long polling");
            dispatcher.dispatch().await;
        }
        RunMode::Webhook => {
            let url = state
                .config
                .webhook_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("WEBHOOK_URL is required in webhook mode"))?;
            let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port).parse()?;
            tracing::info!(%addr, %url, "Starting webhook listener");

            let listener = webhooks::axum(bot, webhooks::Options::new(addr, url)).await?;
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("An error from the update listener"),
                )
                .await;
        }
    }
    Ok(())
}
