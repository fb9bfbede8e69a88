//! Ping, statistics, restart and reload.

use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::html;
use tokio::time::{Duration, Instant};

use super::commands::{DENIED_ADMIN, DENIED_OWNER};
use super::util::{reply_html, sender_id};
use super::AppState;
use crate::config::RunMode;
use crate::store::{format_ts, now_ts, BotStats, CommandStats};

const TOP_COMMANDS: usize = 5;

pub async fn handle_ping(bot: Bot, msg: Message) -> anyhow::Result<()> {
    let started = Instant::now();
    let sent = bot.send_message(msg.chat.id, "\u{1f3d3} Pong!").await?;
    let elapsed = started.elapsed().as_millis();
    bot.edit_message_text(
        msg.chat.id,
        sent.id,
        format!("\u{1f3d3} Pong! <code>{elapsed} ms</code>"),
    )
    .parse_mode(ParseMode::Html)
    .await?;
    Ok(())
}

pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m {}s", secs % 60)
    }
}

pub struct StatsView<'a> {
    pub stats: &'a BotStats,
    pub users: usize,
    pub bans: usize,
    pub disabled: &'a [String],
    pub usage: &'a CommandStats,
    pub now: f64,
    pub process: ProcessView,
}

/// What the PID files say about the running instances.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessView {
    pub bot_pid: Option<u32>,
    pub bot_running: bool,
    pub server_pid: Option<u32>,
}

fn format_process(process: &ProcessView) -> String {
    let mut text = String::from("\n<b>Process</b>\n");
    match process.bot_pid {
        Some(pid) => {
            let state = if process.bot_running { "running" } else { "not running" };
            text.push_str(&format!("Bot PID: <code>{pid}</code> ({state})\n"));
        }
        None => text.push_str("Bot PID: not recorded\n"),
    }
    if let Some(pid) = process.server_pid {
        text.push_str(&format!("Server PID: <code>{pid}</code>\n"));
    }
    text
}

pub fn format_stats(view: &StatsView<'_>) -> String {
    let stats = view.stats;
    let uptime = (view.now - stats.online_since).max(0.0) as u64;

    let mut text = format!(
        "\u{1f4ca} <b>{} statistics</b>\n\n\
         Version: {}\n\
         Online since: {}\n\
         Uptime: {}\n\
         Users: {}\n\
         Banned: {}\n\
         Commands handled: {}\n",
        html::escape(&stats.bot_name),
        html::escape(&stats.version),
        format_ts(stats.online_since),
        format_uptime(uptime),
        view.users,
        view.bans,
        stats.total_commands,
    );

    if !view.disabled.is_empty() {
        let list = view
            .disabled
            .iter()
            .map(|c| format!("/{}", html::escape(c)))
            .collect::<Vec<_>>()
            .join(", ");
        text.push_str(&format!("Disabled: {list}\n"));
    }

    let mut top: Vec<_> = view.usage.iter().collect();
    top.sort_by(|a, b| b.1.total_uses.cmp(&a.1.total_uses).then(a.0.cmp(b.0)));
    if !top.is_empty() {
        text.push_str("\n<b>Top commands</b>\n");
        for (name, usage) in top.into_iter().take(TOP_COMMANDS) {
            text.push_str(&format!(
                "  /{} - {} uses, {} users\n",
                html::escape(name),
                usage.total_uses,
                usage.unique_users
            ));
        }
    }
    text.push_str(&format_process(&view.process));
    text
}

pub async fn handle_stats(bot: Bot, msg: Message, state: AppState) -> anyhow::Result<()> {
    let allowed = match sender_id(&msg) {
        Some(id) => state.is_admin(id).await,
        None => false,
    };
    if !allowed {
        return reply_html(&bot, &msg, DENIED_ADMIN).await;
    }

    let stats = state.store.bot_stats().await;
    let users = state.store.user_ids().await.len();
    let bans = state.store.ban_count().await;
    let disabled = state.store.disabled_commands().await;
    let usage = state.store.command_stats().await;
    let process = ProcessView {
        bot_pid: state.pids.bot_pid().await,
        bot_running: state.pids.is_running(None).await,
        server_pid: match state.config.mode {
            RunMode::Webhook => state.pids.server_pid().await,
            RunMode::Polling => None,
        },
    };

    let text = format_stats(&StatsView {
        stats: &stats,
        users,
        bans,
        disabled: &disabled,
        usage: &usage,
        now: now_ts(),
        process,
    });
    reply_html(&bot, &msg, &text).await
}

fn is_owner(msg: &Message, state: &AppState) -> bool {
    sender_id(msg).is_some_and(|id| state.config.is_owner(id))
}

pub async fn handle_restart(bot: Bot, msg: Message, state: AppState) -> anyhow::Result<()> {
    if !is_owner(&msg, &state) {
        return reply_html(&bot, &msg, DENIED_OWNER).await;
    }

    if state.restarter.phase().is_active() {
        return reply_html(&bot, &msg, "\u{23f3} A restart is already in progress.").await;
    }

    let health_secs = state.config.restart_health_secs;
    let status = bot
        .send_message(
            msg.chat.id,
            format!(
                "\u{1f504} Restarting...\nStarting a new instance and checking it for {health_secs}s."
            ),
        )
        .await?;

    match state.restarter.restart().await {
        Ok(handover) => {
            let mut text = format!(
                "\u{2705} Restart successful.\nNew PID: {}\nMode: {}",
                handover.new_pid, state.config.mode
            );
            if handover.swept > 0 {
                text.push_str(&format!("\nStopped {} stale instance(s).", handover.swept));
            }
            if !handover.pid_saved {
                text.push_str("\n\u{26a0} Could not record the new PID.");
            }
            if let Err(e) = bot.edit_message_text(msg.chat.id, status.id, text).await {
                tracing::warn!("Failed to report restart result: {e}");
            }
            // Let the edit flush before exiting.
            tokio::time::sleep(Duration::from_millis(500)).await;
            state.restarter.self_terminate()
        }
        Err(e) => {
            bot.edit_message_text(
                msg.chat.id,
                status.id,
                format!("\u{274c} Restart failed: {e}\nThe current instance keeps running."),
            )
            .await?;
            Ok(())
        }
    }
}

pub async fn handle_reload(bot: Bot, msg: Message, state: AppState) -> anyhow::Result<()> {
    if !is_owner(&msg, &state) {
        return reply_html(&bot, &msg, DENIED_OWNER).await;
    }

    let disabled = state.store.disabled_commands().await;
    let (count, disabled_count) = {
        let mut registry = state.registry.write().await;
        let count = registry.reload(&disabled);
        (count, registry.disabled_count())
    };
    state.publish_commands(&bot).await;
    let profile_saved = state.sync_bot_profile().await;

    let mut text = format!(
        "\u{1f501} Reloaded {count} commands ({disabled_count} disabled)."
    );
    if !profile_saved {
        text.push_str("\n\u{26a0} Bot profile could not be written.");
    }
    reply_html(&bot, &msg, &text).await
}
