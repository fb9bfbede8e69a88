use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use teloxide::utils::html;

use super::util::{reply_html, sender_id};
use super::{admin, chat, moderation, system, AppState};
use crate::registry::{self, CommandInfo};
use crate::store::CommandUsage;

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "snake_case")]
pub enum Command {
    #[command(description = "Welcome message")]
    Start,
    #[command(description = "List commands or show details for one")]
    Help(String),
    #[command(description = "Check bot response time")]
    Ping,
    #[command(description = "Bot statistics")]
    Stats,
    #[command(description = "Grant an admin role")]
    AddAdmin(String),
    #[command(description = "Revoke an admin role")]
    RemoveAdmin(String),
    #[command(description = "List all admins")]
    ListAdmins,
    #[command(description = "Grant group chat admin")]
    AddAdminGc(String),
    #[command(description = "Revoke group chat admin")]
    RemoveAdminGc(String),
    #[command(description = "Ban a user from the bot")]
    Ban(String),
    #[command(description = "Lift a ban")]
    Unban(String),
    #[command(description = "Show ban details")]
    BanInfo(String),
    #[command(description = "Remove a user from this chat")]
    Kick(String),
    #[command(description = "Show information about a user")]
    Info(String),
    #[command(description = "Delete a bot message (reply to it)")]
    Unsend,
    #[command(description = "Disable a command")]
    Disable(String),
    #[command(description = "Enable a command")]
    Enable(String),
    #[command(description = "Message every known user")]
    Broadcast(String),
    #[command(description = "Restart the bot without downtime")]
    Restart,
    #[command(description = "Reload the command table")]
    Reload,
}

impl Command {
    /// Registry name, as typed after the slash.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Help(_) => "help",
            Command::Ping => "ping",
            Command::Stats => "stats",
            Command::AddAdmin(_) => "add_admin",
            Command::RemoveAdmin(_) => "remove_admin",
            Command::ListAdmins => "list_admins",
            Command::AddAdminGc(_) => "add_admin_gc",
            Command::RemoveAdminGc(_) => "remove_admin_gc",
            Command::Ban(_) => "ban",
            Command::Unban(_) => "unban",
            Command::BanInfo(_) => "ban_info",
            Command::Kick(_) => "kick",
            Command::Info(_) => "info",
            Command::Unsend => "unsend",
            Command::Disable(_) => "disable",
            Command::Enable(_) => "enable",
            Command::Broadcast(_) => "broadcast",
            Command::Restart => "restart",
            Command::Reload => "reload",
        }
    }
}

pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    state: AppState,
) -> anyhow::Result<()> {
    let name = cmd.name();

    if !registry::is_protected(name) && state.store.is_command_disabled(name).await {
        reply_html(&bot, &msg, &disabled_text(name)).await?;
        return Ok(());
    }

    if let Some(user_id) = sender_id(&msg) {
        state.store.increment_command_usage(name, user_id).await;
        tracing::info!(command = name, user_id = user_id, chat_id = msg.chat.id.0, "Command");
    }

    match cmd {
        Command::Start => handle_start(bot, msg, state).await,
        Command::Help(args) => handle_help(bot, msg, state, &args).await,
        Command::Ping => system::handle_ping(bot, msg).await,
        Command::Stats => system::handle_stats(bot, msg, state).await,
        Command::AddAdmin(args) => admin::handle_add_admin(bot, msg, state, &args).await,
        Command::RemoveAdmin(args) => admin::handle_remove_admin(bot, msg, state, &args).await,
        Command::ListAdmins => admin::handle_list_admins(bot, msg, state).await,
        Command::AddAdminGc(args) => admin::handle_add_admin_gc(bot, msg, state, &args).await,
        Command::RemoveAdminGc(args) => {
            admin::handle_remove_admin_gc(bot, msg, state, &args).await
        }
        Command::Ban(args) => moderation::handle_ban(bot, msg, state, &args).await,
        Command::Unban(args) => moderation::handle_unban(bot, msg, state, &args).await,
        Command::BanInfo(args) => moderation::handle_ban_info(bot, msg, state, &args).await,
        Command::Kick(args) => chat::handle_kick(bot, msg, state, &args).await,
        Command::Info(args) => chat::handle_info(bot, msg, state, &args).await,
        Command::Unsend => chat::handle_unsend(bot, msg, state).await,
        Command::Disable(args) => moderation::handle_disable(bot, msg, state, &args).await,
        Command::Enable(args) => moderation::handle_enable(bot, msg, state, &args).await,
        Command::Broadcast(text) => moderation::handle_broadcast(bot, msg, state, &text).await,
        Command::Restart => system::handle_restart(bot, msg, state).await,
        Command::Reload => system::handle_reload(bot, msg, state).await,
    }
}

pub fn disabled_text(name: &str) -> String {
    format!(
        "\u{1f6ab} The command <code>/{}</code> is currently disabled.",
        html::escape(name)
    )
}

pub const DENIED_ADMIN: &str = "\u{274c} This command is only available to admins.";
pub const DENIED_OWNER: &str = "\u{274c} Only the bot owner can use this command.";
pub const GROUP_ONLY: &str = "\u{274c} This command can only be used in group chats.";

async fn handle_start(bot: Bot, msg: Message, state: AppState) -> anyhow::Result<()> {
    let first_name = msg
        .from
        .as_ref()
        .map(|u| u.first_name.clone())
        .unwrap_or_else(|| "there".to_string());

    reply_html(
        &bot,
        &msg,
        &format!(
            "\u{1f44b} Hello {}!\n\nWelcome to <b>{}</b>, run by {}.\nType /help to see what I can do.",
            html::escape(&first_name),
            html::escape(&state.config.bot_name),
            html::escape(&state.config.owner_name),
        ),
    )
    .await
}

pub fn format_help(bot_name: &str, commands: &[&CommandInfo], is_admin: bool) -> String {
    let mut text = format!("\u{1f4d6} <b>{} Commands</b>\n", html::escape(bot_name));

    let (admin_cmds, user_cmds): (Vec<&CommandInfo>, Vec<&CommandInfo>) =
        commands.iter().copied().partition(|c| c.admin_only);

    text.push_str("\n<b>General</b>\n");
    for cmd in &user_cmds {
        text.push_str(&format!("/{} - {}\n", cmd.name, html::escape(&cmd.description)));
    }

    if is_admin && !admin_cmds.is_empty() {
        text.push_str("\n<b>Admin</b>\n");
        for cmd in &admin_cmds {
            text.push_str(&format!("/{} - {}\n", cmd.name, html::escape(&cmd.description)));
        }
    }

    text.push_str("\nUse <code>/help &lt;command&gt;</code> for details.");
    text
}

pub fn format_command_detail(info: &CommandInfo, usage: Option<&CommandUsage>) -> String {
    let mut text = format!(
        "\u{2139} <b>/{}</b>\n\n{}\n\nUsage: <code>{}</code>",
        info.name,
        html::escape(&info.description),
        html::escape(&info.usage),
    );
    if info.admin_only {
        text.push_str("\n\u{1f512} Admin only");
    }
    if info.disabled {
        text.push_str("\n\u{1f6ab} Currently disabled");
    }
    if let Some(usage) = usage {
        text.push_str(&format!(
            "\n\u{1f4c8} Used {} times by {} users",
            usage.total_uses, usage.unique_users
        ));
    }
    text
}

async fn handle_help(bot: Bot, msg: Message, state: AppState, args: &str) -> anyhow::Result<()> {
    let is_admin = match sender_id(&msg) {
        Some(id) => state.is_admin(id).await,
        None => false,
    };
    let query = registry::normalize_command_name(args);
    let usage = if query.is_empty() {
        None
    } else {
        state.store.command_usage(&query).await
    };

    let registry = state.registry.read().await;
    let text = if query.is_empty() {
        format_help(&state.config.bot_name, &registry.visible(is_admin), is_admin)
    } else {
        match registry.get(&query) {
            Some(info) if is_admin || !info.admin_only => {
                format_command_detail(info, usage.as_ref())
            }
            _ => format!(
                "\u{2753} Unknown command <code>/{}</code>. Type /help for the list.",
                html::escape(&query)
            ),
        }
    };
    drop(registry);

    reply_html(&bot, &msg, &text).await
}
