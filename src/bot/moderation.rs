//! Bans, command toggles and broadcasts.

use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::html;
use tokio::time::Duration;

use super::commands::{DENIED_ADMIN, DENIED_OWNER};
use super::util::{is_group_chat, reply_html, resolve_target, sender_id, split_args};
use super::AppState;
use crate::registry;
use crate::store::{format_ts, BanRecord};

const DEFAULT_REASON: &str = "No reason provided";
const BROADCAST_PACE: Duration = Duration::from_millis(100);
const BROADCAST_PROGRESS_EVERY: usize = 10;

/// Admin check shared by every handler here. Returns the sender id when allowed.
async fn require_admin(bot: &Bot, msg: &Message, state: &AppState) -> anyhow::Result<Option<i64>> {
    match sender_id(msg) {
        Some(id) if state.is_admin(id).await => Ok(Some(id)),
        _ => {
            reply_html(bot, msg, DENIED_ADMIN).await?;
            Ok(None)
        }
    }
}

pub async fn handle_ban(bot: Bot, msg: Message, state: AppState, args: &str) -> anyhow::Result<()> {
    let Some(admin_id) = require_admin(&bot, &msg, &state).await? else {
        return Ok(());
    };
    let (target, rest) = match resolve_target(&msg, args, &state).await {
        Ok(resolved) => resolved,
        Err(e) => return reply_html(&bot, &msg, &e.message("/ban <user> [reason]")).await,
    };

    if state.config.is_owner(target.id) {
        return reply_html(&bot, &msg, "\u{274c} The bot owner cannot be banned.").await;
    }
    if target.id == admin_id {
        return reply_html(&bot, &msg, "\u{274c} You cannot ban yourself.").await;
    }
    if state.store.is_admin(target.id, None).await && !state.config.is_owner(admin_id) {
        return reply_html(&bot, &msg, DENIED_OWNER).await;
    }

    let reason = if rest.is_empty() { DEFAULT_REASON } else { rest };
    let already_banned = state.store.is_banned(target.id).await;
    if !state.store.ban_user(target.id, reason, Some(admin_id)).await {
        return reply_html(&bot, &msg, "\u{26a0} Failed to save the ban. Check the logs.").await;
    }
    tracing::info!(user_id = target.id, banned_by = admin_id, reason = reason, "User banned");

    let mut text = format!(
        "\u{1f6ab} {} has been banned.\nReason: {}",
        target.label(),
        html::escape(reason)
    );
    if already_banned {
        text.push_str("\n(Existing ban replaced.)");
    }

    if is_group_chat(&msg) {
        let user = UserId(target.id as u64);
        match bot.ban_chat_member(msg.chat.id, user).await {
            Ok(_) => text.push_str("\nAlso removed from this chat."),
            Err(e) => {
                tracing::warn!(user_id = target.id, chat_id = msg.chat.id.0, "Chat ban failed: {e}");
                text.push_str("\n\u{26a0} Could not ban from this chat (missing rights?).");
            }
        }
    }

    reply_html(&bot, &msg, &text).await
}

pub async fn handle_unban(bot: Bot, msg: Message, state: AppState, args: &str) -> anyhow::Result<()> {
    let Some(admin_id) = require_admin(&bot, &msg, &state).await? else {
        return Ok(());
    };
    let (target, _) = match resolve_target(&msg, args, &state).await {
        Ok(resolved) => resolved,
        Err(e) => return reply_html(&bot, &msg, &e.message("/unban <user>")).await,
    };

    if !state.store.unban_user(target.id).await {
        let text = format!("\u{2139} {} is not banned.", target.label());
        return reply_html(&bot, &msg, &text).await;
    }
    tracing::info!(user_id = target.id, unbanned_by = admin_id, "User unbanned");

    if is_group_chat(&msg) {
        let user = UserId(target.id as u64);
        if let Err(e) = bot
            .unban_chat_member(msg.chat.id, user)
            .only_if_banned(true)
            .await
        {
            tracing::warn!(user_id = target.id, chat_id = msg.chat.id.0, "Chat unban failed: {e}");
        }
    }

    let text = format!("\u{2705} {} has been unbanned.", target.label());
    reply_html(&bot, &msg, &text).await
}

pub fn format_ban(record: &BanRecord, label: &str, banned_by: Option<&str>) -> String {
    format!(
        "\u{1f6ab} <b>Ban info</b>\n\nUser: {}\nReason: {}\nBanned at: {}\nBanned by: {}",
        label,
        html::escape(&record.reason),
        format_ts(record.banned_at),
        banned_by.unwrap_or("unknown"),
    )
}

pub async fn handle_ban_info(
    bot: Bot,
    msg: Message,
    state: AppState,
    args: &str,
) -> anyhow::Result<()> {
    if require_admin(&bot, &msg, &state).await?.is_none() {
        return Ok(());
    }
    let (target, _) = match resolve_target(&msg, args, &state).await {
        Ok(resolved) => resolved,
        Err(e) => return reply_html(&bot, &msg, &e.message("/ban_info <user>")).await,
    };

    let text = match state.store.get_ban_info(target.id).await {
        Some(record) => {
            let banned_by = record.banned_by.map(|id| format!("<code>{id}</code>"));
            format_ban(&record, &target.label(), banned_by.as_deref())
        }
        None => format!("\u{2139} {} is not banned.", target.label()),
    };
    reply_html(&bot, &msg, &text).await
}

/// Checks a command name for `/disable` and `/enable`.
pub fn validate_toggle(raw: &str, is_known: impl Fn(&str) -> bool) -> Result<String, String> {
    let name = registry::normalize_command_name(raw);
    if name.is_empty() {
        return Err("Please name a command.".to_string());
    }
    if !registry::is_valid_command_name(&name) {
        return Err(format!("<code>{}</code> is not a valid command name.", html::escape(&name)));
    }
    if registry::is_protected(&name) {
        return Err(format!("<code>/{name}</code> cannot be disabled or enabled."));
    }
    if !is_known(&name) {
        return Err(format!("Unknown command <code>/{name}</code>."));
    }
    Ok(name)
}

async fn toggle_command(
    bot: Bot,
    msg: Message,
    state: AppState,
    args: &str,
    disable: bool,
) -> anyhow::Result<()> {
    if require_admin(&bot, &msg, &state).await?.is_none() {
        return Ok(());
    }
    let usage = if disable { "/disable <command>" } else { "/enable <command>" };
    let raw = split_args(args).0.unwrap_or("");

    let name = {
        let registry = state.registry.read().await;
        validate_toggle(raw, |n| registry.is_known(n))
    };
    let name = match name {
        Ok(name) => name,
        Err(e) => {
            let text = format!("\u{274c} {e}\n\nUsage: <code>{}</code>", html::escape(usage));
            return reply_html(&bot, &msg, &text).await;
        }
    };

    let changed = if disable {
        state.store.disable_command(&name).await
    } else {
        state.store.enable_command(&name).await
    };
    if !changed {
        let text = if disable {
            format!("\u{2139} <code>/{name}</code> is already disabled.")
        } else {
            format!("\u{2139} <code>/{name}</code> is not disabled.")
        };
        return reply_html(&bot, &msg, &text).await;
    }

    state.registry.write().await.set_disabled(&name, disable);
    state
        .store
        .set_profile_command_disabled(&state.bot_username, &name, disable)
        .await;
    state.publish_commands(&bot).await;
    tracing::info!(command = %name, disabled = disable, by = ?sender_id(&msg), "Command toggled");

    let text = if disable {
        format!("\u{1f6ab} <code>/{name}</code> has been disabled.")
    } else {
        format!("\u{2705} <code>/{name}</code> has been enabled.")
    };
    reply_html(&bot, &msg, &text).await
}

pub async fn handle_disable(bot: Bot, msg: Message, state: AppState, args: &str) -> anyhow::Result<()> {
    toggle_command(bot, msg, state, args, true).await
}

pub async fn handle_enable(bot: Bot, msg: Message, state: AppState, args: &str) -> anyhow::Result<()> {
    toggle_command(bot, msg, state, args, false).await
}

fn broadcast_progress(sent: usize, failed: usize, total: usize) -> String {
    format!("\u{1f4e2} Broadcasting... {}/{} (failed: {failed})", sent + failed, total)
}

pub async fn handle_broadcast(
    bot: Bot,
    msg: Message,
    state: AppState,
    text: &str,
) -> anyhow::Result<()> {
    let Some(admin_id) = require_admin(&bot, &msg, &state).await? else {
        return Ok(());
    };
    let text = text.trim();
    if text.is_empty() {
        return reply_html(&bot, &msg, "Usage: <code>/broadcast &lt;message&gt;</code>").await;
    }

    let recipients = state.store.user_ids().await;
    let total = recipients.len();
    tracing::info!(by = admin_id, recipients = total, "Broadcast started");

    let status = bot
        .send_message(msg.chat.id, broadcast_progress(0, 0, total))
        .await?;

    let body = format!("\u{1f4e2} <b>Announcement</b>\n\n{}", html::escape(text));
    let mut sent = 0;
    let mut failed = 0;
    for (i, user_id) in recipients.iter().enumerate() {
        match bot
            .send_message(ChatId(*user_id), body.clone())
            .parse_mode(ParseMode::Html)
            .await
        {
            Ok(_) => sent += 1,
            Err(e) => {
                tracing::debug!(user_id = user_id, "Broadcast delivery failed: {e}");
                failed += 1;
            }
        }

        if (i + 1) % BROADCAST_PROGRESS_EVERY == 0 {
            if let Err(e) = bot
                .edit_message_text(msg.chat.id, status.id, broadcast_progress(sent, failed, total))
                .await
            {
                tracing::debug!("Broadcast progress edit failed: {e}");
            }
        }
        tokio::time::sleep(BROADCAST_PACE).await;
    }

    tracing::info!(sent = sent, failed = failed, "Broadcast finished");
    bot.edit_message_text(
        msg.chat.id,
        status.id,
        format!("\u{2705} Broadcast complete.\nSent: {sent}\nFailed: {failed}\nTotal: {total}"),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(name: &str) -> bool {
        matches!(name, "ping" | "stats" | "help" | "enable")
    }

    #[test]
    fn test_validate_toggle() {
        assert_eq!(validate_toggle("/Ping", known).unwrap(), "ping");
        assert!(validate_toggle("", known).is_err());
        assert!(validate_toggle("rm-rf", known).unwrap_err().contains("not a valid"));
        assert!(validate_toggle("help", known).unwrap_err().contains("cannot be"));
        assert!(validate_toggle("enable", known).unwrap_err().contains("cannot be"));
        assert!(validate_toggle("ghost", known).unwrap_err().contains("Unknown"));
    }

    #[test]
    fn test_format_ban() {
        let record = BanRecord {
            user_id: 5,
            banned_at: 0.0,
            reason: "<spam>".to_string(),
            banned_by: Some(1),
        };
        let text = format_ban(&record, "<code>5</code>", Some("<code>1</code>"));
        assert!(text.contains("Reason: &lt;spam&gt;"));
        assert!(text.contains("1970-01-01 00:00:00 UTC"));
        assert!(text.contains("Banned by: <code>1</code>"));

        let text = format_ban(&record, "<code>5</code>", None);
        assert!(text.contains("Banned by: unknown"));
    }

    #[test]
    fn test_broadcast_progress() {
        assert_eq!(
            broadcast_progress(8, 2, 25),
            "\u{1f4e2} Broadcasting... 10/25 (failed: 2)"
        );
    }
}
