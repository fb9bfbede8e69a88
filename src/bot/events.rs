use teloxide::prelude::*;
use teloxide::types::ChatMemberUpdated;
use teloxide::utils::html;

use super::commands::disabled_text;
use super::util::{profile_of, reply_html, sender_id};
use super::AppState;

pub async fn handle_chat_member(upd: ChatMemberUpdated, state: AppState) -> anyhow::Result<()> {
    let user = &upd.new_chat_member.user;
    let user_id = user.id.0 as i64;
    let was_present = upd.old_chat_member.kind.is_present();
    let is_present = upd.new_chat_member.kind.is_present();

    if is_present && !was_present {
        if !user.is_bot {
            state.store.touch_user(user_id, &profile_of(user)).await;
        }
        tracing::info!(user_id = user_id, chat_id = upd.chat.id.0, "Member joined");
    } else if was_present && !is_present {
        tracing::info!(user_id = user_id, chat_id = upd.chat.id.0, "Member left");
    }
    Ok(())
}

pub async fn handle_new_members(msg: Message, state: AppState) -> anyhow::Result<()> {
    let Some(members) = msg.new_chat_members() else {
        return Ok(());
    };
    for user in members.iter().filter(|u| !u.is_bot) {
        let user_id = user.id.0 as i64;
        state.store.touch_user(user_id, &profile_of(user)).await;
        tracing::info!(user_id = user_id, chat_id = msg.chat.id.0, "New chat member");
    }
    Ok(())
}

/// Splits `/name@bot args` into the lowercase name and the optional mention.
pub fn extract_command(text: &str) -> Option<(String, Option<&str>)> {
    let head = text.split_whitespace().next()?.strip_prefix('/')?;
    let (name, mention) = match head.split_once('@') {
        Some((name, mention)) => (name, Some(mention)),
        None => (head, None),
    };
    if name.is_empty() {
        return None;
    }
    Some((name.to_lowercase(), mention))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintCategory {
    Common,
    Download,
    Qr,
    Admin,
    Short,
    Generic,
}

pub fn categorize(name: &str) -> HintCategory {
    const COMMON: [&str; 5] = ["start", "help", "ping", "info", "stats"];
    const DOWNLOAD: [&str; 5] = ["dl", "download", "music", "video", "audio"];
    const QR: [&str; 3] = ["qr", "code", "qrcode"];
    const ADMIN: [&str; 4] = ["admin", "manage", "ban", "kick"];

    if COMMON.contains(&name) {
        HintCategory::Common
    } else if DOWNLOAD.iter().any(|k| name.contains(k)) {
        HintCategory::Download
    } else if QR.iter().any(|k| name.contains(k)) {
        HintCategory::Qr
    } else if ADMIN.iter().any(|k| name.contains(k)) {
        HintCategory::Admin
    } else if name.chars().count() <= 2 {
        HintCategory::Short
    } else {
        HintCategory::Generic
    }
}

pub fn unknown_hint(name: &str) -> String {
    let code = format!("<code>/{}</code>", html::escape(name));
    match categorize(name) {
        HintCategory::Common => format!(
            "\u{2753} <b>Command not found:</b> {code}\n\n\
             \u{1f4a1} Use /help to see all available commands.\n\
             \u{1f504} Admins can run /reload if commands were recently changed."
        ),
        HintCategory::Download => format!(
            "\u{2753} <b>Download command not found:</b> {code}\n\n\
             \u{1f4e5} This bot does not provide downloads. See /help."
        ),
        HintCategory::Qr => format!(
            "\u{2753} <b>QR command not found:</b> {code}\n\n\
             \u{1f533} QR code generation is not available here. See /help."
        ),
        HintCategory::Admin => format!(
            "\u{2753} <b>Admin command not found:</b> {code}\n\n\
             \u{1f451} <b>Admin commands:</b>\n\
             \u{2022} /add_admin, /remove_admin, /list_admins\n\
             \u{2022} /add_admin_gc, /remove_admin_gc\n\
             \u{2022} /ban, /unban, /ban_info\n\
             \u{2022} /broadcast"
        ),
        HintCategory::Short => format!(
            "\u{2753} <b>Short command:</b> {code}\n\n\
             \u{1f4a1} This might be a typo. Use /help for available commands."
        ),
        HintCategory::Generic => format!(
            "\u{2753} <b>Unknown command:</b> {code}\n\n\
             \u{1f4a1} <b>Try:</b> /help to list all commands"
        ),
    }
}

pub async fn handle_unknown_command(
    bot: Bot,
    msg: Message,
    state: AppState,
) -> anyhow::Result<()> {
    let Some((name, mention)) = msg.text().and_then(extract_command) else {
        return Ok(());
    };
    // Commands addressed to another bot in a group are not ours to answer.
    if mention.is_some_and(|m| !m.eq_ignore_ascii_case(&state.bot_username)) {
        return Ok(());
    }

    if state.store.is_command_disabled(&name).await {
        return reply_html(&bot, &msg, &disabled_text(&name)).await;
    }

    let usage = state
        .registry
        .read()
        .await
        .get(&name)
        .map(|info| info.usage.clone());
    let text = match usage {
        // Registered, but the arguments did not parse.
        Some(usage) => format!("Usage: <code>{}</code>", html::escape(&usage)),
        None => {
            tracing::warn!(user_id = ?sender_id(&msg), command = %name, "Unknown command");
            unknown_hint(&name)
        }
    };
    reply_html(&bot, &msg, &text).await?;

    if let Some(user_id) = sender_id(&msg) {
        state.store.increment_command_usage("unknown", user_id).await;
    }
    Ok(())
}
