//! Chat-level tools: kicking members, user lookups and retracting bot messages.

use teloxide::prelude::*;
use teloxide::types::{ChatMemberKind, User};
use teloxide::utils::html;

use super::commands::{DENIED_ADMIN, GROUP_ONLY};
use super::util::{is_group_chat, reply_html, resolve_target, sender_id, ResolvedUser};
use super::AppState;
use crate::roles::Role;
use crate::store::UserRecord;

const DEFAULT_REASON: &str = "No reason provided";

/// Bot admins, plus the chat's own owner and administrators.
async fn is_chat_moderator(bot: &Bot, msg: &Message, state: &AppState, user_id: i64) -> bool {
    if state.is_admin(user_id).await {
        return true;
    }
    match bot.get_chat_member(msg.chat.id, UserId(user_id as u64)).await {
        Ok(member) => member.kind.is_privileged(),
        Err(e) => {
            tracing::warn!(user_id = user_id, chat_id = msg.chat.id.0, "Failed to fetch chat member: {e}");
            false
        }
    }
}

pub async fn handle_kick(bot: Bot, msg: Message, state: AppState, args: &str) -> anyhow::Result<()> {
    let Some(sender) = sender_id(&msg) else {
        return Ok(());
    };
    if !is_group_chat(&msg) {
        return reply_html(&bot, &msg, GROUP_ONLY).await;
    }
    if !is_chat_moderator(&bot, &msg, &state, sender).await {
        return reply_html(&bot, &msg, DENIED_ADMIN).await;
    }
    let (target, rest) = match resolve_target(&msg, args, &state).await {
        Ok(resolved) => resolved,
        Err(e) => return reply_html(&bot, &msg, &e.message("/kick <user> [reason]")).await,
    };

    if target.id == sender {
        return reply_html(&bot, &msg, "\u{274c} You cannot kick yourself.").await;
    }
    if state.config.is_owner(target.id) {
        return reply_html(&bot, &msg, "\u{274c} The bot owner cannot be kicked.").await;
    }

    let reason = if rest.is_empty() { DEFAULT_REASON } else { rest };
    let user = UserId(target.id as u64);
    if let Err(e) = bot.ban_chat_member(msg.chat.id, user).await {
        tracing::warn!(user_id = target.id, chat_id = msg.chat.id.0, "Kick failed: {e}");
        let text = format!(
            "\u{274c} Failed to kick {}: {}",
            target.label(),
            html::escape(&e.to_string())
        );
        return reply_html(&bot, &msg, &text).await;
    }

    let mut text = format!(
        "\u{1f462} {} has been kicked.\nReason: {}",
        target.label(),
        html::escape(reason)
    );
    // Lifting the ban straight away is what makes this a kick.
    if let Err(e) = bot
        .unban_chat_member(msg.chat.id, user)
        .only_if_banned(true)
        .await
    {
        tracing::warn!(user_id = target.id, chat_id = msg.chat.id.0, "Unban after kick failed: {e}");
        text.push_str("\n\u{26a0} They stay banned from this chat until unbanned.");
    }
    tracing::info!(
        user_id = target.id,
        chat_id = msg.chat.id.0,
        kicked_by = sender,
        reason = reason,
        "User kicked"
    );

    reply_html(&bot, &msg, &text).await
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserInfo {
    pub id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
    pub language: Option<String>,
    pub role: Role,
    /// Only filled in for admins.
    pub banned: Option<bool>,
    pub chat_status: Option<&'static str>,
}

impl UserInfo {
    fn from_user(user: &User) -> Self {
        Self {
            id: user.id.0 as i64,
            first_name: Some(user.first_name.clone()),
            last_name: user.last_name.clone(),
            username: user.username.clone(),
            language: user.language_code.clone(),
            ..Self::default()
        }
    }

    fn from_record(record: &UserRecord) -> Self {
        Self {
            id: record.user_id,
            first_name: record.first_name.clone(),
            last_name: record.last_name.clone(),
            username: record.username.clone(),
            ..Self::default()
        }
    }
}

pub fn chat_status(kind: &ChatMemberKind) -> &'static str {
    if kind.is_owner() {
        "Owner"
    } else if kind.is_administrator() {
        "Admin"
    } else if kind.is_restricted() {
        "Restricted"
    } else if kind.is_left() {
        "Left"
    } else if kind.is_banned() {
        "Banned"
    } else {
        "Member"
    }
}

pub fn format_info(info: &UserInfo) -> String {
    let name = [info.first_name.as_deref(), info.last_name.as_deref()]
        .into_iter()
        .flatten()
        .filter(|part| !part.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let name = if name.is_empty() {
        "Unknown".to_string()
    } else {
        html::escape(&name)
    };
    let username = match &info.username {
        Some(username) => format!("@{}", html::escape(username)),
        None => "None".to_string(),
    };

    let mut text = format!(
        "\u{1f464} <b>User information</b>\n\n\
         ID: <code>{}</code>\n\
         Name: {}\n\
         Username: {}\n\
         Language: {}\n\
         Role: {}\n",
        info.id,
        name,
        username,
        html::escape(info.language.as_deref().unwrap_or("Unknown")),
        info.role,
    );
    if let Some(status) = info.chat_status {
        text.push_str(&format!("Status: {status}\n"));
    }
    if let Some(banned) = info.banned {
        text.push_str(if banned { "Banned from bot: yes\n" } else { "Banned from bot: no\n" });
    }
    text
}

/// Details for a target named by id or @username, preferring our own records.
async fn lookup(bot: &Bot, msg: &Message, state: &AppState, target: &ResolvedUser) -> UserInfo {
    if let Some(record) = state.store.get_user(target.id).await {
        return UserInfo::from_record(&record);
    }
    if is_group_chat(msg) {
        if let Ok(member) = bot.get_chat_member(msg.chat.id, UserId(target.id as u64)).await {
            return UserInfo::from_user(&member.user);
        }
    }
    UserInfo {
        id: target.id,
        ..UserInfo::default()
    }
}

pub async fn handle_info(bot: Bot, msg: Message, state: AppState, args: &str) -> anyhow::Result<()> {
    let replied = msg.reply_to_message().and_then(|m| m.from.as_ref());
    let mut info = match (replied, msg.from.as_ref()) {
        (Some(user), _) => UserInfo::from_user(user),
        (None, Some(sender)) if args.trim().is_empty() => UserInfo::from_user(sender),
        (None, _) => match resolve_target(&msg, args, &state).await {
            Ok((target, _)) => lookup(&bot, &msg, &state, &target).await,
            Err(e) => return reply_html(&bot, &msg, &e.message("/info [user]")).await,
        },
    };

    info.role = state.store.resolve_role(info.id).await;
    let viewer_is_admin = match sender_id(&msg) {
        Some(id) => state.is_admin(id).await,
        None => false,
    };
    if viewer_is_admin {
        info.banned = Some(state.store.is_banned(info.id).await);
    }
    if is_group_chat(&msg) {
        match bot.get_chat_member(msg.chat.id, UserId(info.id as u64)).await {
            Ok(member) => info.chat_status = Some(chat_status(&member.kind)),
            Err(e) => tracing::debug!(user_id = info.id, "No chat member status: {e}"),
        }
    }

    reply_html(&bot, &msg, &format_info(&info)).await
}

/// Whether an account with these attributes is this bot.
pub fn is_bot_account(is_bot: bool, username: Option<&str>, bot_username: &str) -> bool {
    is_bot && username.is_some_and(|name| name.eq_ignore_ascii_case(bot_username))
}

const UNSEND_USAGE: &str = "\u{1f5d1} <b>Unsend</b>\n\n\
    Reply to any message sent by this bot to delete it.\n\n\
    <code>/unsend</code> (as a reply)";

pub async fn handle_unsend(bot: Bot, msg: Message, state: AppState) -> anyhow::Result<()> {
    let Some(reply) = msg.reply_to_message() else {
        return reply_html(&bot, &msg, UNSEND_USAGE).await;
    };
    let own = reply
        .from
        .as_ref()
        .is_some_and(|u| is_bot_account(u.is_bot, u.username.as_deref(), &state.bot_username));
    if !own {
        return reply_html(&bot, &msg, "\u{274c} You can only unsend messages sent by this bot.").await;
    }

    if let Err(e) = bot.delete_message(msg.chat.id, reply.id).await {
        tracing::warn!(chat_id = msg.chat.id.0, "Unsend failed: {e}");
        return reply_html(
            &bot,
            &msg,
            "\u{274c} Failed to delete the message. It may be too old or I may lack permission.",
        )
        .await;
    }
    if let Err(e) = bot.delete_message(msg.chat.id, msg.id).await {
        tracing::debug!(chat_id = msg.chat.id.0, "Could not delete the /unsend message: {e}");
    }
    tracing::info!(by = ?sender_id(&msg), chat_id = msg.chat.id.0, "Message unsent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_info_full() {
        let info = UserInfo {
            id: 7,
            first_name: Some("Ann".to_string()),
            last_name: Some("<Lee>".to_string()),
            username: Some("ann_lee".to_string()),
            language: Some("en".to_string()),
            role: Role::Elder,
            banned: Some(false),
            chat_status: Some("Admin"),
        };
        let text = format_info(&info);
        assert!(text.contains("ID: <code>7</code>"));
        assert!(text.contains("Name: Ann &lt;Lee&gt;"));
        assert!(text.contains("Username: @ann_lee"));
        assert!(text.contains("Language: en"));
        assert!(text.contains(&format!("Role: {}", Role::Elder)));
        assert!(text.contains("Status: Admin"));
        assert!(text.contains("Banned from bot: no"));
    }

    #[test]
    fn test_format_info_bare_id() {
        let info = UserInfo {
            id: 99,
            ..UserInfo::default()
        };
        let text = format_info(&info);
        assert!(text.contains("Name: Unknown"));
        assert!(text.contains("Username: None"));
        assert!(text.contains("Language: Unknown"));
        assert!(!text.contains("Status:"));
        assert!(!text.contains("Banned from bot"));
    }

    #[test]
    fn test_info_from_record() {
        let record = UserRecord {
            user_id: 5,
            username: Some("bob".to_string()),
            first_name: Some("Bob".to_string()),
            last_name: None,
            role: Role::User,
            joined_at: 0.0,
            last_seen: 0.0,
        };
        let info = UserInfo::from_record(&record);
        assert_eq!(info.id, 5);
        assert_eq!(info.username.as_deref(), Some("bob"));
        assert_eq!(info.language, None);
    }

    #[test]
    fn test_is_bot_account() {
        assert!(is_bot_account(true, Some("KomiHub_Bot"), "komihub_bot"));
        assert!(!is_bot_account(false, Some("komihub_bot"), "komihub_bot"));
        assert!(!is_bot_account(true, Some("other_bot"), "komihub_bot"));
        assert!(!is_bot_account(true, None, "komihub_bot"));
    }
}
