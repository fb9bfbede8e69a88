//! Filter in front of command handling. Every non-service message from a
//! user updates the user store; only slash commands continue past the gate,
//! and only when the sender is not banned, not held back by maintenance mode
//! and within the rate limit.

use teloxide::prelude::*;
use teloxide::types::{ParseMode, User};
use teloxide::utils::html;

use super::util::profile_of;
use super::AppState;

const PRUNE_THRESHOLD: usize = 1024;

async fn notify(bot: &Bot, msg: &Message, text: String) {
    if let Err(e) = bot
        .send_message(msg.chat.id, text)
        .parse_mode(ParseMode::Html)
        .await
    {
        tracing::warn!(chat_id = msg.chat.id.0, "Failed to send gate reply: {e}");
    }
}

pub async fn admit(bot: Bot, msg: Message, state: AppState) -> bool {
    let Some(user) = msg.from.as_ref() else {
        return false;
    };
    let user_id = user.id.0 as i64;
    let is_command = msg.text().is_some_and(|t| t.starts_with('/'));

    if let Some(ban) = state.store.get_ban_info(user_id).await {
        if !is_command {
            return false;
        }
        tracing::info!(user_id = user_id, "Ignoring command from banned user");
        notify(
            &bot,
            &msg,
            format!(
                "\u{1f6ab} You are banned from using this bot.\nReason: {}",
                html::escape(&ban.reason)
            ),
        )
        .await;
        return false;
    }

    if !is_command {
        track_user(&state, user).await;
        return false;
    }

    let is_admin = state.is_admin(user_id).await;

    if state.config.maintenance_mode && !is_admin {
        notify(
            &bot,
            &msg,
            "\u{1f6e0} The bot is under maintenance. Please try again later.".to_string(),
        )
        .await;
        return false;
    }

    if state.config.rate_limit.enabled && !is_admin {
        let mut limiter = state.rate_limiter.lock().await;
        if limiter.tracked_users() > PRUNE_THRESHOLD {
            limiter.prune();
        }
        let result = limiter.check(user_id);
        drop(limiter);
        if !result.allowed {
            let secs = result.retry_after_ms.unwrap_or(0).div_ceil(1000);
            tracing::debug!(user_id = user_id, retry_after_secs = secs, "Rate limited");
            notify(
                &bot,
                &msg,
                format!("\u{23f3} Please wait {secs}s before sending another command."),
            )
            .await;
            return false;
        }
    }

    track_user(&state, user).await;
    true
}

async fn track_user(state: &AppState, user: &User) {
    let user_id = user.id.0 as i64;
    if state.store.touch_user(user_id, &profile_of(user)).await {
        tracing::info!(user_id = user_id, username = ?user.username, "New user");
    }
}
