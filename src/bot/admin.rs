//! Roster management commands.

use std::collections::HashMap;

use teloxide::prelude::*;
use teloxide::utils::html;

use super::commands::{DENIED_ADMIN, DENIED_OWNER, GROUP_ONLY};
use super::util::{is_group_chat, reply_html, resolve_target, sender_id, split_args, ResolvedUser};
use super::AppState;
use crate::roles::{AdminRoster, Roster};

fn parse_grantable(raw: Option<&str>) -> Result<Roster, String> {
    let roster = match raw {
        Some(raw) => raw.parse::<Roster>()?,
        None => Roster::Admins,
    };
    if !Roster::GRANTABLE.contains(&roster) {
        return Err(format!("{roster} cannot be granted"));
    }
    Ok(roster)
}

fn roster_choices() -> String {
    Roster::GRANTABLE
        .iter()
        .map(|r| r.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

async fn require_owner(bot: &Bot, msg: &Message, state: &AppState) -> anyhow::Result<bool> {
    let allowed = sender_id(msg).is_some_and(|id| state.config.is_owner(id));
    if !allowed {
        reply_html(bot, msg, DENIED_OWNER).await?;
    }
    Ok(allowed)
}

/// Owner, or an existing group chat admin, inside a group.
async fn require_gc_manager(bot: &Bot, msg: &Message, state: &AppState) -> anyhow::Result<bool> {
    let Some(user_id) = sender_id(msg) else {
        return Ok(false);
    };
    if !is_group_chat(msg) {
        reply_html(bot, msg, GROUP_ONLY).await?;
        return Ok(false);
    }
    let allowed = state.config.is_owner(user_id)
        || state.store.is_admin(user_id, Some(Roster::GcAdmins)).await;
    if !allowed {
        reply_html(
            bot,
            msg,
            "\u{274c} Only the owner or group chat admins can use this command.",
        )
        .await?;
    }
    Ok(allowed)
}

pub async fn handle_add_admin(
    bot: Bot,
    msg: Message,
    state: AppState,
    args: &str,
) -> anyhow::Result<()> {
    if !require_owner(&bot, &msg, &state).await? {
        return Ok(());
    }
    let usage = "/add_admin <user> [admins|elders|gc_admins|ch_admins]";
    let (target, rest) = match resolve_target(&msg, args, &state).await {
        Ok(resolved) => resolved,
        Err(e) => return reply_html(&bot, &msg, &e.message(usage)).await,
    };
    let roster = match parse_grantable(split_args(rest).0) {
        Ok(roster) => roster,
        Err(e) => {
            let text = format!(
                "\u{274c} {}\nValid types: {}",
                html::escape(&e),
                roster_choices()
            );
            return reply_html(&bot, &msg, &text).await;
        }
    };

    let text = if state.store.add_admin(target.id, roster).await {
        format!("\u{2705} {} is now {}.", target.label(), roster.title())
    } else {
        format!("\u{2139} {} is already in {}.", target.label(), roster.as_str())
    };
    reply_html(&bot, &msg, &text).await
}

pub async fn handle_remove_admin(
    bot: Bot,
    msg: Message,
    state: AppState,
    args: &str,
) -> anyhow::Result<()> {
    if !require_owner(&bot, &msg, &state).await? {
        return Ok(());
    }
    let usage = "/remove_admin <user> [admins|elders|gc_admins|ch_admins]";
    let (target, rest) = match resolve_target(&msg, args, &state).await {
        Ok(resolved) => resolved,
        Err(e) => return reply_html(&bot, &msg, &e.message(usage)).await,
    };
    let roster = match parse_grantable(split_args(rest).0) {
        Ok(roster) => roster,
        Err(e) => {
            let text = format!(
                "\u{274c} {}\nValid types: {}",
                html::escape(&e),
                roster_choices()
            );
            return reply_html(&bot, &msg, &text).await;
        }
    };

    let text = if state.store.remove_admin(target.id, roster).await {
        let role = state.store.get_user_role(target.id).await;
        format!(
            "\u{2705} {} removed from {}. Current role: {}.",
            target.label(),
            roster.as_str(),
            role
        )
    } else {
        format!("\u{2139} {} is not in {}.", target.label(), roster.as_str())
    };
    reply_html(&bot, &msg, &text).await
}

/// Renders every roster with known display names.
pub fn format_roster(roster: &AdminRoster, names: &HashMap<i64, String>) -> String {
    let mut text = String::from("\u{1f6e1} <b>Admin list</b>\n");
    for kind in Roster::PRIORITY {
        let ids = roster.list(kind);
        text.push_str(&format!("\n<b>{}</b> ({})\n", kind.heading(), ids.len()));
        if ids.is_empty() {
            text.push_str("  <i>none</i>\n");
            continue;
        }
        for id in ids {
            let user = ResolvedUser {
                id: *id,
                display_name: names.get(id).cloned(),
            };
            text.push_str(&format!("  \u{2022} {}\n", user.label()));
        }
    }
    text
}

pub async fn handle_list_admins(bot: Bot, msg: Message, state: AppState) -> anyhow::Result<()> {
    let allowed = match sender_id(&msg) {
        Some(id) => state.is_admin(id).await,
        None => false,
    };
    if !allowed {
        return reply_html(&bot, &msg, DENIED_ADMIN).await;
    }

    let roster = state.store.admin_roster().await;
    let mut names = HashMap::new();
    for kind in Roster::PRIORITY {
        for id in roster.list(kind) {
            if names.contains_key(id) {
                continue;
            }
            if let Some(name) = state.store.get_user(*id).await.and_then(|u| u.display_name()) {
                names.insert(*id, name);
            }
        }
    }

    reply_html(&bot, &msg, &format_roster(&roster, &names)).await
}

pub async fn handle_add_admin_gc(
    bot: Bot,
    msg: Message,
    state: AppState,
    args: &str,
) -> anyhow::Result<()> {
    if !require_gc_manager(&bot, &msg, &state).await? {
        return Ok(());
    }
    let (target, _) = match resolve_target(&msg, args, &state).await {
        Ok(resolved) => resolved,
        Err(e) => return reply_html(&bot, &msg, &e.message("/add_admin_gc <user>")).await,
    };

    let text = if state.store.add_admin(target.id, Roster::GcAdmins).await {
        tracing::info!(
            granted_by = ?sender_id(&msg),
            user_id = target.id,
            chat_id = msg.chat.id.0,
            "Group chat admin granted"
        );
        format!("\u{2705} {} is now a Group Chat Admin.", target.label())
    } else {
        format!("\u{2139} {} is already a Group Chat Admin.", target.label())
    };
    reply_html(&bot, &msg, &text).await
}

pub async fn handle_remove_admin_gc(
    bot: Bot,
    msg: Message,
    state: AppState,
    args: &str,
) -> anyhow::Result<()> {
    if !require_gc_manager(&bot, &msg, &state).await? {
        return Ok(());
    }
    let (target, _) = match resolve_target(&msg, args, &state).await {
        Ok(resolved) => resolved,
        Err(e) => return reply_html(&bot, &msg, &e.message("/remove_admin_gc <user>")).await,
    };

    let text = if state.store.remove_admin(target.id, Roster::GcAdmins).await {
        format!("\u{2705} {} is no longer a Group Chat Admin.", target.label())
    } else {
        format!("\u{2139} {} is not a Group Chat Admin.", target.label())
    };
    reply_html(&bot, &msg, &text).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grantable() {
        assert_eq!(parse_grantable(None).unwrap(), Roster::Admins);
        assert_eq!(parse_grantable(Some("elders")).unwrap(), Roster::Elders);
        assert_eq!(parse_grantable(Some("ch_admin")).unwrap(), Roster::ChAdmins);
        assert!(parse_grantable(Some("owner")).is_err());
        assert!(parse_grantable(Some("mods")).is_err());
    }

    #[test]
    fn test_format_roster() {
        let roster = AdminRoster {
            owner: vec![1],
            elders: vec![2, 3],
            ..AdminRoster::default()
        };
        let mut names = HashMap::new();
        names.insert(2, "Alice & Bob".to_string());

        let text = format_roster(&roster, &names);
        assert!(text.contains("Owner</b> (1)"));
        assert!(text.contains("Elders</b> (2)"));
        assert!(text.contains("Alice &amp; Bob (<code>2</code>)"));
        assert!(text.contains("<code>3</code>"));
        assert!(text.contains("Channel Admins</b> (0)\n  <i>none</i>"));
    }

    #[test]
    fn test_roster_choices() {
        assert_eq!(roster_choices(), "admins, elders, gc_admins, ch_admins");
    }
}
