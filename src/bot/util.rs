use teloxide::prelude::*;
use teloxide::types::{ParseMode, User};
use teloxide::utils::html;

use super::AppState;
use crate::store::{UserProfile, UserRecord};

const MAX_MESSAGE_LENGTH: usize = 4096;

pub fn split_message(text: &str) -> Vec<String> {
    if text.len() <= MAX_MESSAGE_LENGTH {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= MAX_MESSAGE_LENGTH {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = MAX_MESSAGE_LENGTH;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }

        // Prefer a newline, then a space, in the back half of the chunk
        let search_range = &remaining[..limit];
        let mut split_index = search_range.rfind('\n').unwrap_or(0);

        if split_index < limit / 2 {
            split_index = search_range.rfind(' ').unwrap_or(0);
        }

        if split_index < limit / 2 {
            split_index = limit;
        }

        chunks.push(remaining[..split_index].to_string());
        remaining = remaining[split_index..].trim_start();
    }

    chunks
}

/// Sends HTML, split into Telegram-sized chunks.
pub async fn reply_html(bot: &Bot, msg: &Message, text: &str) -> anyhow::Result<()> {
    for chunk in split_message(text) {
        bot.send_message(msg.chat.id, chunk)
            .parse_mode(ParseMode::Html)
            .await?;
    }
    Ok(())
}

pub fn sender_id(msg: &Message) -> Option<i64> {
    msg.from.as_ref().map(|u| u.id.0 as i64)
}

pub fn is_group_chat(msg: &Message) -> bool {
    msg.chat.is_group() || msg.chat.is_supergroup()
}

pub fn profile_of(user: &User) -> UserProfile {
    UserProfile {
        username: user.username.clone(),
        first_name: Some(user.first_name.clone()),
        last_name: user.last_name.clone(),
    }
}

/// First whitespace-separated word and the trimmed remainder.
pub fn split_args(args: &str) -> (Option<&str>, &str) {
    let args = args.trim();
    if args.is_empty() {
        return (None, "");
    }
    match args.split_once(char::is_whitespace) {
        Some((first, rest)) => (Some(first), rest.trim()),
        None => (Some(args), ""),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TargetArg {
    Id(i64),
    Username(String),
}

pub fn parse_target(raw: &str) -> Option<TargetArg> {
    let raw = raw.trim();
    if let Some(name) = raw.strip_prefix('@') {
        let valid = !name.is_empty()
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        return valid.then(|| TargetArg::Username(name.to_string()));
    }
    raw.parse::<i64>().ok().filter(|id| *id > 0).map(TargetArg::Id)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedUser {
    pub id: i64,
    pub display_name: Option<String>,
}

impl ResolvedUser {
    fn from_record(record: &UserRecord) -> Self {
        Self {
            id: record.user_id,
            display_name: record.display_name(),
        }
    }

    /// HTML-safe label, falling back to the numeric id.
    pub fn label(&self) -> String {
        match &self.display_name {
            Some(name) => format!("{} (<code>{}</code>)", html::escape(name), self.id),
            None => format!("<code>{}</code>", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TargetError {
    Missing,
    InvalidFormat(String),
    UnknownUsername(String),
}

impl TargetError {
    pub fn message(&self, usage: &str) -> String {
        match self {
            TargetError::Missing => format!(
                "\u{274c} Reply to a user's message or pass a user ID / @username.\n\nUsage: <code>{}</code>",
                html::escape(usage)
            ),
            TargetError::InvalidFormat(raw) => format!(
                "\u{274c} <code>{}</code> is not a valid user ID or @username.",
                html::escape(raw)
            ),
            TargetError::UnknownUsername(name) => format!(
                "\u{274c} User @{} not found. They must have interacted with the bot first.",
                html::escape(name)
            ),
        }
    }
}

/// Resolves the command target from a replied-to message, a numeric id or a
/// known @username. Returns the target and the remaining arguments.
pub async fn resolve_target<'a>(
    msg: &Message,
    args: &'a str,
    state: &AppState,
) -> Result<(ResolvedUser, &'a str), TargetError> {
    if let Some(user) = msg.reply_to_message().and_then(|m| m.from.as_ref()) {
        let target = ResolvedUser {
            id: user.id.0 as i64,
            display_name: Some(user.full_name()),
        };
        return Ok((target, args.trim()));
    }

    let (first, rest) = split_args(args);
    let first = first.ok_or(TargetError::Missing)?;
    match parse_target(first) {
        Some(TargetArg::Id(id)) => {
            let target = match state.store.get_user(id).await {
                Some(record) => ResolvedUser::from_record(&record),
                None => ResolvedUser {
                    id,
                    display_name: None,
                },
            };
            Ok((target, rest))
        }
        Some(TargetArg::Username(name)) => match state.store.find_user_by_username(&name).await {
            Some(record) => Ok((ResolvedUser::from_record(&record), rest)),
            None => Err(TargetError::UnknownUsername(name)),
        },
        None => Err(TargetError::InvalidFormat(first.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_short_message() {
        let chunks = split_message("hello");
        assert_eq!(chunks, vec!["hello"]);
    }

    #[test]
    fn test_split_at_newline() {
        let text = format!("{}\n{}", "a".repeat(3000), "b".repeat(3000));
        let chunks = split_message(&text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(3000));
        assert_eq!(chunks[1], "b".repeat(3000));
    }

    #[test]
    fn test_split_hard() {
        let text = "a".repeat(5000);
        let chunks = split_message(&text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), MAX_MESSAGE_LENGTH);
    }

    #[test]
    fn test_split_multibyte_boundary() {
        let text = "\u{00e9}".repeat(3000);
        let chunks = split_message(&text);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_split_args() {
        assert_eq!(split_args(""), (None, ""));
        assert_eq!(split_args("  123  "), (Some("123"), ""));
        assert_eq!(split_args("123 spamming the  chat "), (Some("123"), "spamming the  chat"));
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("12345"), Some(TargetArg::Id(12345)));
        assert_eq!(
            parse_target("@Some_User"),
            Some(TargetArg::Username("Some_User".to_string()))
        );
        assert_eq!(parse_target("@"), None);
        assert_eq!(parse_target("-5"), None);
        assert_eq!(parse_target("bob"), None);
    }

    #[test]
    fn test_resolved_user_label() {
        let named = ResolvedUser {
            id: 7,
            display_name: Some("<Eve>".to_string()),
        };
        assert_eq!(named.label(), "&lt;Eve&gt; (<code>7</code>)");
        let bare = ResolvedUser {
            id: 8,
            display_name: None,
        };
        assert_eq!(bare.label(), "<code>8</code>");
    }

    #[test]
    fn test_target_error_messages() {
        let msg = TargetError::UnknownUsername("ghost".to_string()).message("/ban <user>");
        assert!(msg.contains("@ghost"));
        let msg = TargetError::Missing.message("/ban <user>");
        assert!(msg.contains("/ban &lt;user&gt;"));
    }
}
