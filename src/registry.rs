//! Static command table with per-command metadata and runtime disabled flags.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use teloxide::utils::command::BotCommands;

use crate::bot::commands::Command;

static COMMAND_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]{1,32}$").unwrap());

/// Commands that cannot be disabled, otherwise an admin could lock
/// themselves out of `/enable`.
pub const PROTECTED_COMMANDS: [&str; 3] = ["help", "enable", "disable"];

struct CommandSpec {
    name: &'static str,
    usage: &'static str,
    admin_only: bool,
}

const COMMAND_TABLE: &[CommandSpec] = &[
    CommandSpec { name: "start", usage: "/start", admin_only: false },
    CommandSpec { name: "help", usage: "/help [command]", admin_only: false },
    CommandSpec { name: "ping", usage: "/ping", admin_only: false },
    CommandSpec { name: "stats", usage: "/stats", admin_only: true },
    CommandSpec { name: "add_admin", usage: "/add_admin <user> [admins|elders|gc_admins|ch_admins]", admin_only: true },
    CommandSpec { name: "remove_admin", usage: "/remove_admin <user> [admins|elders|gc_admins|ch_admins]", admin_only: true },
    CommandSpec { name: "list_admins", usage: "/list_admins", admin_only: true },
    CommandSpec { name: "add_admin_gc", usage: "/add_admin_gc <user>", admin_only: true },
    CommandSpec { name: "remove_admin_gc", usage: "/remove_admin_gc <user>", admin_only: true },
    CommandSpec { name: "ban", usage: "/ban <user> [reason]", admin_only: true },
    CommandSpec { name: "unban", usage: "/unban <user>", admin_only: true },
    CommandSpec { name: "ban_info", usage: "/ban_info <user>", admin_only: true },
    CommandSpec { name: "kick", usage: "/kick <user> [reason]", admin_only: true },
    CommandSpec { name: "info", usage: "/info [user]", admin_only: false },
    CommandSpec { name: "unsend", usage: "/unsend (reply to a bot message)", admin_only: false },
    CommandSpec { name: "disable", usage: "/disable <command>", admin_only: true },
    CommandSpec { name: "enable", usage: "/enable <command>", admin_only: true },
    CommandSpec { name: "broadcast", usage: "/broadcast <message>", admin_only: true },
    CommandSpec { name: "restart", usage: "/restart", admin_only: true },
    CommandSpec { name: "reload", usage: "/reload", admin_only: true },
];

pub fn is_valid_command_name(name: &str) -> bool {
    COMMAND_NAME_RE.is_match(name)
}

pub fn is_protected(name: &str) -> bool {
    PROTECTED_COMMANDS.contains(&name)
}

/// Normalizes user input like `/Ping@komihub_bot` to `ping`.
pub fn normalize_command_name(raw: &str) -> String {
    let name = raw.trim().trim_start_matches('/');
    let name = name.split('@').next().unwrap_or(name);
    name.to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub name: String,
    pub description: String,
    pub usage: String,
    pub admin_only: bool,
    pub disabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, CommandInfo>,
    generation: u64,
}

impl CommandRegistry {
    /// Builds the table from the command enum, marking `disabled` entries.
    pub fn build(disabled: &[String]) -> Self {
        let mut registry = Self::default();
        registry.populate(disabled);
        registry
    }

    fn populate(&mut self, disabled: &[String]) {
        self.commands.clear();
        for cmd in Command::bot_commands() {
            let name = cmd.command.trim_start_matches('/').to_string();
            let spec = COMMAND_TABLE.iter().find(|s| s.name == name);
            let info = CommandInfo {
                usage: spec
                    .map(|s| s.usage.to_string())
                    .unwrap_or_else(|| format!("/{name}")),
                admin_only: spec.is_some_and(|s| s.admin_only),
                disabled: disabled.iter().any(|d| *d == name),
                description: cmd.description,
                name: name.clone(),
            };
            self.commands.insert(name, info);
        }
    }

    /// Rebuilds the table in place. Returns the number of registered commands.
    pub fn reload(&mut self, disabled: &[String]) -> usize {
        self.populate(disabled);
        self.generation += 1;
        tracing::info!(
            commands = self.commands.len(),
            generation = self.generation,
            "Command registry reloaded"
        );
        self.commands.len()
    }

    pub fn get(&self, name: &str) -> Option<&CommandInfo> {
        self.commands.get(name)
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn set_disabled(&mut self, name: &str, disabled: bool) -> bool {
        match self.commands.get_mut(name) {
            Some(info) => {
                info.disabled = disabled;
                true
            }
            None => false,
        }
    }

    pub fn disabled_count(&self) -> usize {
        self.commands.values().filter(|c| c.disabled).count()
    }

    /// Enabled commands visible to a user with the given privilege.
    pub fn visible(&self, is_admin: bool) -> Vec<&CommandInfo> {
        self.commands
            .values()
            .filter(|c| !c.disabled && (is_admin || !c.admin_only))
            .collect()
    }

    /// Public command menu registered with Telegram.
    pub fn telegram_commands(&self) -> Vec<teloxide::types::BotCommand> {
        self.visible(false)
            .into_iter()
            .map(|c| teloxide::types::BotCommand::new(c.name.clone(), c.description.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, CommandInfo> {
        self.commands.clone()
    }
}
