//! Layered admin roster and the role tag derived from it.
//!
//! Priority runs `owner > admins > elders > gc_admins > ch_admins`. Membership
//! in several rosters at once is tolerated; the role tag always reflects the
//! highest roster the user is still listed in.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::store::{Collection, JsonStore};

/// One of the five named lists in `admins.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Roster {
    Owner,
    Admins,
    Elders,
    GcAdmins,
    ChAdmins,
}

/// Derived label stored on a user record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Owner,
    Admin,
    Elder,
    GcAdmin,
    ChAdmin,
}

impl Roster {
    /// Resolution order, highest first.
    pub const PRIORITY: [Roster; 5] = [
        Roster::Owner,
        Roster::Admins,
        Roster::Elders,
        Roster::GcAdmins,
        Roster::ChAdmins,
    ];

    /// Rosters that can be granted through `/add_admin`.
    pub const GRANTABLE: [Roster; 4] = [
        Roster::Admins,
        Roster::Elders,
        Roster::GcAdmins,
        Roster::ChAdmins,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Roster::Owner => "owner",
            Roster::Admins => "admins",
            Roster::Elders => "elders",
            Roster::GcAdmins => "gc_admins",
            Roster::ChAdmins => "ch_admins",
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Roster::Owner => Role::Owner,
            Roster::Admins => Role::Admin,
            Roster::Elders => Role::Elder,
            Roster::GcAdmins => Role::GcAdmin,
            Roster::ChAdmins => Role::ChAdmin,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Roster::Owner => "Owner",
            Roster::Admins => "Admin",
            Roster::Elders => "Elder",
            Roster::GcAdmins => "Group Chat Admin",
            Roster::ChAdmins => "Channel Admin",
        }
    }

    pub fn heading(&self) -> &'static str {
        match self {
            Roster::Owner => "\u{1f451} Owner",
            Roster::Admins => "\u{26a1} Admins",
            Roster::Elders => "\u{1f9d9} Elders",
            Roster::GcAdmins => "\u{1f465} Group Chat Admins",
            Roster::ChAdmins => "\u{1f4e2} Channel Admins",
        }
    }
}

impl fmt::Display for Roster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Roster {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "owner" => Ok(Roster::Owner),
            "admins" | "admin" => Ok(Roster::Admins),
            "elders" | "elder" => Ok(Roster::Elders),
            "gc_admins" | "gc_admin" => Ok(Roster::GcAdmins),
            "ch_admins" | "ch_admin" => Ok(Roster::ChAdmins),
            other => Err(format!("unknown admin type: {other}")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Elder => "elder",
            Role::GcAdmin => "gc_admin",
            Role::ChAdmin => "ch_admin",
        };
        f.write_str(s)
    }
}

/// Content of `admins.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminRoster {
    pub owner: Vec<i64>,
    pub admins: Vec<i64>,
    pub elders: Vec<i64>,
    pub gc_admins: Vec<i64>,
    pub ch_admins: Vec<i64>,
}

impl AdminRoster {
    pub fn list(&self, roster: Roster) -> &Vec<i64> {
        match roster {
            Roster::Owner => &self.owner,
            Roster::Admins => &self.admins,
            Roster::Elders => &self.elders,
            Roster::GcAdmins => &self.gc_admins,
            Roster::ChAdmins => &self.ch_admins,
        }
    }

    pub fn list_mut(&mut self, roster: Roster) -> &mut Vec<i64> {
        match roster {
            Roster::Owner => &mut self.owner,
            Roster::Admins => &mut self.admins,
            Roster::Elders => &mut self.elders,
            Roster::GcAdmins => &mut self.gc_admins,
            Roster::ChAdmins => &mut self.ch_admins,
        }
    }

    pub fn contains(&self, user_id: i64, roster: Option<Roster>) -> bool {
        match roster {
            Some(r) => self.list(r).contains(&user_id),
            None => Roster::PRIORITY
                .iter()
                .any(|r| self.list(*r).contains(&user_id)),
        }
    }

    /// Highest roster the user belongs to, or [`Role::User`].
    pub fn resolve_role(&self, user_id: i64) -> Role {
        Roster::PRIORITY
            .iter()
            .find(|r| self.list(**r).contains(&user_id))
            .map(|r| r.role())
            .unwrap_or(Role::User)
    }

    pub fn insert(&mut self, user_id: i64, roster: Roster) -> bool {
        let list = self.list_mut(roster);
        if list.contains(&user_id) {
            return false;
        }
        list.push(user_id);
        true
    }

    pub fn remove(&mut self, user_id: i64, roster: Roster) -> bool {
        let list = self.list_mut(roster);
        let before = list.len();
        list.retain(|id| *id != user_id);
        list.len() != before
    }
}

impl JsonStore {
    pub async fn admin_roster(&self) -> AdminRoster {
        self.load(Collection::Admins).await
    }

    /// Membership in `roster`, or in any roster when `None`.
    pub async fn is_admin(&self, user_id: i64, roster: Option<Roster>) -> bool {
        self.admin_roster().await.contains(user_id, roster)
    }

    pub async fn resolve_role(&self, user_id: i64) -> Role {
        self.admin_roster().await.resolve_role(user_id)
    }

    /// Appends to the roster and syncs the role tag. Returns `false` when the
    /// user was already listed or the roster could not be saved.
    pub async fn add_admin(&self, user_id: i64, roster: Roster) -> bool {
        let (added, saved) = self
            .update(Collection::Admins, |admins: &mut AdminRoster| {
                let added = admins.insert(user_id, roster);
                (added, added)
            })
            .await;
        if !added || !saved {
            return false;
        }
        self.set_user_role(user_id, roster.role()).await;
        tracing::info!(user_id = user_id, roster = %roster, "Added admin");
        true
    }

    /// Removes from the roster and re-resolves the role tag by priority.
    pub async fn remove_admin(&self, user_id: i64, roster: Roster) -> bool {
        let (removed, saved) = self
            .update(Collection::Admins, |admins: &mut AdminRoster| {
                let removed = admins.remove(user_id, roster);
                (removed, removed)
            })
            .await;
        if !removed || !saved {
            return false;
        }
        let role = self.resolve_role(user_id).await;
        self.set_user_role(user_id, role).await;
        tracing::info!(user_id = user_id, roster = %roster, role = %role, "Removed admin");
        true
    }
}
