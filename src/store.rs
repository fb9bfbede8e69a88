use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::KomihubError;
use crate::registry::CommandInfo;
use crate::roles::{AdminRoster, Role};

pub const BOT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The flat JSON files that make up the bot's persistent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    BotStats,
    Users,
    Admins,
    Bans,
    DisabledCommands,
    CommandStats,
}

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::BotStats,
        Collection::Users,
        Collection::Admins,
        Collection::Bans,
        Collection::DisabledCommands,
        Collection::CommandStats,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::BotStats => "bot_stats",
            Collection::Users => "users",
            Collection::Admins => "admins",
            Collection::Bans => "bans",
            Collection::DisabledCommands => "disabled_commands",
            Collection::CommandStats => "command_stats",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub joined_at: f64,
    #[serde(default)]
    pub last_seen: f64,
}

impl UserRecord {
    pub fn display_name(&self) -> Option<String> {
        let mut name = self.first_name.clone().unwrap_or_default();
        if let Some(last) = self.last_name.as_deref().filter(|l| !l.trim().is_empty()) {
            if !name.is_empty() {
                name.push(' ');
            }
            name.push_str(last);
        }
        if name.trim().is_empty() {
            self.username.as_ref().map(|u| format!("@{u}"))
        } else {
            Some(name)
        }
    }
}

/// Identity fields refreshed from every incoming update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserProfile {
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanRecord {
    pub user_id: i64,
    pub banned_at: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub banned_by: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandUsage {
    pub total_uses: u64,
    pub unique_users: u64,
    pub last_used: f64,
    #[serde(default)]
    pub users: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotStats {
    pub bot_name: String,
    pub started_at: f64,
    pub total_commands: u64,
    pub total_users: u64,
    pub online_since: f64,
    pub version: String,
    pub last_updated: Option<f64>,
}

impl Default for BotStats {
    fn default() -> Self {
        Self {
            bot_name: String::new(),
            started_at: 0.0,
            total_commands: 0,
            total_users: 0,
            online_since: 0.0,
            version: BOT_VERSION.to_string(),
            last_updated: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotSettings {
    pub language: String,
    pub maintenance_mode: bool,
    pub auto_backup: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotFeatures {
    pub hot_reload: bool,
    pub user_tracking: bool,
    pub broadcast_system: bool,
    pub admin_management: bool,
}

/// Per-bot descriptor written to `bots/<username>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotProfile {
    pub bot_username: String,
    pub bot_name: String,
    pub owner_id: i64,
    pub created_at: f64,
    pub commands: BTreeMap<String, CommandInfo>,
    pub settings: BotSettings,
    pub features: BotFeatures,
}

pub type Users = BTreeMap<String, UserRecord>;
pub type Bans = BTreeMap<String, BanRecord>;
pub type CommandStats = BTreeMap<String, CommandUsage>;
pub type DisabledCommands = Vec<String>;

pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

pub fn format_ts(ts: f64) -> String {
    let secs = ts.trunc() as i64;
    let nanos = (ts.fract() * 1e9) as u32;
    chrono::DateTime::from_timestamp(secs, nanos)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".backup");
    PathBuf::from(name)
}

/// Moves an undecodable collection aside so the next write cannot discard it.
async fn quarantine(path: &Path, label: &str) -> std::io::Result<()> {
    let backup = backup_path(path);
    match tokio::fs::rename(path, &backup).await {
        Ok(()) => {
            tracing::warn!(
                collection = label,
                backup = %backup.display(),
                "Backed up corrupted collection"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(collection = label, error = %e, "Failed to back up corrupted collection");
            Err(e)
        }
    }
}

/// Reads a collection file. Missing or blank files yield the default, and so
/// does a file that is not valid UTF-8 JSON once it has been moved to
/// `<file>.backup`. Any other I/O failure is returned so callers never write
/// over data they could not read.
async fn read_json<T: DeserializeOwned + Default>(path: &Path, label: &str) -> std::io::Result<T> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => {
            tracing::error!(collection = label, error = %e, "Failed to read collection");
            return Err(e);
        }
    };

    let content = match String::from_utf8(bytes) {
        Ok(content) => content,
        Err(e) => {
            tracing::error!(collection = label, error = %e, "Collection file is not valid UTF-8");
            quarantine(path, label).await?;
            return Ok(T::default());
        }
    };

    if content.trim().is_empty() {
        return Ok(T::default());
    }

    match serde_json::from_str(&content) {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::error!(collection = label, error = %e, "Corrupt collection file");
            quarantine(path, label).await?;
            Ok(T::default())
        }
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), KomihubError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Whole-file JSON store. Every mutation is load-mutate-save under a single
/// in-process writer lock; it is not safe to share a data directory between
/// processes.
pub struct JsonStore {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStore {
    /// Opens the data directory, writing defaults for any missing collection.
    /// The owner roster is seeded only when `admins.json` does not exist yet.
    pub async fn open(
        data_dir: impl Into<PathBuf>,
        owner_id: i64,
        bot_name: &str,
    ) -> Result<Self, KomihubError> {
        let data_dir = data_dir.into();
        if tokio::fs::metadata(&data_dir).await.is_err() {
            tokio::fs::create_dir_all(&data_dir).await?;
            tracing::info!(data_dir = %data_dir.display(), "Created data directory");
        }

        let store = Self {
            data_dir,
            write_lock: Mutex::new(()),
        };
        store.init_defaults(owner_id, bot_name).await?;
        Ok(store)
    }

    async fn init_defaults(&self, owner_id: i64, bot_name: &str) -> Result<(), KomihubError> {
        for collection in Collection::ALL {
            let path = self.path(collection);
            if tokio::fs::metadata(&path).await.is_ok() {
                continue;
            }
            match collection {
                Collection::BotStats => {
                    let now = now_ts();
                    let stats = BotStats {
                        bot_name: bot_name.to_string(),
                        started_at: now,
                        online_since: now,
                        ..BotStats::default()
                    };
                    write_json(&path, &stats).await?;
                }
                Collection::Admins => {
                    let roster = AdminRoster {
                        owner: vec![owner_id],
                        ..AdminRoster::default()
                    };
                    write_json(&path, &roster).await?;
                    tracing::info!(owner_id = owner_id, "Seeded owner roster");
                }
                Collection::DisabledCommands => {
                    write_json(&path, &DisabledCommands::new()).await?;
                }
                Collection::Users | Collection::Bans | Collection::CommandStats => {
                    write_json(&path, &serde_json::Map::new()).await?;
                }
            }
        }
        Ok(())
    }

    pub fn path(&self, collection: Collection) -> PathBuf {
        self.data_dir.join(collection.file_name())
    }

    pub fn profile_path(&self, bot_username: &str) -> PathBuf {
        self.data_dir.join("bots").join(format!("{bot_username}.json"))
    }

    /// Returns the collection's content, or the empty default when the file is
    /// missing, empty, corrupt or unreadable. A corrupt file is moved to
    /// `<file>.backup`.
    pub async fn load<T: DeserializeOwned + Default>(&self, collection: Collection) -> T {
        read_json(&self.path(collection), collection.name())
            .await
            .unwrap_or_default()
    }

    /// Load-mutate-save under the writer lock. Returns the closure's result
    /// and whether the save succeeded. Nothing is written when `f` reports no
    /// change by returning `(_, false)`.
    ///
    /// When the file exists but cannot be read, `f` runs against the empty
    /// default so the caller still gets a result, the file is left alone and
    /// the save is reported as failed.
    pub async fn update<T, R, F>(&self, collection: Collection, f: F) -> (R, bool)
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> (R, bool),
    {
        let _guard = self.write_lock.lock().await;
        let path = self.path(collection);
        let (mut value, readable) = match read_json::<T>(&path, collection.name()).await {
            Ok(value) => (value, true),
            Err(_) => (T::default(), false),
        };
        let (result, changed) = f(&mut value);
        if !readable {
            tracing::warn!(collection = collection.name(), "Skipping write to unreadable collection");
            return (result, false);
        }
        if !changed {
            return (result, true);
        }
        match write_json(&path, &value).await {
            Ok(()) => (result, true),
            Err(e) => {
                tracing::error!(collection = collection.name(), error = %e, "Failed to save collection");
                (result, false)
            }
        }
    }

    // Users

    /// Creates the record on first sight, otherwise refreshes names and
    /// `last_seen`. Returns `true` when a new record was created and saved.
    pub async fn touch_user(&self, user_id: i64, profile: &UserProfile) -> bool {
        let role = self.resolve_role(user_id).await;
        let now = now_ts();
        let (created, saved) = self
            .update(Collection::Users, |users: &mut Users| {
                let key = user_id.to_string();
                match users.get_mut(&key) {
                    Some(record) => {
                        record.username = profile.username.clone();
                        record.first_name = profile.first_name.clone();
                        record.last_name = profile.last_name.clone();
                        record.last_seen = now;
                        (false, true)
                    }
                    None => {
                        users.insert(
                            key,
                            UserRecord {
                                user_id,
                                username: profile.username.clone(),
                                first_name: profile.first_name.clone(),
                                last_name: profile.last_name.clone(),
                                role,
                                joined_at: now,
                                last_seen: now,
                            },
                        );
                        (true, true)
                    }
                }
            })
            .await;

        if !created || !saved {
            return false;
        }
        let total = self.load::<Users>(Collection::Users).await.len() as u64;
        self.update_bot_stats(|stats| stats.total_users = total).await;
        tracing::debug!(user_id = user_id, "Tracked new user");
        true
    }

    pub async fn get_user(&self, user_id: i64) -> Option<UserRecord> {
        self.load::<Users>(Collection::Users)
            .await
            .remove(&user_id.to_string())
    }

    pub async fn find_user_by_username(&self, username: &str) -> Option<UserRecord> {
        let wanted = username.trim_start_matches('@');
        self.load::<Users>(Collection::Users)
            .await
            .into_values()
            .find(|u| {
                u.username
                    .as_deref()
                    .is_some_and(|name| name.eq_ignore_ascii_case(wanted))
            })
    }

    pub async fn user_ids(&self) -> Vec<i64> {
        self.load::<Users>(Collection::Users)
            .await
            .values()
            .map(|u| u.user_id)
            .collect()
    }

    pub async fn get_user_role(&self, user_id: i64) -> Role {
        self.get_user(user_id)
            .await
            .map(|u| u.role)
            .unwrap_or_default()
    }

    /// Sets the role tag, creating a placeholder record for users the bot has
    /// never seen so the tag is never lost.
    pub async fn set_user_role(&self, user_id: i64, role: Role) -> bool {
        let now = now_ts();
        let (_, saved) = self
            .update(Collection::Users, |users: &mut Users| {
                let record = users.entry(user_id.to_string()).or_insert_with(|| UserRecord {
                    user_id,
                    username: None,
                    first_name: None,
                    last_name: None,
                    role: Role::User,
                    joined_at: now,
                    last_seen: now,
                });
                record.role = role;
                record.last_seen = now;
                ((), true)
            })
            .await;
        saved
    }

    // Bans

    pub async fn ban_user(&self, user_id: i64, reason: &str, banned_by: Option<i64>) -> bool {
        let record = BanRecord {
            user_id,
            banned_at: now_ts(),
            reason: reason.to_string(),
            banned_by,
        };
        let (_, saved) = self
            .update(Collection::Bans, |bans: &mut Bans| {
                bans.insert(user_id.to_string(), record);
                ((), true)
            })
            .await;
        saved
    }

    /// Returns `true` when the user was banned before the call.
    pub async fn unban_user(&self, user_id: i64) -> bool {
        let (removed, saved) = self
            .update(Collection::Bans, |bans: &mut Bans| {
                let removed = bans.remove(&user_id.to_string()).is_some();
                (removed, removed)
            })
            .await;
        removed && saved
    }

    pub async fn is_banned(&self, user_id: i64) -> bool {
        self.load::<Bans>(Collection::Bans)
            .await
            .contains_key(&user_id.to_string())
    }

    pub async fn get_ban_info(&self, user_id: i64) -> Option<BanRecord> {
        self.load::<Bans>(Collection::Bans)
            .await
            .remove(&user_id.to_string())
    }

    pub async fn ban_count(&self) -> usize {
        self.load::<Bans>(Collection::Bans).await.len()
    }

    // Disabled commands

    pub async fn disable_command(&self, name: &str) -> bool {
        let (added, saved) = self
            .update(Collection::DisabledCommands, |disabled: &mut DisabledCommands| {
                if disabled.iter().any(|c| c == name) {
                    (false, false)
                } else {
                    disabled.push(name.to_string());
                    (true, true)
                }
            })
            .await;
        added && saved
    }

    pub async fn enable_command(&self, name: &str) -> bool {
        let (removed, saved) = self
            .update(Collection::DisabledCommands, |disabled: &mut DisabledCommands| {
                let before = disabled.len();
                disabled.retain(|c| c != name);
                let removed = disabled.len() != before;
                (removed, removed)
            })
            .await;
        removed && saved
    }

    pub async fn is_command_disabled(&self, name: &str) -> bool {
        self.load::<DisabledCommands>(Collection::DisabledCommands)
            .await
            .iter()
            .any(|c| c == name)
    }

    pub async fn disabled_commands(&self) -> DisabledCommands {
        self.load(Collection::DisabledCommands).await
    }

    // Command statistics

    pub async fn increment_command_usage(&self, name: &str, user_id: i64) -> bool {
        let now = now_ts();
        let (_, saved) = self
            .update(Collection::CommandStats, |stats: &mut CommandStats| {
                let usage = stats.entry(name.to_string()).or_default();
                usage.total_uses += 1;
                usage.last_used = now;
                let count = usage.users.entry(user_id.to_string()).or_insert(0);
                if *count == 0 {
                    usage.unique_users += 1;
                }
                *count += 1;
                ((), true)
            })
            .await;
        self.update_bot_stats(|stats| stats.total_commands += 1).await;
        saved
    }

    pub async fn command_usage(&self, name: &str) -> Option<CommandUsage> {
        self.load::<CommandStats>(Collection::CommandStats)
            .await
            .remove(name)
    }

    pub async fn command_stats(&self) -> CommandStats {
        self.load(Collection::CommandStats).await
    }

    // Bot stats

    pub async fn update_bot_stats<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut BotStats),
    {
        let now = now_ts();
        let (_, saved) = self
            .update(Collection::BotStats, |stats: &mut BotStats| {
                f(stats);
                stats.last_updated = Some(now);
                ((), true)
            })
            .await;
        saved
    }

    pub async fn bot_stats(&self) -> BotStats {
        self.load(Collection::BotStats).await
    }

    // Bot profile

    pub async fn load_bot_profile(&self, bot_username: &str) -> Option<BotProfile> {
        let path = self.profile_path(bot_username);
        if tokio::fs::metadata(&path).await.is_err() {
            return None;
        }
        read_json::<Option<BotProfile>>(&path, "bot_profile")
            .await
            .ok()
            .flatten()
    }

    pub async fn save_bot_profile(&self, profile: &BotProfile) -> bool {
        let _guard = self.write_lock.lock().await;
        match write_json(&self.profile_path(&profile.bot_username), profile).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Failed to save bot profile");
                false
            }
        }
    }

    pub async fn set_profile_command_disabled(
        &self,
        bot_username: &str,
        name: &str,
        disabled: bool,
    ) -> bool {
        let Some(mut profile) = self.load_bot_profile(bot_username).await else {
            return false;
        };
        match profile.commands.get_mut(name) {
            Some(info) => info.disabled = disabled,
            None => return false,
        }
        self.save_bot_profile(&profile).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store(dir: &Path) -> JsonStore {
        JsonStore::open(dir, 42, "Test Bot").await.unwrap()
    }

    fn profile(name: &str) -> UserProfile {
        UserProfile {
            username: Some(name.to_lowercase()),
            first_name: Some(name.to_string()),
            last_name: None,
        }
    }

    #[tokio::test]
    async fn test_open_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        for collection in Collection::ALL {
            assert!(store.path(collection).exists(), "{} missing", collection.name());
        }

        let roster: AdminRoster = store.load(Collection::Admins).await;
        assert_eq!(roster.owner, vec![42]);
        let stats = store.bot_stats().await;
        assert_eq!(stats.bot_name, "Test Bot");
        assert_eq!(stats.total_users, 0);
    }

    #[tokio::test]
    async fn test_open_does_not_reseed_owner() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path()).await;
            let (_, saved) = store
                .update(Collection::Admins, |roster: &mut AdminRoster| {
                    roster.owner = vec![7];
                    ((), true)
                })
                .await;
            assert!(saved);
        }
        let store = JsonStore::open(dir.path(), 99, "Test Bot").await.unwrap();
        let roster: AdminRoster = store.load(Collection::Admins).await;
        assert_eq!(roster.owner, vec![7]);
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let mut bans = Bans::new();
        bans.insert(
            "5".to_string(),
            BanRecord {
                user_id: 5,
                banned_at: 1700000000.5,
                reason: "spam".to_string(),
                banned_by: Some(42),
            },
        );
        let expected = bans.clone();
        let (_, saved) = store
            .update(Collection::Bans, move |current: &mut Bans| {
                *current = bans;
                ((), true)
            })
            .await;
        assert!(saved);
        let loaded: Bans = store.load(Collection::Bans).await;
        assert_eq!(loaded, expected);
    }

    #[tokio::test]
    async fn test_load_missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        std::fs::remove_file(store.path(Collection::Users)).unwrap();
        let users: Users = store.load(Collection::Users).await;
        assert!(users.is_empty());

        std::fs::write(store.path(Collection::Bans), "  \n").unwrap();
        let bans: Bans = store.load(Collection::Bans).await;
        assert!(bans.is_empty());
        assert!(!backup_path(&store.path(Collection::Bans)).exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let path = store.path(Collection::Users);
        std::fs::write(&path, "{\"1\": {broken").unwrap();

        let users: Users = store.load(Collection::Users).await;
        assert!(users.is_empty());

        let backup = backup_path(&path);
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), "{\"1\": {broken");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_backed_up_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let path = store.path(Collection::Users);
        let original = b"{\"7\": {\"user_id\": 7, \"first_name\": \"Ann\xff\"}}".to_vec();
        std::fs::write(&path, &original).unwrap();

        assert!(store.touch_user(8, &profile("Bob")).await);

        let backup = backup_path(&path);
        assert_eq!(std::fs::read(&backup).unwrap(), original);
        let users: Users = store.load(Collection::Users).await;
        assert!(users.contains_key("8"));
        assert!(!users.contains_key("7"));
    }

    #[tokio::test]
    async fn test_unreadable_collection_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        // A directory in place of the file fails the read with something
        // other than NotFound.
        let path = store.path(Collection::Bans);
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "x").unwrap();

        assert!(!store.ban_user(7, "spam", None).await);
        assert!(path.join("keep").exists());
        assert!(!backup_path(&path).exists());
        assert!(!store.is_banned(7).await);
    }

    #[tokio::test]
    async fn test_write_failure_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        // A directory at the temp path makes the write fail.
        let path = store.path(Collection::DisabledCommands);
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        std::fs::create_dir(PathBuf::from(tmp)).unwrap();

        assert!(!store.disable_command("ping").await);
        assert!(!store.is_command_disabled("ping").await);
    }

    #[tokio::test]
    async fn test_touch_user_creates_then_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        assert!(store.touch_user(100, &profile("Alice")).await);
        let first = store.get_user(100).await.unwrap();
        assert_eq!(first.role, Role::User);
        assert_eq!(first.first_name.as_deref(), Some("Alice"));

        assert!(store.set_user_role(100, Role::Elder).await);
        assert!(!store.touch_user(100, &profile("Alicia")).await);
        let second = store.get_user(100).await.unwrap();
        assert_eq!(second.role, Role::Elder);
        assert_eq!(second.first_name.as_deref(), Some("Alicia"));
        assert_eq!(second.joined_at, first.joined_at);
        assert!(second.last_seen >= first.last_seen);

        assert_eq!(store.bot_stats().await.total_users, 1);
    }

    #[tokio::test]
    async fn test_touch_user_picks_up_roster_role() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.touch_user(42, &profile("Owner")).await;
        assert_eq!(store.get_user_role(42).await, Role::Owner);
    }

    #[tokio::test]
    async fn test_find_user_by_username() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.touch_user(100, &profile("Alice")).await;

        let found = store.find_user_by_username("@ALICE").await.unwrap();
        assert_eq!(found.user_id, 100);
        assert!(store.find_user_by_username("bob").await.is_none());
    }

    #[tokio::test]
    async fn test_ban_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        assert!(!store.is_banned(7).await);
        assert!(store.ban_user(7, "flooding", Some(42)).await);
        assert!(store.is_banned(7).await);

        let info = store.get_ban_info(7).await.unwrap();
        assert_eq!(info.reason, "flooding");
        assert_eq!(info.banned_by, Some(42));

        assert!(store.unban_user(7).await);
        assert!(!store.is_banned(7).await);
        assert!(!store.unban_user(7).await);
    }

    #[tokio::test]
    async fn test_disable_enable_command() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        assert!(store.disable_command("ping").await);
        assert!(!store.disable_command("ping").await);
        assert!(store.is_command_disabled("ping").await);
        assert_eq!(store.disabled_commands().await, vec!["ping".to_string()]);

        assert!(store.enable_command("ping").await);
        assert!(!store.enable_command("ping").await);
        assert!(!store.is_command_disabled("ping").await);
    }

    #[tokio::test]
    async fn test_increment_command_usage() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        store.increment_command_usage("help", 1).await;
        store.increment_command_usage("help", 1).await;
        store.increment_command_usage("help", 2).await;

        let usage = store.command_usage("help").await.unwrap();
        assert_eq!(usage.total_uses, 3);
        assert_eq!(usage.unique_users, 2);
        assert_eq!(usage.users.get("1"), Some(&2));
        assert!(usage.last_used > 0.0);
        assert_eq!(store.bot_stats().await.total_commands, 3);
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(open_store(dir.path()).await);

        let mut handles = Vec::new();
        for user in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment_command_usage("ping", user).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let usage = store.command_usage("ping").await.unwrap();
        assert_eq!(usage.total_uses, 10);
        assert_eq!(usage.unique_users, 10);
    }

    #[tokio::test]
    async fn test_bot_profile_disabled_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        let mut commands = BTreeMap::new();
        commands.insert(
            "ping".to_string(),
            CommandInfo {
                name: "ping".to_string(),
                description: "Check bot response time".to_string(),
                usage: "/ping".to_string(),
                admin_only: false,
                disabled: false,
            },
        );
        let profile = BotProfile {
            bot_username: "komihub_bot".to_string(),
            bot_name: "Test Bot".to_string(),
            owner_id: 42,
            created_at: now_ts(),
            commands,
            settings: BotSettings {
                language: "en".to_string(),
                maintenance_mode: false,
                auto_backup: true,
            },
            features: BotFeatures {
                hot_reload: true,
                user_tracking: true,
                broadcast_system: true,
                admin_management: true,
            },
        };
        assert!(store.save_bot_profile(&profile).await);
        assert!(store.set_profile_command_disabled("komihub_bot", "ping", true).await);
        assert!(!store.set_profile_command_disabled("komihub_bot", "nope", true).await);

        let loaded = store.load_bot_profile("komihub_bot").await.unwrap();
        assert!(loaded.commands["ping"].disabled);
    }

    #[test]
    fn test_format_ts() {
        assert_eq!(format_ts(0.0), "1970-01-01 00:00:00 UTC");
        assert_eq!(format_ts(86400.9), "1970-01-02 00:00:00 UTC");
    }

    #[test]
    fn test_display_name() {
        let mut record = UserRecord {
            user_id: 1,
            username: Some("alice".to_string()),
            first_name: Some("Alice".to_string()),
            last_name: Some("Smith".to_string()),
            role: Role::User,
            joined_at: 0.0,
            last_seen: 0.0,
        };
        assert_eq!(record.display_name().as_deref(), Some("Alice Smith"));
        record.first_name = None;
        record.last_name = None;
        assert_eq!(record.display_name().as_deref(), Some("@alice"));
        record.username = None;
        assert_eq!(record.display_name(), None);
    }
}
