use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::KomihubError;

#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_token: String,
    pub bot_name: String,
    pub owner_id: i64,
    pub owner_name: String,
    pub data_dir: PathBuf,
    pub mode: RunMode,
    pub webhook_url: Option<reqwest::Url>,
    pub host: String,
    pub port: u16,
    /// Executable file names (or full paths) matched against `argv[0]`.
    pub process_patterns: Vec<String>,
    pub restart_health_secs: u64,
    pub kill_timeout_secs: u64,
    pub port_wait_secs: u64,
    pub rate_limit: RateLimitConfig,
    pub maintenance_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunMode {
    Polling,
    Webhook,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_secs: u64,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Polling => write!(f, "polling"),
            RunMode::Webhook => write!(f, "webhook"),
        }
    }
}

impl RunMode {
    fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "webhook" | "web" => RunMode::Webhook,
            _ => RunMode::Polling,
        }
    }
}

impl Config {
    pub fn health_window(&self) -> Duration {
        Duration::from_secs(self.restart_health_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    pub fn port_wait(&self) -> Duration {
        Duration::from_secs(self.port_wait_secs)
    }

    pub fn is_owner(&self, user_id: i64) -> bool {
        self.owner_id == user_id
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|s| s.parse().ok())
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).and_then(|s| parse_bool(&s))
}

fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix('~') {
        Some(stripped) => {
            let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
            home.join(stripped.trim_start_matches('/'))
        }
        None => PathBuf::from(raw),
    }
}

/// Executable names whose processes the orphan sweep treats as old instances.
fn default_process_patterns() -> Vec<String> {
    crate::pid::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|n| n.to_string_lossy().to_string()))
        .filter(|name| !name.is_empty())
        .map(|name| vec![name])
        .unwrap_or_else(|| vec!["komihub".to_string()])
}

fn split_patterns(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

pub fn load_config() -> Result<Config, KomihubError> {
    dotenvy::dotenv().ok();

    let telegram_token = env_string("BOT_TOKEN")
        .or_else(|| env_string("TELEGRAM_BOT_TOKEN"))
        .unwrap_or_default();

    if telegram_token.is_empty() {
        return Err(KomihubError::Config(
            "BOT_TOKEN is required. Set it in .env file.".into(),
        ));
    }

    let owner_id = match env_string("ADMIN_ID") {
        Some(raw) => raw.parse::<i64>().map_err(|_| {
            KomihubError::Config(format!("ADMIN_ID must be a numeric Telegram id, got {raw:?}"))
        })?,
        None => {
            return Err(KomihubError::Config(
                "ADMIN_ID is required. Set it in .env file.".into(),
            ))
        }
    };

    let mode = env_string("BOT_MODE")
        .map(|s| RunMode::from_str(&s))
        .unwrap_or(RunMode::Polling);

    let webhook_url = match env_string("WEBHOOK_URL") {
        Some(raw) => Some(reqwest::Url::parse(&raw).map_err(|e| {
            KomihubError::Config(format!("WEBHOOK_URL is not a valid URL: {e}"))
        })?),
        None => None,
    };

    if mode == RunMode::Webhook && webhook_url.is_none() {
        return Err(KomihubError::Config(
            "WEBHOOK_URL is required when BOT_MODE=webhook".into(),
        ));
    }

    let process_patterns = env_string("PROCESS_PATTERNS")
        .map(|s| split_patterns(&s))
        .filter(|p| !p.is_empty())
        .unwrap_or_else(default_process_patterns);

    let rate_limit = RateLimitConfig {
        enabled: env_bool("RATE_LIMIT_ENABLED").unwrap_or(true),
        max_requests: env_parse("RATE_LIMIT_MAX_REQUESTS").unwrap_or(100),
        window_secs: env_parse("RATE_LIMIT_WINDOW").unwrap_or(60),
    };

    Ok(Config {
        telegram_token,
        bot_name: env_string("BOT_NAME").unwrap_or_else(|| "KOMIHUB BOT".to_string()),
        owner_id,
        owner_name: env_string("ADMIN_NAME").unwrap_or_else(|| "Admin".to_string()),
        data_dir: env_string("DATA_DIR")
            .map(|s| expand_home(&s))
            .unwrap_or_else(|| PathBuf::from("data")),
        mode,
        webhook_url,
        host: env_string("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
        port: env_parse("PORT").unwrap_or(8000),
        process_patterns,
        restart_health_secs: env_parse("RESTART_HEALTH_SECS").unwrap_or(15),
        kill_timeout_secs: env_parse("KILL_TIMEOUT_SECS").unwrap_or(5),
        port_wait_secs: env_parse("PORT_WAIT_SECS").unwrap_or(10),
        rate_limit,
        maintenance_mode: env_bool("MAINTENANCE_MODE").unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode_display() {
        assert_eq!(RunMode::Polling.to_string(), "polling");
        assert_eq!(RunMode::Webhook.to_string(), "webhook");
    }

    #[test]
    fn test_run_mode_from_str() {
        assert_eq!(RunMode::from_str("webhook"), RunMode::Webhook);
        assert_eq!(RunMode::from_str("WEBHOOK"), RunMode::Webhook);
        assert_eq!(RunMode::from_str("polling"), RunMode::Polling);
        assert_eq!(RunMode::from_str("whatever"), RunMode::Polling);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_split_patterns() {
        assert_eq!(
            split_patterns(" komihub , komihub-server,,"),
            vec!["komihub".to_string(), "komihub-server".to_string()]
        );
        assert!(split_patterns(" , ").is_empty());
    }

    #[test]
    fn test_expand_home_absolute() {
        assert_eq!(expand_home("/var/lib/komihub"), PathBuf::from("/var/lib/komihub"));
    }

    #[test]
    fn test_default_process_patterns_not_empty() {
        let patterns = default_process_patterns();
        assert_eq!(patterns.len(), 1);
        assert!(!patterns[0].is_empty());
    }

    #[test]
    fn test_load_config_missing_token() {
        std::env::remove_var("BOT_TOKEN");
        std::env::remove_var("TELEGRAM_BOT_TOKEN");
        let result = load_config();
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("BOT_TOKEN"));
    }
}
