use super::ConfigError;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

const DEFAULT_CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub roles: RolesConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct DiscordConfig {
    #[serde(default = "default_token")]
    pub token: SecretString,
    #[serde(default)]
    pub alert_channel_id: u64,
    #[serde(default)]
    pub leaderboard_channel_id: u64,
    #[serde(default)]
    pub snapshot_channel_id: Option<u64>,
    #[serde(default)]
    pub incident_channel_id: Option<u64>,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: default_token(),
            alert_channel_id: 0,
            leaderboard_channel_id: 0,
            snapshot_channel_id: None,
            incident_channel_id: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RolesConfig {
    /// Pinged by the team 1 button.
    #[serde(default)]
    pub defense: u64,
    /// Pinged by the team 2 button.
    #[serde(default)]
    pub defense_2: Option<u64>,
    #[serde(default)]
    pub test: Option<u64>,
    #[serde(default)]
    pub admin: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EmojiConfig {
    #[serde(default = "default_join_emoji")]
    pub join: String,
    #[serde(default = "default_victory_emoji")]
    pub victory: String,
    #[serde(default = "default_defeat_emoji")]
    pub defeat: String,
    #[serde(default = "default_incomplete_emoji")]
    pub incomplete: String,
}

impl Default for EmojiConfig {
    fn default() -> Self {
        Self {
            join: default_join_emoji(),
            victory: default_victory_emoji(),
            defeat: default_defeat_emoji(),
            incomplete: default_incomplete_emoji(),
        }
    }
}

impl EmojiConfig {
    /// Reactions the bot seeds on every new alert, in display order.
    pub fn all(&self) -> [&str; 4] {
        [
            self.join.as_str(),
            self.victory.as_str(),
            self.defeat.as_str(),
            self.incomplete.as_str(),
        ]
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub emojis: EmojiConfig,
    #[serde(default = "default_leaderboard_size")]
    pub leaderboard_size: i64,
    #[serde(default = "default_coalesce_window_ms")]
    pub coalesce_window_ms: u64,
    #[serde(default = "default_chat_timeout_secs")]
    pub chat_timeout_secs: u64,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            emojis: EmojiConfig::default(),
            leaderboard_size: default_leaderboard_size(),
            coalesce_window_ms: default_coalesce_window_ms(),
            chat_timeout_secs: default_chat_timeout_secs(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Loads the YAML file at `path` (or `config.yaml` when present), then
    /// applies environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("CHAT_AUTH_TOKEN") {
            self.discord.token = SecretString::from(value);
        }
        if let Some(value) = parse_env(&lookup, "ALERT_CHANNEL_ID")? {
            self.discord.alert_channel_id = value;
        }
        if let Some(value) = parse_env(&lookup, "LEADERBOARD_CHANNEL_ID")? {
            self.discord.leaderboard_channel_id = value;
        }
        if let Some(value) = parse_env(&lookup, "SNAPSHOT_CHANNEL_ID")? {
            self.discord.snapshot_channel_id = Some(value);
        }
        if let Some(value) = parse_env(&lookup, "INCIDENT_CHANNEL_ID")? {
            self.discord.incident_channel_id = Some(value);
        }
        if let Some(value) = parse_env(&lookup, "ROLE_DEF_ID")? {
            self.roles.defense = value;
        }
        if let Some(value) = parse_env(&lookup, "ROLE_DEF2_ID")? {
            self.roles.defense_2 = Some(value);
        }
        if let Some(value) = parse_env(&lookup, "ROLE_TEST_ID")? {
            self.roles.test = Some(value);
        }
        if let Some(value) = parse_env(&lookup, "ADMIN_ROLE_ID")? {
            self.roles.admin = Some(value);
        }
        if let Some(value) = parse_env(&lookup, "PORT")? {
            self.web.port = value;
        }
        if let Some(value) = lookup("DATABASE_PATH") {
            self.database.path = value;
        }
        if let Some(value) = lookup("LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = lookup("LOG_FORMAT") {
            self.logging.format = value;
        }
        Ok(())
    }
}

fn parse_env<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value: raw }),
    }
}

fn default_token() -> SecretString {
    SecretString::from(String::new())
}

fn default_database_path() -> String {
    "guild_defense.db".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_port() -> u16 {
    10000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_join_emoji() -> String {
    "👍".to_string()
}

fn default_victory_emoji() -> String {
    "🏆".to_string()
}

fn default_defeat_emoji() -> String {
    "❌".to_string()
}

fn default_incomplete_emoji() -> String {
    "😡".to_string()
}

fn default_leaderboard_size() -> i64 {
    10
}

fn default_coalesce_window_ms() -> u64 {
    250
}

fn default_chat_timeout_secs() -> u64 {
    10
}

fn default_snapshot_interval_secs() -> u64 {
    6 * 60 * 60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
