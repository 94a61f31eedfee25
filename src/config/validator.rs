use thiserror::Error;

use super::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value {value:?} for environment variable {name}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        use secrecy::ExposeSecret;

        if self.discord.token.expose_secret().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "CHAT_AUTH_TOKEN cannot be empty".to_string(),
            ));
        }

        if self.discord.alert_channel_id == 0 {
            return Err(ConfigError::InvalidConfig(
                "ALERT_CHANNEL_ID must be set".to_string(),
            ));
        }

        if self.discord.leaderboard_channel_id == 0 {
            return Err(ConfigError::InvalidConfig(
                "LEADERBOARD_CHANNEL_ID must be set".to_string(),
            ));
        }

        if self.roles.defense == 0 {
            return Err(ConfigError::InvalidConfig(
                "ROLE_DEF_ID must be set".to_string(),
            ));
        }

        if self.web.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "PORT must be between 1 and 65535".to_string(),
            ));
        }

        if !(1..=25).contains(&self.tracker.leaderboard_size) {
            return Err(ConfigError::InvalidConfig(
                "tracker.leaderboard_size must be between 1 and 25".to_string(),
            ));
        }

        if self.tracker.snapshot_interval_secs == 0 || self.tracker.chat_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "tracker.snapshot_interval_secs and tracker.chat_timeout_secs must be positive"
                    .to_string(),
            ));
        }

        let mut all = self.tracker.emojis.all();
        all.sort_unstable();
        if all.windows(2).any(|pair| pair[0] == pair[1]) || all.iter().any(|e| e.is_empty()) {
            return Err(ConfigError::InvalidConfig(
                "tracker.emojis must be four distinct, non-empty emojis".to_string(),
            ));
        }

        Ok(())
    }
}
