pub use self::parser::{
    Config, DatabaseConfig, DiscordConfig, EmojiConfig, LoggingConfig, RolesConfig,
    TrackerConfig, WebConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
