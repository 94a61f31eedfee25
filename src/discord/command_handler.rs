use serenity::all::{CommandOptionType, CreateCommand, CreateCommandOption, Permissions};
use thiserror::Error;

pub const STATS_COMMAND: &str = "stats";
pub const SNAPSHOT_SAVE_COMMAND: &str = "snapshot-save";
pub const ALERT_PANEL_COMMAND: &str = "alert-panel";
pub const ADD_DEFENDER_COMMAND: &str = "add-defender";
pub const REMOVE_DEFENDER_COMMAND: &str = "remove-defender";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    User(u64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOption {
    pub name: String,
    pub value: OptionValue,
}

/// Who invoked a slash command, as far as authorization is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCaller {
    pub user_id: u64,
    pub guild_id: Option<u64>,
    pub can_manage_guild: bool,
    pub role_ids: Vec<u64>,
}

impl CommandCaller {
    pub fn is_admin(&self, admin_role: Option<u64>) -> bool {
        self.can_manage_guild
            || admin_role.is_some_and(|role| self.role_ids.contains(&role))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Stats { user_id: Option<u64> },
    SnapshotSave,
    AlertPanel,
    AddDefender { message_id: u64, user_id: u64 },
    RemoveDefender { message_id: u64, user_id: u64 },
}

impl AdminCommand {
    pub fn requires_admin(&self) -> bool {
        !matches!(self, AdminCommand::Stats { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::Stats { .. } => STATS_COMMAND,
            AdminCommand::SnapshotSave => SNAPSHOT_SAVE_COMMAND,
            AdminCommand::AlertPanel => ALERT_PANEL_COMMAND,
            AdminCommand::AddDefender { .. } => ADD_DEFENDER_COMMAND,
            AdminCommand::RemoveDefender { .. } => REMOVE_DEFENDER_COMMAND,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandParseError {
    #[error("commande inconnue: {0}")]
    Unknown(String),
    #[error("option manquante: {0}")]
    MissingOption(&'static str),
    #[error("option invalide: {0}")]
    InvalidOption(&'static str),
}

pub fn parse_command(
    name: &str,
    options: &[CommandOption],
) -> Result<AdminCommand, CommandParseError> {
    match name {
        STATS_COMMAND => Ok(AdminCommand::Stats {
            user_id: user_option(options, "user"),
        }),
        SNAPSHOT_SAVE_COMMAND => Ok(AdminCommand::SnapshotSave),
        ALERT_PANEL_COMMAND => Ok(AdminCommand::AlertPanel),
        ADD_DEFENDER_COMMAND => Ok(AdminCommand::AddDefender {
            message_id: message_id_option(options)?,
            user_id: user_option(options, "user")
                .ok_or(CommandParseError::MissingOption("user"))?,
        }),
        REMOVE_DEFENDER_COMMAND => Ok(AdminCommand::RemoveDefender {
            message_id: message_id_option(options)?,
            user_id: user_option(options, "user")
                .ok_or(CommandParseError::MissingOption("user"))?,
        }),
        other => Err(CommandParseError::Unknown(other.to_string())),
    }
}

fn user_option(options: &[CommandOption], name: &str) -> Option<u64> {
    options.iter().find_map(|option| match &option.value {
        OptionValue::User(id) if option.name == name => Some(*id),
        _ => None,
    })
}

fn message_id_option(options: &[CommandOption]) -> Result<u64, CommandParseError> {
    let raw = options
        .iter()
        .find_map(|option| match &option.value {
            OptionValue::Text(text) if option.name == "message_id" => Some(text.as_str()),
            _ => None,
        })
        .ok_or(CommandParseError::MissingOption("message_id"))?;

    // Accept a bare id or a message link, whose last segment is the id.
    raw.trim()
        .rsplit('/')
        .next()
        .and_then(|id| id.parse().ok())
        .ok_or(CommandParseError::InvalidOption("message_id"))
}

pub fn build_commands() -> Vec<CreateCommand> {
    let admin = Permissions::MANAGE_GUILD;
    let message_option = || {
        CreateCommandOption::new(
            CommandOptionType::String,
            "message_id",
            "Identifiant ou lien du message d'alerte",
        )
        .required(true)
    };
    let user_option = |required: bool| {
        CreateCommandOption::new(CommandOptionType::User, "user", "Joueur").required(required)
    };

    vec![
        CreateCommand::new(STATS_COMMAND)
            .description("Statistiques de défense d'un joueur")
            .add_option(user_option(false)),
        CreateCommand::new(SNAPSHOT_SAVE_COMMAND)
            .description("Sauvegarde les compteurs dans le salon de snapshot")
            .default_member_permissions(admin),
        CreateCommand::new(ALERT_PANEL_COMMAND)
            .description("Publie le panneau d'alerte")
            .default_member_permissions(admin),
        CreateCommand::new(ADD_DEFENDER_COMMAND)
            .description("Ajoute un défenseur à une alerte")
            .default_member_permissions(admin)
            .add_option(message_option())
            .add_option(user_option(true)),
        CreateCommand::new(REMOVE_DEFENDER_COMMAND)
            .description("Retire un défenseur d'une alerte")
            .default_member_permissions(admin)
            .add_option(message_option())
            .add_option(user_option(true)),
    ]
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::{
        AdminCommand, CommandCaller, CommandOption, CommandParseError, OptionValue,
        parse_command,
    };

    fn text(name: &str, value: &str) -> CommandOption {
        CommandOption {
            name: name.to_string(),
            value: OptionValue::Text(value.to_string()),
        }
    }

    fn user(id: u64) -> CommandOption {
        CommandOption {
            name: "user".to_string(),
            value: OptionValue::User(id),
        }
    }

    #[test]
    fn stats_user_is_optional() {
        assert_eq!(
            parse_command("stats", &[]),
            Ok(AdminCommand::Stats { user_id: None })
        );
        assert_eq!(
            parse_command("stats", &[user(7)]),
            Ok(AdminCommand::Stats { user_id: Some(7) })
        );
    }

    #[test_case("123456" ; "bare id")]
    #[test_case("https://discord.com/channels/1/2/123456" ; "message link")]
    fn add_defender_accepts_ids_and_links(raw: &str) {
        assert_eq!(
            parse_command("add-defender", &[text("message_id", raw), user(9)]),
            Ok(AdminCommand::AddDefender {
                message_id: 123456,
                user_id: 9
            })
        );
    }

    #[test]
    fn remove_defender_requires_a_user() {
        assert_eq!(
            parse_command("remove-defender", &[text("message_id", "1")]),
            Err(CommandParseError::MissingOption("user"))
        );
        assert_eq!(
            parse_command("remove-defender", &[text("message_id", "abc"), user(1)]),
            Err(CommandParseError::InvalidOption("message_id"))
        );
    }

    #[test_case("stats")]
    #[test_case("snapshot-save")]
    #[test_case("alert-panel")]
    fn parsed_commands_keep_their_name(name: &str) {
        assert_eq!(parse_command(name, &[]).expect("command").name(), name);
    }

    #[test]
    fn parse_errors_read_in_french() {
        let err = parse_command("roulette", &[]).expect_err("unknown");
        assert_eq!(err.to_string(), "commande inconnue: roulette");
        assert_eq!(
            CommandParseError::MissingOption("user").to_string(),
            "option manquante: user"
        );
    }

    #[test]
    fn only_stats_is_open_to_everyone() {
        assert!(!AdminCommand::Stats { user_id: None }.requires_admin());
        assert!(AdminCommand::SnapshotSave.requires_admin());
        assert!(AdminCommand::AlertPanel.requires_admin());
    }

    #[test]
    fn admin_role_or_manage_guild_grants_admin() {
        let mut caller = CommandCaller {
            user_id: 1,
            guild_id: Some(2),
            can_manage_guild: false,
            role_ids: vec![50],
        };
        assert!(!caller.is_admin(None));
        assert!(!caller.is_admin(Some(51)));
        assert!(caller.is_admin(Some(50)));

        caller.role_ids.clear();
        caller.can_manage_guild = true;
        assert!(caller.is_admin(Some(51)));
    }
}
