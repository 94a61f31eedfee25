use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serenity::all::{
    ButtonStyle, ChannelId, Client as SerenityClient, Command, CommandDataOptionValue,
    CommandInteraction, ComponentInteraction, Context as SerenityContext, CreateActionRow,
    CreateAllowedMentions, CreateAttachment, CreateButton, CreateInteractionResponse,
    CreateInteractionResponseFollowup, CreateInteractionResponseMessage, CreateMessage,
    EditMessage, EventHandler as SerenityEventHandler, GatewayIntents, GetMessages, GuildId, Http,
    Interaction, MessageId, Reaction, ReactionType, Ready, RoleId, UserId,
};
use tokio::sync::{Mutex as AsyncMutex, RwLock, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::tracker::{AlertEvent, AlertRole, AlertTracker};

const INITIAL_LOGIN_RETRY_SECONDS: u64 = 2;
const MAX_LOGIN_RETRY_SECONDS: u64 = 300;
const READY_TIMEOUT_SECONDS: u64 = 30;
const REACTION_PAGE_SIZE: u8 = 100;

pub mod command_handler;
pub mod embed;
pub mod gateway;

pub use self::command_handler::{CommandCaller, CommandOption, OptionValue};
pub use self::embed::DiscordEmbed;
pub use self::gateway::{
    ChatError, ChatGateway, ChatMessage, OutgoingMessage, PanelButton, with_deadline,
};

type SharedTracker = Arc<RwLock<Option<Arc<AlertTracker>>>>;

/// Serenity-backed [`ChatGateway`]. The gateway connection feeds events to
/// the tracker bound with [`DiscordClient::set_tracker`].
#[derive(Clone)]
pub struct DiscordClient {
    token: SecretString,
    login_state: Arc<AsyncMutex<DiscordLoginState>>,
    tracker: SharedTracker,
    http: Arc<RwLock<Option<Arc<Http>>>>,
    bot_user: Arc<RwLock<Option<u64>>>,
}

#[derive(Default)]
struct DiscordLoginState {
    is_logged_in: bool,
    gateway_task: Option<tokio::task::JoinHandle<()>>,
}

struct GatewayHandler {
    ready_sender: Arc<AsyncMutex<Option<oneshot::Sender<()>>>>,
    tracker: SharedTracker,
    http: Arc<RwLock<Option<Arc<Http>>>>,
    bot_user: Arc<RwLock<Option<u64>>>,
}

impl GatewayHandler {
    async fn tracker(&self) -> Option<Arc<AlertTracker>> {
        let tracker = self.tracker.read().await.clone();
        if tracker.is_none() {
            debug!("ignoring discord event before tracker binding");
        }
        tracker
    }

    async fn dispatch(&self, event: AlertEvent) {
        if let Some(tracker) = self.tracker().await {
            tracker.handle_event(event).await;
        }
    }

    async fn reaction_event(&self, reaction: &Reaction, added: bool) {
        let Some(user_id) = reaction.user_id else {
            return;
        };
        if *self.bot_user.read().await == Some(user_id.get()) {
            return;
        }
        let message_id = reaction.message_id.get();
        let user_id = user_id.get();
        let emoji = reaction.emoji.to_string();
        let event = if added {
            AlertEvent::ReactionAdded {
                message_id,
                user_id,
                emoji,
            }
        } else {
            AlertEvent::ReactionRemoved {
                message_id,
                user_id,
                emoji,
            }
        };
        self.dispatch(event).await;
    }

    async fn on_component(&self, ctx: &SerenityContext, component: ComponentInteraction) {
        let Some(role) = AlertRole::from_custom_id(&component.data.custom_id) else {
            return;
        };
        let Some(tracker) = self.tracker().await else {
            return;
        };

        let defer = CreateInteractionResponse::Defer(
            CreateInteractionResponseMessage::new().ephemeral(true),
        );
        if let Err(err) = component.create_response(&ctx.http, defer).await {
            warn!("failed to acknowledge alert button: {err}");
            return;
        }

        let reply = match component.guild_id {
            Some(guild_id) => match tracker
                .trigger_alert(guild_id.get(), component.user.id.get(), role)
                .await
            {
                Ok(_) => "Alerte envoyée ✅".to_string(),
                Err(err) => {
                    warn!(guild_id = guild_id.get(), ?role, "alert trigger failed: {err}");
                    err.user_message()
                }
            },
            None => "Les alertes ne fonctionnent que sur un serveur.".to_string(),
        };

        let followup = CreateInteractionResponseFollowup::new()
            .content(reply)
            .ephemeral(true);
        if let Err(err) = component.create_followup(&ctx.http, followup).await {
            warn!("failed to answer alert button: {err}");
        }
    }

    async fn on_command(&self, ctx: &SerenityContext, command: CommandInteraction) {
        let Some(tracker) = self.tracker().await else {
            return;
        };

        let defer = CreateInteractionResponse::Defer(
            CreateInteractionResponseMessage::new().ephemeral(true),
        );
        if let Err(err) = command.create_response(&ctx.http, defer).await {
            warn!(command = %command.data.name, "failed to acknowledge command: {err}");
            return;
        }

        let caller = command_caller(&command);
        let options = command_options(&command);
        let outcome = match command_handler::parse_command(&command.data.name, &options) {
            Ok(parsed) => {
                info!(command = %command.data.name, user_id = caller.user_id, "running command");
                tracker.execute_command(&caller, parsed).await.map_err(|err| {
                    warn!(command = %command.data.name, "command failed: {err}");
                    err.user_message()
                })
            }
            Err(err) => Err(format!("Requête invalide : {err}.")),
        };

        let mut followup = CreateInteractionResponseFollowup::new().ephemeral(true);
        match outcome {
            Ok(reply) => {
                if let Some(content) = reply.content {
                    followup = followup.content(content);
                }
                if let Some(embed) = reply.embed {
                    followup = followup.embed(embed.to_create_embed());
                }
            }
            Err(message) => followup = followup.content(message),
        }
        if let Err(err) = command.create_followup(&ctx.http, followup).await {
            warn!(command = %command.data.name, "failed to answer command: {err}");
        }
    }
}

#[serenity::async_trait]
impl SerenityEventHandler for GatewayHandler {
    async fn ready(&self, ctx: SerenityContext, ready: Ready) {
        info!(
            "discord gateway ready as {} ({})",
            ready.user.name, ready.user.id
        );
        *self.http.write().await = Some(ctx.http.clone());
        *self.bot_user.write().await = Some(ready.user.id.get());

        if let Err(err) =
            Command::set_global_commands(&ctx.http, command_handler::build_commands()).await
        {
            error!("failed to register slash commands: {err}");
        }

        if let Some(sender) = self.ready_sender.lock().await.take() {
            let _ = sender.send(());
        }

        if let Some(tracker) = self.tracker().await {
            let guild_ids = ready.guilds.iter().map(|guild| guild.id.get()).collect();
            tokio::spawn(async move { tracker.on_ready(guild_ids).await });
        }
    }

    async fn interaction_create(&self, ctx: SerenityContext, interaction: Interaction) {
        match interaction {
            Interaction::Component(component) => self.on_component(&ctx, component).await,
            Interaction::Command(command) => self.on_command(&ctx, command).await,
            _ => {}
        }
    }

    async fn reaction_add(&self, _ctx: SerenityContext, add_reaction: Reaction) {
        self.reaction_event(&add_reaction, true).await;
    }

    async fn reaction_remove(&self, _ctx: SerenityContext, removed_reaction: Reaction) {
        self.reaction_event(&removed_reaction, false).await;
    }

    async fn reaction_remove_all(
        &self,
        _ctx: SerenityContext,
        _channel_id: ChannelId,
        removed_from_message_id: MessageId,
    ) {
        self.dispatch(AlertEvent::ReactionsCleared {
            message_id: removed_from_message_id.get(),
        })
        .await;
    }

    async fn reaction_remove_emoji(&self, _ctx: SerenityContext, removed_reactions: Reaction) {
        self.dispatch(AlertEvent::ReactionsCleared {
            message_id: removed_reactions.message_id.get(),
        })
        .await;
    }

    async fn message_delete(
        &self,
        _ctx: SerenityContext,
        _channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<GuildId>,
    ) {
        self.dispatch(AlertEvent::MessageDeleted {
            message_id: deleted_message_id.get(),
        })
        .await;
    }

    async fn message_delete_bulk(
        &self,
        _ctx: SerenityContext,
        _channel_id: ChannelId,
        deleted_messages_ids: Vec<MessageId>,
        _guild_id: Option<GuildId>,
    ) {
        for message_id in unique_message_ids(deleted_messages_ids) {
            self.dispatch(AlertEvent::MessageDeleted {
                message_id: message_id.get(),
            })
            .await;
        }
    }
}

fn command_caller(command: &CommandInteraction) -> CommandCaller {
    let member = command.member.as_deref();
    CommandCaller {
        user_id: command.user.id.get(),
        guild_id: command.guild_id.map(GuildId::get),
        can_manage_guild: member
            .and_then(|member| member.permissions)
            .is_some_and(|permissions| permissions.manage_guild()),
        role_ids: member
            .map(|member| member.roles.iter().map(|role| role.get()).collect())
            .unwrap_or_default(),
    }
}

fn command_options(command: &CommandInteraction) -> Vec<CommandOption> {
    command
        .data
        .options
        .iter()
        .filter_map(|option| {
            let value = match &option.value {
                CommandDataOptionValue::User(user_id) => OptionValue::User(user_id.get()),
                CommandDataOptionValue::String(text) => OptionValue::Text(text.clone()),
                _ => return None,
            };
            Some(CommandOption {
                name: option.name.clone(),
                value,
            })
        })
        .collect()
}

fn unique_message_ids(ids: Vec<MessageId>) -> Vec<MessageId> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

fn channel(id: u64) -> Result<ChannelId, ChatError> {
    (id != 0)
        .then(|| ChannelId::new(id))
        .ok_or_else(|| ChatError::NotFound("channel 0".to_string()))
}

fn message(id: u64) -> Result<MessageId, ChatError> {
    (id != 0)
        .then(|| MessageId::new(id))
        .ok_or_else(|| ChatError::NotFound("message 0".to_string()))
}

fn reaction_type(emoji: &str) -> Result<ReactionType, ChatError> {
    ReactionType::try_from(emoji)
        .map_err(|err| ChatError::Transient(format!("unusable emoji {emoji}: {err}")))
}

fn chat_error(err: serenity::Error) -> ChatError {
    match &err {
        serenity::Error::Http(http_err) => match http_err.status_code().map(|s| s.as_u16()) {
            Some(404) => ChatError::NotFound(err.to_string()),
            Some(401 | 403) => ChatError::PermissionDenied(err.to_string()),
            _ => ChatError::Transient(err.to_string()),
        },
        serenity::Error::Model(_) => ChatError::PermissionDenied(err.to_string()),
        _ => ChatError::Transient(err.to_string()),
    }
}

fn allowed_mentions(message: &OutgoingMessage) -> CreateAllowedMentions {
    CreateAllowedMentions::new().roles(
        message
            .mention_roles
            .iter()
            .filter(|id| **id != 0)
            .map(|id| RoleId::new(*id)),
    )
}

fn action_rows(message: &OutgoingMessage) -> Vec<CreateActionRow> {
    if message.buttons.is_empty() {
        return Vec::new();
    }
    let buttons = message
        .buttons
        .iter()
        .map(|button| {
            CreateButton::new(button.custom_id.clone())
                .label(button.label.clone())
                .style(if button.danger {
                    ButtonStyle::Danger
                } else {
                    ButtonStyle::Secondary
                })
        })
        .collect();
    vec![CreateActionRow::Buttons(buttons)]
}

fn create_message(message: &OutgoingMessage) -> CreateMessage {
    let mut builder = CreateMessage::new().allowed_mentions(allowed_mentions(message));
    if let Some(content) = &message.content {
        builder = builder.content(content);
    }
    if let Some(embed) = &message.embed {
        builder = builder.embed(embed.to_create_embed());
    }
    let rows = action_rows(message);
    if !rows.is_empty() {
        builder = builder.components(rows);
    }
    if let Some(attachment) = &message.attachment {
        builder = builder.add_file(CreateAttachment::bytes(
            attachment.body.clone().into_bytes(),
            attachment.filename.clone(),
        ));
    }
    builder
}

fn edit_message(message: &OutgoingMessage) -> EditMessage {
    let mut builder = EditMessage::new().allowed_mentions(allowed_mentions(message));
    if let Some(content) = &message.content {
        builder = builder.content(content);
    }
    if let Some(embed) = &message.embed {
        builder = builder.embed(embed.to_create_embed());
    }
    builder
}

impl DiscordClient {
    pub fn new(config: &Config) -> Self {
        info!("initializing discord client");
        Self {
            token: SecretString::from(config.discord.token.expose_secret().to_string()),
            login_state: Arc::new(AsyncMutex::new(DiscordLoginState::default())),
            tracker: Arc::new(RwLock::new(None)),
            http: Arc::new(RwLock::new(None)),
            bot_user: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn set_tracker(&self, tracker: Arc<AlertTracker>) {
        *self.tracker.write().await = Some(tracker);
    }

    async fn http(&self) -> Result<Arc<Http>, ChatError> {
        self.http.read().await.clone().ok_or(ChatError::NotConnected)
    }

    pub async fn login(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if state.is_logged_in {
            return Ok(());
        }

        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::GUILD_MESSAGE_REACTIONS;

        let (ready_tx, ready_rx) = oneshot::channel();
        let event_handler = GatewayHandler {
            ready_sender: Arc::new(AsyncMutex::new(Some(ready_tx))),
            tracker: self.tracker.clone(),
            http: self.http.clone(),
            bot_user: self.bot_user.clone(),
        };

        let mut gateway_client = SerenityClient::builder(self.token.expose_secret(), intents)
            .event_handler(event_handler)
            .await
            .map_err(|err| anyhow!("failed to build discord gateway client: {err}"))?;

        let gateway_task = tokio::spawn(async move {
            if let Err(err) = gateway_client.start_autosharded().await {
                error!("discord gateway stopped: {err}");
            }
        });

        match tokio::time::timeout(
            std::time::Duration::from_secs(READY_TIMEOUT_SECONDS),
            ready_rx,
        )
        .await
        {
            Ok(Ok(())) => {
                state.is_logged_in = true;
                state.gateway_task = Some(gateway_task);
                info!("discord bot login succeeded and gateway is connected");
                Ok(())
            }
            Ok(Err(_)) => {
                gateway_task.abort();
                Err(anyhow!("discord gateway exited before receiving Ready event"))
            }
            Err(_) => {
                gateway_task.abort();
                Err(anyhow!("timed out waiting for discord Ready event"))
            }
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut retry_seconds = INITIAL_LOGIN_RETRY_SECONDS;

        loop {
            match self.login().await {
                Ok(()) => {
                    info!("discord client is ready");
                    return Ok(());
                }
                Err(err) => {
                    error!(
                        "failed to start discord client: {err}. retrying in {} seconds",
                        retry_seconds
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(retry_seconds)).await;
                    retry_seconds = (retry_seconds * 2).min(MAX_LOGIN_RETRY_SECONDS);
                }
            }
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if !state.is_logged_in {
            return Ok(());
        }

        if let Some(gateway_task) = state.gateway_task.take() {
            gateway_task.abort();
            match gateway_task.await {
                Ok(()) => info!("discord gateway task exited"),
                Err(join_err) if join_err.is_cancelled() => {
                    info!("discord gateway task aborted")
                }
                Err(join_err) => {
                    error!("discord gateway task join error: {join_err}");
                }
            }
        }

        state.is_logged_in = false;
        info!("discord client stopped");
        Ok(())
    }
}

#[async_trait]
impl ChatGateway for DiscordClient {
    async fn current_user_id(&self) -> Option<u64> {
        *self.bot_user.read().await
    }

    async fn send_message(
        &self,
        channel_id: u64,
        outgoing: OutgoingMessage,
    ) -> Result<u64, ChatError> {
        let http = self.http().await?;
        let sent = channel(channel_id)?
            .send_message(&http, create_message(&outgoing))
            .await
            .map_err(chat_error)?;
        debug!(channel_id, message_id = %sent.id, "sent discord message");
        Ok(sent.id.get())
    }

    async fn edit_message(
        &self,
        channel_id: u64,
        message_id: u64,
        outgoing: OutgoingMessage,
    ) -> Result<(), ChatError> {
        let http = self.http().await?;
        channel(channel_id)?
            .edit_message(&http, message(message_id)?, edit_message(&outgoing))
            .await
            .map_err(chat_error)?;
        Ok(())
    }

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<(), ChatError> {
        let http = self.http().await?;
        channel(channel_id)?
            .delete_message(&http, message(message_id)?)
            .await
            .map_err(chat_error)
    }

    async fn add_reaction(
        &self,
        channel_id: u64,
        message_id: u64,
        emoji: &str,
    ) -> Result<(), ChatError> {
        let http = self.http().await?;
        channel(channel_id)?
            .create_reaction(&http, message(message_id)?, reaction_type(emoji)?)
            .await
            .map_err(chat_error)
    }

    async fn reaction_counts(
        &self,
        channel_id: u64,
        message_id: u64,
    ) -> Result<BTreeMap<String, u64>, ChatError> {
        let http = self.http().await?;
        let fetched = channel(channel_id)?
            .message(&http, message(message_id)?)
            .await
            .map_err(chat_error)?;
        Ok(fetched
            .reactions
            .iter()
            .map(|reaction| {
                let own = u64::from(reaction.me);
                (
                    reaction.reaction_type.to_string(),
                    reaction.count.saturating_sub(own),
                )
            })
            .collect())
    }

    async fn reaction_users(
        &self,
        channel_id: u64,
        message_id: u64,
        emoji: &str,
    ) -> Result<Vec<u64>, ChatError> {
        let http = self.http().await?;
        let channel_id = channel(channel_id)?;
        let message_id = message(message_id)?;
        let reaction = reaction_type(emoji)?;
        let bot_id = self.current_user_id().await;

        let mut users = Vec::new();
        let mut after: Option<UserId> = None;
        loop {
            let page = channel_id
                .reaction_users(
                    &http,
                    message_id,
                    reaction.clone(),
                    Some(REACTION_PAGE_SIZE),
                    after,
                )
                .await
                .map_err(chat_error)?;
            let full_page = page.len() == usize::from(REACTION_PAGE_SIZE);
            after = page.last().map(|user| user.id);
            users.extend(
                page.iter()
                    .map(|user| user.id.get())
                    .filter(|id| Some(*id) != bot_id),
            );
            if !full_page || after.is_none() {
                break;
            }
        }
        Ok(users)
    }

    async fn recent_messages(
        &self,
        channel_id: u64,
        limit: u8,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let http = self.http().await?;
        let messages = channel(channel_id)?
            .messages(&http, GetMessages::new().limit(limit))
            .await
            .map_err(chat_error)?;
        Ok(messages
            .into_iter()
            .map(|message| ChatMessage {
                id: message.id.get(),
                author_id: message.author.id.get(),
                content: message.content,
                attachments: message
                    .attachments
                    .into_iter()
                    .map(|attachment| attachment.filename)
                    .collect(),
            })
            .collect())
    }

    async fn attachment_text(
        &self,
        channel_id: u64,
        message_id: u64,
        filename: &str,
    ) -> Result<String, ChatError> {
        let http = self.http().await?;
        let fetched = channel(channel_id)?
            .message(&http, message(message_id)?)
            .await
            .map_err(chat_error)?;
        let attachment = fetched
            .attachments
            .iter()
            .find(|attachment| attachment.filename == filename)
            .ok_or_else(|| ChatError::NotFound(format!("attachment {filename}")))?;
        let bytes = attachment.download().await.map_err(chat_error)?;
        String::from_utf8(bytes)
            .map_err(|err| ChatError::Transient(format!("attachment {filename} is not text: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use serenity::all::MessageId;

    use super::{OutgoingMessage, PanelButton, action_rows, channel, message, unique_message_ids};

    #[test]
    fn unique_message_ids_deduplicates_and_preserves_order() {
        let ids = vec![
            MessageId::new(42),
            MessageId::new(99),
            MessageId::new(42),
            MessageId::new(7),
            MessageId::new(99),
        ];

        let deduped = unique_message_ids(ids);

        assert_eq!(
            deduped,
            vec![MessageId::new(42), MessageId::new(99), MessageId::new(7)]
        );
    }

    #[test]
    fn zero_ids_are_not_found_instead_of_panicking() {
        assert!(channel(0).expect_err("zero channel").is_not_found());
        assert!(message(0).expect_err("zero message").is_not_found());
        assert_eq!(channel(5).expect("channel").get(), 5);
    }

    #[test]
    fn buttons_share_one_action_row() {
        let mut panel = OutgoingMessage::text("panel");
        assert!(action_rows(&panel).is_empty());

        panel.buttons = vec![
            PanelButton {
                custom_id: "alert:def".to_string(),
                label: "Défense 1".to_string(),
                danger: true,
            },
            PanelButton {
                custom_id: "alert:test".to_string(),
                label: "Test".to_string(),
                danger: false,
            },
        ];
        assert_eq!(action_rows(&panel).len(), 1);
    }
}
