use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::embed::DiscordEmbed;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("transient chat error: {0}")]
    Transient(String),
    #[error("chat call exceeded its {0}s deadline")]
    Timeout(u64),
    #[error("discord http client not available")]
    NotConnected,
}

impl ChatError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ChatError::NotFound(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelButton {
    pub custom_id: String,
    pub label: String,
    pub danger: bool,
}

/// Longest message `content` Discord accepts, in characters.
pub const MESSAGE_CONTENT_LIMIT: usize = 2000;

/// A text file uploaded alongside a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingAttachment {
    pub filename: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: Option<String>,
    pub embed: Option<DiscordEmbed>,
    /// Roles allowed to be pinged by `content`; every other mention is suppressed.
    pub mention_roles: Vec<u64>,
    pub buttons: Vec<PanelButton>,
    pub attachment: Option<OutgoingAttachment>,
}

impl OutgoingMessage {
    pub fn embed(embed: DiscordEmbed) -> Self {
        Self {
            embed: Some(embed),
            ..Self::default()
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: u64,
    pub author_id: u64,
    pub content: String,
    /// File names of the message's attachments.
    pub attachments: Vec<String>,
}

/// Chat platform capabilities the tracker depends on.
///
/// Reaction reads exclude the bot's own reactions.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn current_user_id(&self) -> Option<u64>;
    async fn send_message(&self, channel_id: u64, message: OutgoingMessage)
    -> Result<u64, ChatError>;
    async fn edit_message(
        &self,
        channel_id: u64,
        message_id: u64,
        message: OutgoingMessage,
    ) -> Result<(), ChatError>;
    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<(), ChatError>;
    async fn add_reaction(
        &self,
        channel_id: u64,
        message_id: u64,
        emoji: &str,
    ) -> Result<(), ChatError>;
    async fn reaction_counts(
        &self,
        channel_id: u64,
        message_id: u64,
    ) -> Result<BTreeMap<String, u64>, ChatError>;
    async fn reaction_users(
        &self,
        channel_id: u64,
        message_id: u64,
        emoji: &str,
    ) -> Result<Vec<u64>, ChatError>;
    /// Newest first.
    async fn recent_messages(
        &self,
        channel_id: u64,
        limit: u8,
    ) -> Result<Vec<ChatMessage>, ChatError>;
    /// Downloads a text attachment of a message by file name.
    async fn attachment_text(
        &self,
        channel_id: u64,
        message_id: u64,
        filename: &str,
    ) -> Result<String, ChatError>;
}

/// Bounds a chat call by a soft deadline.
pub async fn with_deadline<T, F>(secs: u64, call: F) -> Result<T, ChatError>
where
    F: Future<Output = Result<T, ChatError>>,
{
    tokio::time::timeout(Duration::from_secs(secs), call)
        .await
        .map_err(|_| ChatError::Timeout(secs))?
}
