//! Shared fixtures for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use diesel::{Connection, RunQueryDsl, SqliteConnection};
use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::config::DatabaseConfig;
use crate::db::{AlertRecord, AlertStore, DatabaseManager};
use crate::discord::gateway::MESSAGE_CONTENT_LIMIT;
use crate::discord::{ChatError, ChatGateway, ChatMessage, OutgoingMessage};

/// 2023-11-14 22:13:20 UTC.
pub const FIXED_TS: i64 = 1_700_000_000;

/// A migrated store backed by a temporary file; keep the file alive for the
/// duration of the test.
pub async fn temp_store() -> (NamedTempFile, Arc<dyn AlertStore>) {
    let file = NamedTempFile::new().expect("temp sqlite file");
    let manager = DatabaseManager::new(&DatabaseConfig {
        path: file.path().to_string_lossy().to_string(),
        max_connections: 2,
    })
    .await
    .expect("db manager");
    manager.migrate().await.expect("migrate");
    (file, manager.alert_store())
}

/// Runs `sql` on a side connection, behind the store's back.
pub fn execute_raw(file: &NamedTempFile, sql: &str) {
    let path = file.path().to_string_lossy().to_string();
    let mut conn = SqliteConnection::establish(&path).expect("side connection");
    diesel::sql_query(sql).execute(&mut conn).expect("raw sql");
}

/// Makes every insert into `table` fail while reads keep working.
pub fn reject_inserts(file: &NamedTempFile, table: &str) {
    execute_raw(
        file,
        &format!(
            "CREATE TRIGGER reject_{table} BEFORE INSERT ON {table} \
             BEGIN SELECT RAISE(FAIL, '{table} is read-only'); END"
        ),
    );
}

pub fn alert(message_id: u64, guild_id: u64, creator_id: Option<u64>) -> AlertRecord {
    AlertRecord {
        message_id,
        guild_id,
        channel_id: 100,
        created_ts: FIXED_TS,
        creator_id,
        team: None,
        outcome: None,
        incomplete: false,
        last_ts: FIXED_TS,
    }
}

struct FakeMessage {
    author_id: u64,
    body: OutgoingMessage,
    /// Reacting users per emoji, in reaction order.
    reactions: BTreeMap<String, Vec<u64>>,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    messages: BTreeMap<(u64, u64), FakeMessage>,
    sends: Vec<(u64, u64)>,
    edits: usize,
    failing_sends: HashMap<u64, ChatError>,
    read_delay: Option<Duration>,
}

/// In-memory chat platform. Message ids are handed out in increasing order,
/// so newer messages always have larger ids.
pub struct FakeGateway {
    bot_id: u64,
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new(bot_id: u64) -> Self {
        Self {
            bot_id,
            state: Mutex::new(FakeState {
                next_id: 10_000,
                ..FakeState::default()
            }),
        }
    }

    fn insert(&self, channel_id: u64, author_id: u64, body: OutgoingMessage) -> u64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        let message_id = state.next_id;
        state.messages.insert(
            (channel_id, message_id),
            FakeMessage {
                author_id,
                body,
                reactions: BTreeMap::new(),
            },
        );
        message_id
    }

    /// Posts a plain message as any user, bypassing failure injection.
    pub fn post_as(&self, channel_id: u64, author_id: u64, content: String) -> u64 {
        self.insert(channel_id, author_id, OutgoingMessage::text(content))
    }

    pub fn message(&self, channel_id: u64, message_id: u64) -> Option<OutgoingMessage> {
        self.state
            .lock()
            .messages
            .get(&(channel_id, message_id))
            .map(|m| m.body.clone())
    }

    pub fn last_sent(&self, channel_id: u64) -> Option<OutgoingMessage> {
        let state = self.state.lock();
        state
            .sends
            .iter()
            .rev()
            .find(|(channel, _)| *channel == channel_id)
            .and_then(|key| state.messages.get(key))
            .map(|m| m.body.clone())
    }

    pub fn sent_count(&self, channel_id: u64) -> usize {
        self.state
            .lock()
            .sends
            .iter()
            .filter(|(channel, _)| *channel == channel_id)
            .count()
    }

    pub fn edit_count(&self) -> usize {
        self.state.lock().edits
    }

    /// Makes every send to `channel_id` fail with `error`; `None` heals it.
    pub fn fail_sends_to(&self, channel_id: u64, error: Option<ChatError>) {
        let mut state = self.state.lock();
        match error {
            Some(error) => state.failing_sends.insert(channel_id, error),
            None => state.failing_sends.remove(&channel_id),
        };
    }

    /// Stalls reaction reads and message edits for `delay`.
    pub fn delay_reads(&self, delay: Option<Duration>) {
        self.state.lock().read_delay = delay;
    }

    pub fn message_count(&self, channel_id: u64) -> usize {
        self.state
            .lock()
            .messages
            .keys()
            .filter(|(channel, _)| *channel == channel_id)
            .count()
    }

    async fn stall(&self) {
        let delay = self.state.lock().read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn react(&self, channel_id: u64, message_id: u64, emoji: &str, user_id: u64) {
        let mut state = self.state.lock();
        if let Some(message) = state.messages.get_mut(&(channel_id, message_id)) {
            let users = message.reactions.entry(emoji.to_string()).or_default();
            if !users.contains(&user_id) {
                users.push(user_id);
            }
        }
    }

    pub fn unreact(&self, channel_id: u64, message_id: u64, emoji: &str, user_id: u64) {
        let mut state = self.state.lock();
        if let Some(message) = state.messages.get_mut(&(channel_id, message_id)) {
            if let Some(users) = message.reactions.get_mut(emoji) {
                users.retain(|id| *id != user_id);
            }
        }
    }

    pub fn clear_reactions(&self, channel_id: u64, message_id: u64) {
        if let Some(message) = self.state.lock().messages.get_mut(&(channel_id, message_id)) {
            message.reactions.clear();
        }
    }

    /// Every user on `emoji`, the bot included.
    pub fn reactors(&self, channel_id: u64, message_id: u64, emoji: &str) -> Vec<u64> {
        self.state
            .lock()
            .messages
            .get(&(channel_id, message_id))
            .and_then(|m| m.reactions.get(emoji).cloned())
            .unwrap_or_default()
    }

    fn not_found(channel_id: u64, message_id: u64) -> ChatError {
        ChatError::NotFound(format!("message {message_id} in channel {channel_id}"))
    }
}

#[async_trait]
impl ChatGateway for FakeGateway {
    async fn current_user_id(&self) -> Option<u64> {
        Some(self.bot_id)
    }

    async fn send_message(
        &self,
        channel_id: u64,
        message: OutgoingMessage,
    ) -> Result<u64, ChatError> {
        if let Some(err) = self.state.lock().failing_sends.get(&channel_id).cloned() {
            return Err(err);
        }
        let length = message.content.as_deref().map_or(0, |c| c.chars().count());
        if length > MESSAGE_CONTENT_LIMIT {
            return Err(ChatError::Transient(format!(
                "content is {length} characters, limit is {MESSAGE_CONTENT_LIMIT}"
            )));
        }
        let message_id = self.insert(channel_id, self.bot_id, message);
        self.state.lock().sends.push((channel_id, message_id));
        Ok(message_id)
    }

    async fn edit_message(
        &self,
        channel_id: u64,
        message_id: u64,
        message: OutgoingMessage,
    ) -> Result<(), ChatError> {
        self.stall().await;
        let mut state = self.state.lock();
        let stored = state
            .messages
            .get_mut(&(channel_id, message_id))
            .ok_or_else(|| Self::not_found(channel_id, message_id))?;
        if message.content.is_some() {
            stored.body.content = message.content;
        }
        if message.embed.is_some() {
            stored.body.embed = message.embed;
        }
        state.edits += 1;
        Ok(())
    }

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<(), ChatError> {
        self.state
            .lock()
            .messages
            .remove(&(channel_id, message_id))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(channel_id, message_id))
    }

    async fn add_reaction(
        &self,
        channel_id: u64,
        message_id: u64,
        emoji: &str,
    ) -> Result<(), ChatError> {
        if self.message(channel_id, message_id).is_none() {
            return Err(Self::not_found(channel_id, message_id));
        }
        self.react(channel_id, message_id, emoji, self.bot_id);
        Ok(())
    }

    async fn reaction_counts(
        &self,
        channel_id: u64,
        message_id: u64,
    ) -> Result<BTreeMap<String, u64>, ChatError> {
        self.stall().await;
        let state = self.state.lock();
        let message = state
            .messages
            .get(&(channel_id, message_id))
            .ok_or_else(|| Self::not_found(channel_id, message_id))?;
        Ok(message
            .reactions
            .iter()
            .map(|(emoji, users)| {
                let others = users.iter().filter(|id| **id != self.bot_id).count();
                (emoji.clone(), others as u64)
            })
            .collect())
    }

    async fn reaction_users(
        &self,
        channel_id: u64,
        message_id: u64,
        emoji: &str,
    ) -> Result<Vec<u64>, ChatError> {
        self.stall().await;
        if self.message(channel_id, message_id).is_none() {
            return Err(Self::not_found(channel_id, message_id));
        }
        Ok(self
            .reactors(channel_id, message_id, emoji)
            .into_iter()
            .filter(|id| *id != self.bot_id)
            .collect())
    }

    async fn recent_messages(
        &self,
        channel_id: u64,
        limit: u8,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let state = self.state.lock();
        Ok(state
            .messages
            .iter()
            .rev()
            .filter(|((channel, _), _)| *channel == channel_id)
            .take(usize::from(limit))
            .map(|((_, id), message)| ChatMessage {
                id: *id,
                author_id: message.author_id,
                content: message.body.content.clone().unwrap_or_default(),
                attachments: message
                    .body
                    .attachment
                    .iter()
                    .map(|a| a.filename.clone())
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
        self.message(channel_id, message_id)
            .and_then(|m| m.attachment)
            .filter(|a| a.filename == filename)
            .map(|a| a.body)
            .ok_or_else(|| Self::not_found(channel_id, message_id))
    }
}
