use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::incident::IncidentReporter;
use super::{SnapshotError, TrackerError};
use crate::db::{AggregateSeed, AggregateTotals, AlertStore, CounterKind, HourlySplit};
use crate::discord::gateway::{MESSAGE_CONTENT_LIMIT, OutgoingAttachment};
use crate::discord::{ChatError, ChatGateway, ChatMessage, OutgoingMessage, with_deadline};

pub const SCHEMA_VERSION: u64 = 1;
/// How many recent snapshot-channel messages a restore looks at.
pub const RESTORE_SCAN_LIMIT: u8 = 50;
/// Envelopes too long for a message body travel as this attachment.
pub const SNAPSHOT_FILENAME: &str = "snapshot.json";

static ENVELOPE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("envelope pattern is a valid regex")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateBlock {
    pub attacks: i64,
    pub wins: i64,
    pub losses: i64,
    pub incomplete: i64,
}

impl From<AggregateTotals> for AggregateBlock {
    fn from(totals: AggregateTotals) -> Self {
        Self {
            attacks: totals.total,
            wins: totals.wins,
            losses: totals.losses,
            incomplete: totals.incomplete,
        }
    }
}

impl From<AggregateBlock> for AggregateTotals {
    fn from(block: AggregateBlock) -> Self {
        Self {
            wins: block.wins,
            losses: block.losses,
            incomplete: block.incomplete,
            total: block.attacks,
        }
    }
}

/// Everything needed to rebuild a guild's counters and aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEnvelope {
    pub schema_version: u64,
    pub guild_id: u64,
    pub generated_at: DateTime<Utc>,
    pub global: AggregateBlock,
    pub team_1: AggregateBlock,
    pub team_2: AggregateBlock,
    pub hourly_buckets: HourlySplit,
    pub defense_by_user: BTreeMap<u64, i64>,
    pub ping_by_user: BTreeMap<u64, i64>,
}

impl SnapshotEnvelope {
    fn header(&self) -> String {
        format!(
            "📦 Snapshot {} ({})",
            self.guild_id,
            self.generated_at.to_rfc3339()
        )
    }

    fn to_json(&self) -> Result<String, SnapshotError> {
        serde_json::to_string(self).map_err(|e| SnapshotError::Malformed(e.to_string()))
    }

    /// Chat message body: a header line and the envelope in a fenced block.
    pub fn to_message(&self) -> Result<String, SnapshotError> {
        Ok(format!("{}\n```json\n{}\n```", self.header(), self.to_json()?))
    }

    /// The envelope inline when it fits in one message, otherwise the header
    /// alone with the JSON attached as [`SNAPSHOT_FILENAME`].
    pub fn to_outgoing(&self) -> Result<OutgoingMessage, SnapshotError> {
        let inline = self.to_message()?;
        if inline.chars().count() <= MESSAGE_CONTENT_LIMIT {
            return Ok(OutgoingMessage::text(inline));
        }
        Ok(OutgoingMessage {
            content: Some(self.header()),
            attachment: Some(OutgoingAttachment {
                filename: SNAPSHOT_FILENAME.to_string(),
                body: self.to_json()?,
            }),
            ..OutgoingMessage::default()
        })
    }

    pub fn from_message(content: &str) -> Result<Self, SnapshotError> {
        let body = ENVELOPE_BLOCK
            .captures(content)
            .and_then(|captures| captures.get(1))
            .ok_or(SnapshotError::NoEnvelope)?
            .as_str();
        Self::from_json(body)
    }

    pub fn from_json(body: &str) -> Result<Self, SnapshotError> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| SnapshotError::Malformed(e.to_string()))?;
        let version = value
            .get("schema_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| SnapshotError::Malformed("missing schema_version".to_string()))?;
        if version != SCHEMA_VERSION {
            return Err(SnapshotError::SchemaMismatch(version));
        }

        serde_json::from_value(value).map_err(|e| SnapshotError::Malformed(e.to_string()))
    }

    pub fn aggregate_seed(&self) -> AggregateSeed {
        AggregateSeed {
            global: self.global.into(),
            team_1: self.team_1.into(),
            team_2: self.team_2.into(),
            hourly: self.hourly_buckets,
        }
    }
}

pub struct SnapshotService {
    store: Arc<dyn AlertStore>,
    chat: Arc<dyn ChatGateway>,
    channel_id: Option<u64>,
    chat_timeout_secs: u64,
    incidents: Arc<IncidentReporter>,
}

impl SnapshotService {
    pub fn new(
        store: Arc<dyn AlertStore>,
        chat: Arc<dyn ChatGateway>,
        channel_id: Option<u64>,
        chat_timeout_secs: u64,
        incidents: Arc<IncidentReporter>,
    ) -> Self {
        Self {
            store,
            chat,
            channel_id,
            chat_timeout_secs,
            incidents,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.channel_id.is_some()
    }

    pub async fn collect(&self, guild_id: u64) -> Result<SnapshotEnvelope, TrackerError> {
        Ok(SnapshotEnvelope {
            schema_version: SCHEMA_VERSION,
            guild_id,
            generated_at: Utc::now(),
            global: self.store.agg_totals_all(guild_id).await?.into(),
            team_1: self.store.agg_totals_by_team(guild_id, 1).await?.into(),
            team_2: self.store.agg_totals_by_team(guild_id, 2).await?.into(),
            hourly_buckets: self.store.hourly_split_all(guild_id).await?,
            defense_by_user: self
                .store
                .counters_by_kind(guild_id, CounterKind::Defense)
                .await?,
            ping_by_user: self
                .store
                .counters_by_kind(guild_id, CounterKind::Pinger)
                .await?,
        })
    }

    /// Appends a fresh envelope to the snapshot channel and returns its message id.
    pub async fn save(&self, guild_id: u64) -> Result<u64, TrackerError> {
        let channel_id = self.channel_id.ok_or(SnapshotError::NotConfigured)?;
        let envelope = self.collect(guild_id).await?;
        let message = envelope.to_outgoing()?;
        let attached = message.attachment.is_some();
        let message_id = with_deadline(
            self.chat_timeout_secs,
            self.chat.send_message(channel_id, message),
        )
        .await?;
        info!(
            guild_id,
            message_id,
            defenders = envelope.defense_by_user.len(),
            pingers = envelope.ping_by_user.len(),
            attached,
            "snapshot saved"
        );
        Ok(message_id)
    }

    /// Seeds the guild from the newest valid envelope the bot posted, unless
    /// the guild already has counters. Returns whether anything was restored.
    pub async fn restore(&self, guild_id: u64) -> Result<bool, TrackerError> {
        if self.store.has_counters(guild_id).await? {
            debug!(guild_id, "counters present, skipping snapshot restore");
            return Ok(false);
        }
        let channel_id = self.channel_id.ok_or(SnapshotError::NotConfigured)?;
        let bot_id = self
            .chat
            .current_user_id()
            .await
            .ok_or(ChatError::NotConnected)?;

        let messages = with_deadline(
            self.chat_timeout_secs,
            self.chat.recent_messages(channel_id, RESTORE_SCAN_LIMIT),
        )
        .await?;

        for message in messages.iter().filter(|m| m.author_id == bot_id) {
            match self.read_envelope(channel_id, message).await {
                Ok(envelope) if envelope.guild_id == guild_id => {
                    self.apply(&envelope).await?;
                    info!(
                        guild_id,
                        message_id = message.id,
                        generated_at = %envelope.generated_at,
                        "snapshot restored"
                    );
                    return Ok(true);
                }
                Ok(_) => {}
                Err(SnapshotError::SchemaMismatch(version)) => {
                    warn!(guild_id, message_id = message.id, version, "skipping snapshot with unknown schema");
                }
                Err(err @ SnapshotError::Unreadable(_)) => {
                    warn!(guild_id, message_id = message.id, "skipping snapshot: {err}");
                }
                Err(err) => {
                    debug!(guild_id, message_id = message.id, "not a usable snapshot: {err}");
                }
            }
        }

        info!(guild_id, "no snapshot found to restore");
        Ok(false)
    }

    async fn read_envelope(
        &self,
        channel_id: u64,
        message: &ChatMessage,
    ) -> Result<SnapshotEnvelope, SnapshotError> {
        match SnapshotEnvelope::from_message(&message.content) {
            Err(SnapshotError::NoEnvelope)
                if message.attachments.iter().any(|name| name == SNAPSHOT_FILENAME) =>
            {
                let body = with_deadline(
                    self.chat_timeout_secs,
                    self.chat
                        .attachment_text(channel_id, message.id, SNAPSHOT_FILENAME),
                )
                .await
                .map_err(|err| SnapshotError::Unreadable(err.to_string()))?;
                SnapshotEnvelope::from_json(&body)
            }
            parsed => parsed,
        }
    }

    async fn apply(&self, envelope: &SnapshotEnvelope) -> Result<(), TrackerError> {
        let guild_id = envelope.guild_id;
        self.store
            .seed_counters(guild_id, CounterKind::Defense, &envelope.defense_by_user)
            .await?;
        self.store
            .seed_counters(guild_id, CounterKind::Pinger, &envelope.ping_by_user)
            .await?;
        self.store
            .seed_aggregates(guild_id, &envelope.aggregate_seed())
            .await?;
        Ok(())
    }

    /// Saves every known guild each `interval`, first tick one interval in.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let guilds = match self.store.known_guilds().await {
                Ok(guilds) => guilds,
                Err(err) => {
                    warn!("periodic snapshot could not list guilds: {err}");
                    self.incidents
                        .report("snapshot périodique impossible", &err)
                        .await;
                    continue;
                }
            };
            for guild_id in guilds {
                if let Err(err) = self.save(guild_id).await {
                    warn!(guild_id, "periodic snapshot failed: {err}");
                    self.incidents
                        .report(&format!("snapshot du serveur {guild_id} en échec"), &err)
                        .await;
                }
            }
        }
    }
}
