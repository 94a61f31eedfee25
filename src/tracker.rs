//! Alert and defense tracking.
//!
//! Chat events are normalised into [`AlertEvent`]s and applied to the store
//! one alert at a time. After every write the alert's live reactions are
//! read back from the chat platform, so the platform stays the source of
//! truth even when events arrive late, twice, or out of order.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub mod error;
pub mod incident;
pub mod ordering;
pub mod reconciler;
pub mod reducer;
pub mod render;
pub mod snapshot;

pub use self::error::{SnapshotError, TrackerError};
pub use self::incident::IncidentReporter;
pub use self::reconciler::{BoardReconciler, ReconcileAction};
pub use self::reducer::{ReactionTally, Verdict, reduce};
pub use self::snapshot::{SnapshotEnvelope, SnapshotService};

use self::ordering::KeyedLocks;
use crate::config::{Config, EmojiConfig, RolesConfig};
use crate::db::{AlertRecord, AlertStore, ParticipantSource};
use crate::discord::command_handler::{AdminCommand, CommandCaller};
use crate::discord::{ChatError, ChatGateway, OutgoingMessage, PanelButton, with_deadline};

pub const BUTTON_DEFENSE: &str = "alert:def";
pub const BUTTON_DEFENSE_2: &str = "alert:def2";
pub const BUTTON_TEST: &str = "alert:test";

/// Which alert-panel button was pressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertRole {
    Defense,
    Defense2,
    Test,
}

impl AlertRole {
    pub const ALL: [AlertRole; 3] = [AlertRole::Defense, AlertRole::Defense2, AlertRole::Test];

    pub fn from_custom_id(custom_id: &str) -> Option<Self> {
        match custom_id {
            BUTTON_DEFENSE => Some(AlertRole::Defense),
            BUTTON_DEFENSE_2 => Some(AlertRole::Defense2),
            BUTTON_TEST => Some(AlertRole::Test),
            _ => None,
        }
    }

    pub fn custom_id(&self) -> &'static str {
        match self {
            AlertRole::Defense => BUTTON_DEFENSE,
            AlertRole::Defense2 => BUTTON_DEFENSE_2,
            AlertRole::Test => BUTTON_TEST,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AlertRole::Defense => "Défense 1",
            AlertRole::Defense2 => "Défense 2",
            AlertRole::Test => "Test",
        }
    }

    pub fn team(&self) -> Option<i32> {
        match self {
            AlertRole::Defense => Some(1),
            AlertRole::Defense2 => Some(2),
            AlertRole::Test => None,
        }
    }

    pub fn role_id(&self, roles: &RolesConfig) -> Option<u64> {
        let role = match self {
            AlertRole::Defense => Some(roles.defense),
            AlertRole::Defense2 => roles.defense_2,
            AlertRole::Test => roles.test,
        };
        role.filter(|id| *id != 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertEvent {
    ReactionAdded {
        message_id: u64,
        user_id: u64,
        emoji: String,
    },
    ReactionRemoved {
        message_id: u64,
        user_id: u64,
        emoji: String,
    },
    /// Every reaction, or every reaction of one emoji, was removed at once.
    ReactionsCleared { message_id: u64 },
    MessageDeleted { message_id: u64 },
}

impl AlertEvent {
    pub fn message_id(&self) -> u64 {
        match self {
            AlertEvent::ReactionAdded { message_id, .. }
            | AlertEvent::ReactionRemoved { message_id, .. }
            | AlertEvent::ReactionsCleared { message_id }
            | AlertEvent::MessageDeleted { message_id } => *message_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub alert_channel_id: u64,
    pub leaderboard_channel_id: u64,
    pub snapshot_channel_id: Option<u64>,
    pub incident_channel_id: Option<u64>,
    pub roles: RolesConfig,
    pub emojis: EmojiConfig,
    pub leaderboard_size: i64,
    pub coalesce_window: Duration,
    pub chat_timeout_secs: u64,
    pub snapshot_interval: Duration,
}

impl TrackerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            alert_channel_id: config.discord.alert_channel_id,
            leaderboard_channel_id: config.discord.leaderboard_channel_id,
            snapshot_channel_id: config.discord.snapshot_channel_id,
            incident_channel_id: config.discord.incident_channel_id,
            roles: config.roles.clone(),
            emojis: config.tracker.emojis.clone(),
            leaderboard_size: config.tracker.leaderboard_size,
            coalesce_window: Duration::from_millis(config.tracker.coalesce_window_ms),
            chat_timeout_secs: config.tracker.chat_timeout_secs,
            snapshot_interval: Duration::from_secs(config.tracker.snapshot_interval_secs),
        }
    }
}

pub struct AlertTracker {
    store: Arc<dyn AlertStore>,
    chat: Arc<dyn ChatGateway>,
    settings: TrackerSettings,
    reconciler: Arc<BoardReconciler>,
    snapshots: Arc<SnapshotService>,
    reconcile_tx: mpsc::UnboundedSender<u64>,
    reconcile_rx: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
    alert_locks: KeyedLocks,
    incidents: Arc<IncidentReporter>,
}

impl AlertTracker {
    pub fn new(
        store: Arc<dyn AlertStore>,
        chat: Arc<dyn ChatGateway>,
        settings: TrackerSettings,
    ) -> Self {
        let incidents = Arc::new(IncidentReporter::new(
            chat.clone(),
            settings.incident_channel_id,
            settings.chat_timeout_secs,
        ));
        let reconciler = Arc::new(BoardReconciler::new(
            store.clone(),
            chat.clone(),
            settings.leaderboard_channel_id,
            settings.leaderboard_size,
            settings.chat_timeout_secs,
            incidents.clone(),
        ));
        let snapshots = Arc::new(SnapshotService::new(
            store.clone(),
            chat.clone(),
            settings.snapshot_channel_id,
            settings.chat_timeout_secs,
            incidents.clone(),
        ));
        let (reconcile_tx, reconcile_rx) = mpsc::unbounded_channel();

        Self {
            store,
            chat,
            settings,
            reconciler,
            snapshots,
            reconcile_tx,
            reconcile_rx: Mutex::new(Some(reconcile_rx)),
            alert_locks: KeyedLocks::default(),
            incidents,
        }
    }

    /// Spawns the leaderboard reconciler and, when a snapshot channel is
    /// configured, the periodic snapshot task. Later calls are no-ops.
    pub fn start_background_tasks(&self) {
        let Some(requests) = self.reconcile_rx.lock().take() else {
            return;
        };
        tokio::spawn(
            self.reconciler
                .clone()
                .run(requests, self.settings.coalesce_window),
        );
        if self.snapshots.is_configured() {
            tokio::spawn(
                self.snapshots
                    .clone()
                    .run_periodic(self.settings.snapshot_interval),
            );
        }
        info!("tracker background tasks started");
    }

    pub fn reconciler(&self) -> &BoardReconciler {
        &self.reconciler
    }

    pub fn snapshots(&self) -> &SnapshotService {
        &self.snapshots
    }

    pub fn request_reconcile(&self, guild_id: u64) {
        if self.reconcile_tx.send(guild_id).is_err() {
            warn!(guild_id, "leaderboard reconciler is gone, dropping request");
        }
    }

    /// Called once the gateway is ready: restores empty guilds from their
    /// latest snapshot and brings their leaderboards up to date.
    pub async fn on_ready(&self, guild_ids: Vec<u64>) {
        let mut guilds: BTreeSet<u64> = guild_ids.into_iter().collect();
        match self.store.known_guilds().await {
            Ok(known) => guilds.extend(known),
            Err(err) => warn!("could not list stored guilds: {err}"),
        }

        for guild_id in guilds {
            if self.snapshots.is_configured() {
                match self.snapshots.restore(guild_id).await {
                    Ok(true) => info!(guild_id, "guild restored from snapshot"),
                    Ok(false) => {}
                    Err(err) => warn!(guild_id, "snapshot restore failed: {err}"),
                }
            }
            self.request_reconcile(guild_id);
        }
    }

    /// Posts an alert for `role` in the alert channel and starts tracking it.
    pub async fn trigger_alert(
        &self,
        guild_id: u64,
        user_id: u64,
        role: AlertRole,
    ) -> Result<u64, TrackerError> {
        let result = self.post_alert(guild_id, user_id, role).await;
        if let Err(err) = &result {
            if err.is_store() {
                self.incidents
                    .report(&format!("alerte non enregistrée (serveur {guild_id})"), err)
                    .await;
            }
        }
        result
    }

    async fn post_alert(
        &self,
        guild_id: u64,
        user_id: u64,
        role: AlertRole,
    ) -> Result<u64, TrackerError> {
        let role_id = role
            .role_id(&self.settings.roles)
            .ok_or_else(|| TrackerError::Unavailable("rôle non configuré".to_string()))?;

        let now = Utc::now().timestamp();
        let mut record = AlertRecord {
            message_id: 0,
            guild_id,
            channel_id: self.settings.alert_channel_id,
            created_ts: now,
            creator_id: Some(user_id),
            team: role.team(),
            outcome: None,
            incomplete: false,
            last_ts: now,
        };
        let message = OutgoingMessage {
            content: Some(format!("<@&{role_id}> 🚨 Défense demandée par <@{user_id}> !")),
            embed: Some(render::alert_embed(&record, &[])),
            mention_roles: vec![role_id],
            ..OutgoingMessage::default()
        };

        let sent = with_deadline(
            self.settings.chat_timeout_secs,
            self.chat.send_message(self.settings.alert_channel_id, message),
        )
        .await;
        record.message_id = match sent {
            Ok(message_id) => message_id,
            Err(err @ (ChatError::NotFound(_) | ChatError::PermissionDenied(_))) => {
                warn!(guild_id, role_id, "cannot post alert: {err}");
                return Err(TrackerError::Unavailable(
                    "salon d'alerte introuvable ou inaccessible".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        if let Err(err) = self.store.record_alert(&record).await {
            // An unrecorded alert would ignore every reaction.
            let cleanup = with_deadline(
                self.settings.chat_timeout_secs,
                self.chat.delete_message(record.channel_id, record.message_id),
            )
            .await;
            if let Err(cleanup_err) = cleanup {
                warn!(guild_id, message_id = record.message_id, "could not remove unrecorded alert: {cleanup_err}");
            }
            return Err(err.into());
        }
        info!(
            guild_id,
            message_id = record.message_id,
            creator_id = user_id,
            team = ?record.team,
            "alert created"
        );

        for emoji in self.settings.emojis.all() {
            let seeded = with_deadline(
                self.settings.chat_timeout_secs,
                self.chat
                    .add_reaction(record.channel_id, record.message_id, emoji),
            )
            .await;
            if let Err(err) = seeded {
                warn!(message_id = record.message_id, emoji, "could not seed reaction: {err}");
            }
        }

        self.request_reconcile(guild_id);
        Ok(record.message_id)
    }

    /// Applies one chat event. Failures are logged and never propagate, so a
    /// bad event cannot block the ones behind it.
    pub async fn handle_event(&self, event: AlertEvent) {
        let message_id = event.message_id();
        let _ordered = self.alert_locks.lock(message_id).await;

        if let Err(err) = self.apply_event(&event).await {
            error!(message_id, ?event, "failed to process alert event: {err}");
            if err.is_store() {
                self.incidents
                    .report(&format!("événement perdu pour le message {message_id}"), &err)
                    .await;
            }
        }
    }

    async fn apply_event(&self, event: &AlertEvent) -> Result<(), TrackerError> {
        match event {
            AlertEvent::ReactionAdded {
                message_id,
                user_id,
                emoji,
            } => self.on_reaction(*message_id, *user_id, emoji, true).await,
            AlertEvent::ReactionRemoved {
                message_id,
                user_id,
                emoji,
            } => self.on_reaction(*message_id, *user_id, emoji, false).await,
            AlertEvent::ReactionsCleared { message_id } => {
                let Some(alert) = self.store.get_alert(*message_id).await? else {
                    return Ok(());
                };
                self.sync_alert(&alert).await
            }
            AlertEvent::MessageDeleted { message_id } => self.on_message_deleted(*message_id).await,
        }
    }

    async fn on_reaction(
        &self,
        message_id: u64,
        user_id: u64,
        emoji: &str,
        added: bool,
    ) -> Result<(), TrackerError> {
        let Some(alert) = self.store.get_alert(message_id).await? else {
            return Ok(());
        };
        if self.chat.current_user_id().await == Some(user_id) {
            return Ok(());
        }

        if emoji == self.settings.emojis.join {
            let changed = if added {
                self.store
                    .join_defense(
                        message_id,
                        alert.guild_id,
                        user_id,
                        Some(user_id),
                        ParticipantSource::Reaction,
                    )
                    .await?
            } else {
                self.store
                    .leave_defense(message_id, alert.guild_id, user_id)
                    .await?
            };
            debug!(message_id, user_id, added, changed, "join reaction applied");
        }

        self.sync_alert(&alert).await
    }

    /// Re-projects the live reactions of `alert` into the store, refreshes
    /// its embed and schedules a leaderboard pass.
    async fn sync_alert(&self, alert: &AlertRecord) -> Result<(), TrackerError> {
        let timeout = self.settings.chat_timeout_secs;
        let counts = with_deadline(
            timeout,
            self.chat.reaction_counts(alert.channel_id, alert.message_id),
        )
        .await;

        match counts {
            Ok(counts) => {
                let tally = ReactionTally::from_counts(&counts, &self.settings.emojis);
                let verdict = reduce(&tally);
                if tally.victory + tally.defeat == 0 && alert.outcome.is_none() {
                    // Nobody voted yet: keep the outcome unwritten.
                    self.store
                        .set_incomplete(alert.message_id, verdict.incomplete)
                        .await?;
                } else {
                    self.store
                        .apply_verdict(alert.message_id, verdict.outcome, verdict.incomplete)
                        .await?;
                }
                self.reconcile_participants(alert).await?;
            }
            Err(err) => {
                // The store write stands; the next event re-reads the reactions.
                warn!(message_id = alert.message_id, "could not read live reactions: {err}");
            }
        }

        self.refresh_alert_embed(alert.message_id).await?;
        self.request_reconcile(alert.guild_id);
        Ok(())
    }

    /// Aligns reaction-sourced participants with the users currently on the
    /// join emoji. Manual participants are left alone.
    async fn reconcile_participants(&self, alert: &AlertRecord) -> Result<(), TrackerError> {
        let live = with_deadline(
            self.settings.chat_timeout_secs,
            self.chat.reaction_users(
                alert.channel_id,
                alert.message_id,
                &self.settings.emojis.join,
            ),
        )
        .await;
        let live: BTreeSet<u64> = match live {
            Ok(users) => users.into_iter().collect(),
            Err(err) => {
                warn!(message_id = alert.message_id, "could not list join reactions: {err}");
                return Ok(());
            }
        };

        let stored = self.store.list_participants(alert.message_id).await?;
        let known: BTreeSet<u64> = stored.iter().map(|p| p.user_id).collect();

        for participant in stored
            .iter()
            .filter(|p| p.source == ParticipantSource::Reaction && !live.contains(&p.user_id))
        {
            if self
                .store
                .leave_defense(alert.message_id, alert.guild_id, participant.user_id)
                .await?
            {
                info!(message_id = alert.message_id, user_id = participant.user_id, "dropped stale defender");
            }
        }
        for user_id in live.difference(&known) {
            if self
                .store
                .join_defense(
                    alert.message_id,
                    alert.guild_id,
                    *user_id,
                    Some(*user_id),
                    ParticipantSource::Reaction,
                )
                .await?
            {
                info!(message_id = alert.message_id, user_id, "added missed defender");
            }
        }
        Ok(())
    }

    async fn refresh_alert_embed(&self, message_id: u64) -> Result<(), TrackerError> {
        let Some(alert) = self.store.get_alert(message_id).await? else {
            return Ok(());
        };
        let participants = self.store.list_participants(message_id).await?;
        let embed = render::alert_embed(&alert, &participants);

        let edit = with_deadline(
            self.settings.chat_timeout_secs,
            self.chat
                .edit_message(alert.channel_id, message_id, OutgoingMessage::embed(embed)),
        )
        .await;
        match edit {
            Ok(()) => {}
            Err(err) if err.is_not_found() => debug!(message_id, "alert message is gone, skipping edit"),
            Err(err) => warn!(message_id, "could not update alert embed: {err}"),
        }
        Ok(())
    }

    async fn on_message_deleted(&self, message_id: u64) -> Result<(), TrackerError> {
        if let Some(purged) = self.store.purge_alert(message_id).await? {
            info!(
                message_id,
                guild_id = purged.alert.guild_id,
                defenders = purged.participants.len(),
                "alert deleted, counters rolled back"
            );
            self.request_reconcile(purged.alert.guild_id);
            return Ok(());
        }

        if let Some(guild_id) = self.store.clear_board_post_by_message(message_id).await? {
            info!(message_id, guild_id, "leaderboard post deleted, scheduling repost");
            self.request_reconcile(guild_id);
        }
        Ok(())
    }

    pub async fn execute_command(
        &self,
        caller: &CommandCaller,
        command: AdminCommand,
    ) -> Result<OutgoingMessage, TrackerError> {
        let name = command.name();
        let result = self.run_command(caller, command).await;
        if let Err(err) = &result {
            if err.is_store() {
                self.incidents
                    .report(&format!("commande {name} en échec pour <@{}>", caller.user_id), err)
                    .await;
            }
        }
        result
    }

    async fn run_command(
        &self,
        caller: &CommandCaller,
        command: AdminCommand,
    ) -> Result<OutgoingMessage, TrackerError> {
        if command.requires_admin() && !caller.is_admin(self.settings.roles.admin) {
            return Err(TrackerError::Unauthorized);
        }
        let guild_id = caller.guild_id.ok_or_else(|| {
            TrackerError::InvalidInput("commande disponible uniquement sur un serveur".to_string())
        })?;

        match command {
            AdminCommand::Stats { user_id } => {
                let target = user_id.unwrap_or(caller.user_id);
                let stats = self.store.get_player_stats(guild_id, target).await?;
                Ok(OutgoingMessage::embed(render::stats_embed(target, &stats)))
            }
            AdminCommand::SnapshotSave => {
                let message_id = self.snapshots.save(guild_id).await?;
                Ok(OutgoingMessage::text(format!("Snapshot enregistré (message {message_id}).")))
            }
            AdminCommand::AlertPanel => {
                self.post_alert_panel().await?;
                Ok(OutgoingMessage::text("Panneau d'alerte publié."))
            }
            AdminCommand::AddDefender {
                message_id,
                user_id,
            } => {
                let _ordered = self.alert_locks.lock(message_id).await;
                let alert = self.guild_alert(guild_id, message_id).await?;
                let added = self
                    .store
                    .join_defense(
                        message_id,
                        guild_id,
                        user_id,
                        Some(caller.user_id),
                        ParticipantSource::Manual,
                    )
                    .await?;
                self.refresh_alert_embed(alert.message_id).await?;
                self.request_reconcile(guild_id);
                Ok(OutgoingMessage::text(if added {
                    format!("<@{user_id}> ajouté aux défenseurs.")
                } else {
                    format!("<@{user_id}> défend déjà cette alerte.")
                }))
            }
            AdminCommand::RemoveDefender {
                message_id,
                user_id,
            } => {
                let _ordered = self.alert_locks.lock(message_id).await;
                let alert = self.guild_alert(guild_id, message_id).await?;
                let removed = self
                    .store
                    .leave_defense(message_id, guild_id, user_id)
                    .await?;
                self.refresh_alert_embed(alert.message_id).await?;
                self.request_reconcile(guild_id);
                Ok(OutgoingMessage::text(if removed {
                    format!("<@{user_id}> retiré des défenseurs.")
                } else {
                    format!("<@{user_id}> ne défendait pas cette alerte.")
                }))
            }
        }
    }

    async fn guild_alert(&self, guild_id: u64, message_id: u64) -> Result<AlertRecord, TrackerError> {
        match self.store.get_alert(message_id).await? {
            Some(alert) if alert.guild_id == guild_id => Ok(alert),
            _ => Err(TrackerError::InvalidInput(format!("aucune alerte suivie avec l'id {message_id}"))),
        }
    }

    async fn post_alert_panel(&self) -> Result<u64, TrackerError> {
        let buttons: Vec<PanelButton> = AlertRole::ALL
            .iter()
            .filter(|role| role.role_id(&self.settings.roles).is_some())
            .map(|role| PanelButton {
                custom_id: role.custom_id().to_string(),
                label: role.label().to_string(),
                danger: *role != AlertRole::Test,
            })
            .collect();
        let message = OutgoingMessage {
            content: Some("🚨 **Alerte défense** : clique sur le bouton de ton équipe pour prévenir les défenseurs.".to_string()),
            buttons,
            ..OutgoingMessage::default()
        };
        let message_id = with_deadline(
            self.settings.chat_timeout_secs,
            self.chat.send_message(self.settings.alert_channel_id, message),
        )
        .await?;
        info!(message_id, "alert panel posted");
        Ok(message_id)
    }
}
