use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::TrackerError;
use super::incident::IncidentReporter;
use super::render;
use crate::db::{AlertStore, BoardPost, CounterKind};
use crate::discord::{ChatGateway, DiscordEmbed, OutgoingMessage, with_deadline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Unchanged,
    Edited,
    Created,
}

/// Keeps one leaderboard post per guild and counter kind in sync with the
/// store.
pub struct BoardReconciler {
    store: Arc<dyn AlertStore>,
    chat: Arc<dyn ChatGateway>,
    channel_id: u64,
    leaderboard_size: i64,
    chat_timeout_secs: u64,
    incidents: Arc<IncidentReporter>,
    /// Last embed applied to each post, with the post's message id.
    rendered: DashMap<(u64, CounterKind), (u64, DiscordEmbed)>,
}

impl BoardReconciler {
    pub fn new(
        store: Arc<dyn AlertStore>,
        chat: Arc<dyn ChatGateway>,
        channel_id: u64,
        leaderboard_size: i64,
        chat_timeout_secs: u64,
        incidents: Arc<IncidentReporter>,
    ) -> Self {
        Self {
            store,
            chat,
            channel_id,
            leaderboard_size,
            chat_timeout_secs,
            incidents,
            rendered: DashMap::new(),
        }
    }

    /// Drains reconcile requests. Requests arriving within `window` of the
    /// first one are merged, and each guild is rendered once per batch from
    /// the state current at that moment.
    pub async fn run(self: Arc<Self>, mut requests: mpsc::UnboundedReceiver<u64>, window: Duration) {
        while let Some(guild_id) = requests.recv().await {
            let mut pending = BTreeSet::from([guild_id]);
            let deadline = Instant::now() + window;
            loop {
                match tokio::time::timeout_at(deadline, requests.recv()).await {
                    Ok(Some(guild_id)) => {
                        pending.insert(guild_id);
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            for guild_id in pending {
                self.reconcile_guild(guild_id).await;
            }
        }
        info!("leaderboard reconciler stopped");
    }

    pub async fn reconcile_guild(&self, guild_id: u64) {
        for kind in CounterKind::ALL {
            match self.reconcile_board(guild_id, kind).await {
                Ok(action) => debug!(guild_id, kind = %kind, ?action, "leaderboard reconciled"),
                Err(err) => {
                    warn!(guild_id, kind = %kind, "leaderboard reconcile failed: {err}");
                    self.incidents
                        .report(&format!("classement {kind} non mis à jour (serveur {guild_id})"), &err)
                        .await;
                }
            }
        }
    }

    pub async fn render_board(
        &self,
        guild_id: u64,
        kind: CounterKind,
    ) -> Result<DiscordEmbed, TrackerError> {
        let top = self
            .store
            .get_top(guild_id, kind, self.leaderboard_size)
            .await?;
        Ok(match kind {
            CounterKind::Defense => {
                let totals = self.store.agg_totals_all(guild_id).await?;
                let hourly = self.store.hourly_split_all(guild_id).await?;
                render::defense_board(&top, &totals, &hourly)
            }
            CounterKind::Pinger => render::pinger_board(&top),
        })
    }

    pub async fn reconcile_board(
        &self,
        guild_id: u64,
        kind: CounterKind,
    ) -> Result<ReconcileAction, TrackerError> {
        let embed = self.render_board(guild_id, kind).await?;

        if let Some(post) = self.store.get_board_post(guild_id, kind).await? {
            let unchanged = self
                .rendered
                .get(&(guild_id, kind))
                .is_some_and(|cached| cached.0 == post.message_id && cached.1 == embed);
            if unchanged {
                return Ok(ReconcileAction::Unchanged);
            }

            let edit = with_deadline(
                self.chat_timeout_secs,
                self.chat.edit_message(
                    post.channel_id,
                    post.message_id,
                    OutgoingMessage::embed(embed.clone()),
                ),
            )
            .await;
            match edit {
                Ok(()) => {
                    self.remember(guild_id, kind, post.message_id, embed);
                    return Ok(ReconcileAction::Edited);
                }
                Err(err) if err.is_not_found() => {
                    info!(guild_id, kind = %kind, message_id = post.message_id, "leaderboard post vanished, recreating");
                    self.store.clear_board_post(guild_id, kind).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let message_id = with_deadline(
            self.chat_timeout_secs,
            self.chat
                .send_message(self.channel_id, OutgoingMessage::embed(embed.clone())),
        )
        .await?;
        let pointer = BoardPost {
            guild_id,
            kind,
            channel_id: self.channel_id,
            message_id,
        };
        if let Err(err) = self.store.set_board_post(&pointer).await {
            // An untracked post would never be edited again.
            let cleanup = with_deadline(
                self.chat_timeout_secs,
                self.chat.delete_message(self.channel_id, message_id),
            )
            .await;
            if let Err(cleanup_err) = cleanup {
                warn!(guild_id, kind = %kind, message_id, "could not remove untracked post: {cleanup_err}");
            }
            return Err(err.into());
        }
        self.remember(guild_id, kind, message_id, embed);
        Ok(ReconcileAction::Created)
    }

    fn remember(&self, guild_id: u64, kind: CounterKind, message_id: u64, embed: DiscordEmbed) {
        self.rendered.insert((guild_id, kind), (message_id, embed));
    }
}
