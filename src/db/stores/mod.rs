use std::collections::BTreeMap;

use async_trait::async_trait;

use super::DatabaseError;
use super::models::{
    AggregateSeed, AggregateTotals, AlertRecord, BoardPost, CounterEntry, CounterKind,
    HourlySplit, Outcome, Participant, ParticipantSource, PlayerStats, PurgedAlert,
};

/// Durable state of the alert tracker.
///
/// Every write is serialized through a single writer; composite operations
/// (`record_alert`, `join_defense`, `leave_defense`, `apply_verdict`,
/// `purge_alert`) run in one transaction so readers never observe a
/// participant row without its counter contribution.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Creates the alert if absent. An existing row keeps its creation
    /// fields; only a missing `team` may be filled in.
    async fn upsert_alert(&self, alert: &AlertRecord) -> Result<(), DatabaseError>;
    async fn get_alert(&self, message_id: u64) -> Result<Option<AlertRecord>, DatabaseError>;
    async fn set_outcome(&self, message_id: u64, outcome: Outcome) -> Result<(), DatabaseError>;
    async fn set_incomplete(&self, message_id: u64, incomplete: bool)
    -> Result<(), DatabaseError>;

    /// Returns `false` when the participant already exists.
    async fn add_participant(
        &self,
        message_id: u64,
        user_id: u64,
        added_by: Option<u64>,
        source: ParticipantSource,
    ) -> Result<bool, DatabaseError>;
    async fn remove_participant(&self, message_id: u64, user_id: u64)
    -> Result<bool, DatabaseError>;
    /// Participants in insertion order.
    async fn list_participants(&self, message_id: u64) -> Result<Vec<Participant>, DatabaseError>;

    async fn incr_counter(
        &self,
        guild_id: u64,
        kind: CounterKind,
        user_id: u64,
    ) -> Result<(), DatabaseError>;
    /// Returns whether a counter was decremented. Rows reaching zero are deleted.
    async fn decr_counter(
        &self,
        guild_id: u64,
        kind: CounterKind,
        user_id: u64,
    ) -> Result<bool, DatabaseError>;

    /// Upserts the alert and credits the creator's pinger counter when the
    /// row is new. Returns whether the alert was created.
    async fn record_alert(&self, alert: &AlertRecord) -> Result<bool, DatabaseError>;
    async fn join_defense(
        &self,
        message_id: u64,
        guild_id: u64,
        user_id: u64,
        added_by: Option<u64>,
        source: ParticipantSource,
    ) -> Result<bool, DatabaseError>;
    async fn leave_defense(
        &self,
        message_id: u64,
        guild_id: u64,
        user_id: u64,
    ) -> Result<bool, DatabaseError>;
    async fn apply_verdict(
        &self,
        message_id: u64,
        outcome: Outcome,
        incomplete: bool,
    ) -> Result<(), DatabaseError>;
    /// Rolls back every counter the alert contributed, then deletes it with
    /// its participants.
    async fn purge_alert(&self, message_id: u64) -> Result<Option<PurgedAlert>, DatabaseError>;
    async fn delete_alert_cascade(&self, message_id: u64) -> Result<bool, DatabaseError>;

    async fn get_top(
        &self,
        guild_id: u64,
        kind: CounterKind,
        limit: i64,
    ) -> Result<Vec<CounterEntry>, DatabaseError>;
    async fn counters_by_kind(
        &self,
        guild_id: u64,
        kind: CounterKind,
    ) -> Result<BTreeMap<u64, i64>, DatabaseError>;
    async fn has_counters(&self, guild_id: u64) -> Result<bool, DatabaseError>;
    async fn get_player_stats(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<PlayerStats, DatabaseError>;
    async fn agg_totals_all(&self, guild_id: u64) -> Result<AggregateTotals, DatabaseError>;
    async fn agg_totals_by_team(
        &self,
        guild_id: u64,
        team: i32,
    ) -> Result<AggregateTotals, DatabaseError>;
    async fn hourly_split_all(&self, guild_id: u64) -> Result<HourlySplit, DatabaseError>;
    async fn known_guilds(&self) -> Result<Vec<u64>, DatabaseError>;

    /// Sets the listed users' counters; users not listed are left alone.
    async fn seed_counters(
        &self,
        guild_id: u64,
        kind: CounterKind,
        counts: &BTreeMap<u64, i64>,
    ) -> Result<(), DatabaseError>;
    async fn seed_aggregates(
        &self,
        guild_id: u64,
        seed: &AggregateSeed,
    ) -> Result<(), DatabaseError>;

    async fn get_board_post(
        &self,
        guild_id: u64,
        kind: CounterKind,
    ) -> Result<Option<BoardPost>, DatabaseError>;
    async fn set_board_post(&self, post: &BoardPost) -> Result<(), DatabaseError>;
    async fn clear_board_post(&self, guild_id: u64, kind: CounterKind)
    -> Result<(), DatabaseError>;
    /// Drops the pointer to `message_id` if it is a leaderboard post and
    /// returns its guild.
    async fn clear_board_post_by_message(
        &self,
        message_id: u64,
    ) -> Result<Option<u64>, DatabaseError>;
}
