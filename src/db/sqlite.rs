use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Europe::Paris;
use diesel::dsl::{exists, sql};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_types::BigInt;
use diesel::sqlite::{Sqlite, SqliteConnection};
use tokio::sync::Mutex as AsyncMutex;

use crate::db::schema_sqlite::{
    aggregate_seeds, alerts, board_posts, counters, hourly_seeds, participants,
};

use super::{
    DatabaseError,
    models::{
        AggregateSeed, AggregateTotals, AlertRecord, BoardPost, CounterEntry, CounterKind,
        HourlySplit, Outcome, Participant, ParticipantSource, PlayerStats, PurgedAlert,
    },
};

pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

pub(crate) const WRITE_LOCK_TIMEOUT_SECS: u64 = 10;

const SCOPE_GLOBAL: &str = "global";
const SCOPE_TEAM_1: &str = "team_1";
const SCOPE_TEAM_2: &str = "team_2";

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

// Discord snowflakes fit in 63 bits; SQLite only has signed integers.
fn to_db_id(id: u64) -> i64 {
    id as i64
}

fn from_db_id(id: i64) -> u64 {
    id as u64
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = alerts)]
#[diesel(check_for_backend(Sqlite))]
struct DbAlert {
    message_id: i64,
    guild_id: i64,
    channel_id: i64,
    created_ts: i64,
    outcome: Option<String>,
    incomplete: bool,
    last_ts: i64,
    creator_id: Option<i64>,
    team: Option<i32>,
}

impl DbAlert {
    fn from_alert(alert: &AlertRecord) -> Self {
        Self {
            message_id: to_db_id(alert.message_id),
            guild_id: to_db_id(alert.guild_id),
            channel_id: to_db_id(alert.channel_id),
            created_ts: alert.created_ts,
            outcome: alert.outcome.map(|outcome| outcome.as_str().to_string()),
            incomplete: alert.incomplete,
            last_ts: alert.last_ts,
            creator_id: alert.creator_id.map(to_db_id),
            team: alert.team,
        }
    }

    fn to_alert(&self) -> Result<AlertRecord, DatabaseError> {
        let outcome = self
            .outcome
            .as_deref()
            .map(str::parse::<Outcome>)
            .transpose()
            .map_err(DatabaseError::Query)?;

        Ok(AlertRecord {
            message_id: from_db_id(self.message_id),
            guild_id: from_db_id(self.guild_id),
            channel_id: from_db_id(self.channel_id),
            created_ts: self.created_ts,
            creator_id: self.creator_id.map(from_db_id),
            team: self.team,
            outcome,
            incomplete: self.incomplete,
            last_ts: self.last_ts,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = participants)]
#[diesel(check_for_backend(Sqlite))]
struct DbParticipant {
    message_id: i64,
    user_id: i64,
    added_by: Option<i64>,
    source: String,
    ts: i64,
}

impl DbParticipant {
    fn to_participant(&self) -> Result<Participant, DatabaseError> {
        Ok(Participant {
            message_id: from_db_id(self.message_id),
            user_id: from_db_id(self.user_id),
            added_by: self.added_by.map(from_db_id),
            source: self.source.parse().map_err(DatabaseError::Query)?,
            ts: self.ts,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = board_posts)]
#[diesel(check_for_backend(Sqlite))]
struct DbBoardPost {
    guild_id: i64,
    kind: String,
    channel_id: i64,
    message_id: i64,
}

impl DbBoardPost {
    fn to_board_post(&self) -> Result<BoardPost, DatabaseError> {
        Ok(BoardPost {
            guild_id: from_db_id(self.guild_id),
            kind: self.kind.parse().map_err(DatabaseError::Query)?,
            channel_id: from_db_id(self.channel_id),
            message_id: from_db_id(self.message_id),
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = aggregate_seeds)]
#[diesel(check_for_backend(Sqlite))]
struct DbAggregateSeed {
    guild_id: i64,
    scope: String,
    attacks: i64,
    wins: i64,
    losses: i64,
    incomplete: i64,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = hourly_seeds)]
#[diesel(check_for_backend(Sqlite))]
struct DbHourlySeed {
    guild_id: i64,
    morning: i64,
    afternoon: i64,
    evening: i64,
    night: i64,
}

pub(crate) fn upsert_alert(
    conn: &mut SqliteConnection,
    alert: &AlertRecord,
) -> Result<bool, DatabaseError> {
    let inserted = diesel::insert_or_ignore_into(alerts::table)
        .values(&DbAlert::from_alert(alert))
        .execute(conn)?;

    if inserted == 0 {
        if let Some(team) = alert.team {
            diesel::update(
                alerts::table
                    .filter(alerts::message_id.eq(to_db_id(alert.message_id)))
                    .filter(alerts::team.is_null()),
            )
            .set(alerts::team.eq(Some(team)))
            .execute(conn)?;
        }
    }

    Ok(inserted > 0)
}

fn get_alert(
    conn: &mut SqliteConnection,
    message_id: u64,
) -> Result<Option<AlertRecord>, DatabaseError> {
    alerts::table
        .filter(alerts::message_id.eq(to_db_id(message_id)))
        .select(DbAlert::as_select())
        .first::<DbAlert>(conn)
        .optional()?
        .map(|alert| alert.to_alert())
        .transpose()
}

fn set_outcome(
    conn: &mut SqliteConnection,
    message_id: u64,
    outcome: Outcome,
) -> Result<(), DatabaseError> {
    diesel::update(alerts::table.filter(alerts::message_id.eq(to_db_id(message_id))))
        .set((
            alerts::outcome.eq(Some(outcome.as_str())),
            alerts::last_ts.eq(now_ts()),
        ))
        .execute(conn)?;
    Ok(())
}

fn set_incomplete(
    conn: &mut SqliteConnection,
    message_id: u64,
    incomplete: bool,
) -> Result<(), DatabaseError> {
    diesel::update(alerts::table.filter(alerts::message_id.eq(to_db_id(message_id))))
        .set((
            alerts::incomplete.eq(incomplete),
            alerts::last_ts.eq(now_ts()),
        ))
        .execute(conn)?;
    Ok(())
}

fn add_participant(
    conn: &mut SqliteConnection,
    message_id: u64,
    user_id: u64,
    added_by: Option<u64>,
    source: ParticipantSource,
) -> Result<bool, DatabaseError> {
    let row = DbParticipant {
        message_id: to_db_id(message_id),
        user_id: to_db_id(user_id),
        added_by: added_by.map(to_db_id),
        source: source.as_str().to_string(),
        ts: now_ts(),
    };
    let inserted = diesel::insert_or_ignore_into(participants::table)
        .values(&row)
        .execute(conn)?;
    Ok(inserted > 0)
}

fn remove_participant(
    conn: &mut SqliteConnection,
    message_id: u64,
    user_id: u64,
) -> Result<bool, DatabaseError> {
    let removed = diesel::delete(
        participants::table
            .filter(participants::message_id.eq(to_db_id(message_id)))
            .filter(participants::user_id.eq(to_db_id(user_id))),
    )
    .execute(conn)?;
    Ok(removed > 0)
}

fn list_participants(
    conn: &mut SqliteConnection,
    message_id: u64,
) -> Result<Vec<Participant>, DatabaseError> {
    // rowid breaks ties between participants inserted within the same second
    let rows = participants::table
        .filter(participants::message_id.eq(to_db_id(message_id)))
        .order(participants::ts.asc())
        .then_order_by(sql::<BigInt>("rowid"))
        .select(DbParticipant::as_select())
        .load::<DbParticipant>(conn)?;
    rows.iter().map(DbParticipant::to_participant).collect()
}

fn incr_counter(
    conn: &mut SqliteConnection,
    guild_id: u64,
    kind: CounterKind,
    user_id: u64,
) -> Result<(), DatabaseError> {
    let (guild, user) = (to_db_id(guild_id), to_db_id(user_id));
    let updated = diesel::update(
        counters::table
            .filter(counters::guild_id.eq(guild))
            .filter(counters::kind.eq(kind.as_str()))
            .filter(counters::user_id.eq(user)),
    )
    .set(counters::count.eq(counters::count + 1))
    .execute(conn)?;

    if updated == 0 {
        diesel::insert_into(counters::table)
            .values((
                counters::guild_id.eq(guild),
                counters::kind.eq(kind.as_str()),
                counters::user_id.eq(user),
                counters::count.eq(1_i64),
            ))
            .execute(conn)?;
    }
    Ok(())
}

fn decr_counter(
    conn: &mut SqliteConnection,
    guild_id: u64,
    kind: CounterKind,
    user_id: u64,
) -> Result<bool, DatabaseError> {
    let (guild, user) = (to_db_id(guild_id), to_db_id(user_id));
    let updated = diesel::update(
        counters::table
            .filter(counters::guild_id.eq(guild))
            .filter(counters::kind.eq(kind.as_str()))
            .filter(counters::user_id.eq(user))
            .filter(counters::count.gt(0)),
    )
    .set(counters::count.eq(counters::count - 1))
    .execute(conn)?;

    diesel::delete(
        counters::table
            .filter(counters::guild_id.eq(guild))
            .filter(counters::kind.eq(kind.as_str()))
            .filter(counters::user_id.eq(user))
            .filter(counters::count.le(0)),
    )
    .execute(conn)?;

    Ok(updated > 0)
}

fn delete_alert_cascade(
    conn: &mut SqliteConnection,
    message_id: u64,
) -> Result<bool, DatabaseError> {
    let id = to_db_id(message_id);
    diesel::delete(participants::table.filter(participants::message_id.eq(id))).execute(conn)?;
    let deleted = diesel::delete(alerts::table.filter(alerts::message_id.eq(id))).execute(conn)?;
    Ok(deleted > 0)
}

fn load_counters(
    conn: &mut SqliteConnection,
    guild_id: u64,
    kind: CounterKind,
    limit: Option<i64>,
) -> Result<Vec<CounterEntry>, DatabaseError> {
    let mut query = counters::table
        .filter(counters::guild_id.eq(to_db_id(guild_id)))
        .filter(counters::kind.eq(kind.as_str()))
        .filter(counters::count.gt(0))
        .order((counters::count.desc(), counters::user_id.asc()))
        .select((counters::user_id, counters::count))
        .into_boxed();
    if let Some(limit) = limit {
        query = query.limit(limit);
    }

    let rows = query.load::<(i64, i64)>(conn)?;
    Ok(rows
        .into_iter()
        .map(|(user_id, count)| CounterEntry {
            user_id: from_db_id(user_id),
            count,
        })
        .collect())
}

fn counter_value(
    conn: &mut SqliteConnection,
    guild_id: u64,
    kind: CounterKind,
    user_id: u64,
) -> Result<i64, DatabaseError> {
    Ok(counters::table
        .filter(counters::guild_id.eq(to_db_id(guild_id)))
        .filter(counters::kind.eq(kind.as_str()))
        .filter(counters::user_id.eq(to_db_id(user_id)))
        .select(counters::count)
        .first::<i64>(conn)
        .optional()?
        .unwrap_or(0))
}

fn decided_defenses(
    conn: &mut SqliteConnection,
    guild_id: u64,
    user_id: u64,
    outcome: Outcome,
) -> Result<i64, DatabaseError> {
    Ok(participants::table
        .inner_join(alerts::table)
        .filter(participants::user_id.eq(to_db_id(user_id)))
        .filter(alerts::guild_id.eq(to_db_id(guild_id)))
        .filter(alerts::outcome.eq(outcome.as_str()))
        .count()
        .get_result::<i64>(conn)?)
}

fn scoped_alerts<'a>(guild_id: u64, team: Option<i32>) -> alerts::BoxedQuery<'a, Sqlite> {
    let mut query = alerts::table
        .filter(alerts::guild_id.eq(to_db_id(guild_id)))
        .into_boxed();
    if let Some(team) = team {
        query = query.filter(alerts::team.eq(team));
    }
    query
}

fn live_totals(
    conn: &mut SqliteConnection,
    guild_id: u64,
    team: Option<i32>,
) -> Result<AggregateTotals, DatabaseError> {
    let total = scoped_alerts(guild_id, team).count().get_result::<i64>(conn)?;
    let wins = scoped_alerts(guild_id, team)
        .filter(alerts::outcome.eq(Outcome::Win.as_str()))
        .count()
        .get_result::<i64>(conn)?;
    let losses = scoped_alerts(guild_id, team)
        .filter(alerts::outcome.eq(Outcome::Loss.as_str()))
        .count()
        .get_result::<i64>(conn)?;
    let incomplete = scoped_alerts(guild_id, team)
        .filter(alerts::incomplete.eq(true))
        .count()
        .get_result::<i64>(conn)?;

    Ok(AggregateTotals {
        wins,
        losses,
        incomplete,
        total,
    })
}

fn seeded_totals(
    conn: &mut SqliteConnection,
    guild_id: u64,
    scope: &str,
) -> Result<AggregateTotals, DatabaseError> {
    let seed = aggregate_seeds::table
        .filter(aggregate_seeds::guild_id.eq(to_db_id(guild_id)))
        .filter(aggregate_seeds::scope.eq(scope))
        .select(DbAggregateSeed::as_select())
        .first::<DbAggregateSeed>(conn)
        .optional()?;

    Ok(seed
        .map(|seed| AggregateTotals {
            wins: seed.wins,
            losses: seed.losses,
            incomplete: seed.incomplete,
            total: seed.attacks,
        })
        .unwrap_or_default())
}

fn team_scope(team: i32) -> String {
    format!("team_{team}")
}

/// Local hour of a unix timestamp in Europe/Paris.
pub(crate) fn local_hour(ts: i64) -> Option<u32> {
    DateTime::<Utc>::from_timestamp(ts, 0).map(|dt| dt.with_timezone(&Paris).hour())
}

pub(crate) fn bucket_into(split: &mut HourlySplit, hour: u32) {
    match hour {
        6..=9 => split.morning += 1,
        10..=17 => split.afternoon += 1,
        18..=23 => split.evening += 1,
        _ => split.night += 1,
    }
}

fn hourly_split(conn: &mut SqliteConnection, guild_id: u64) -> Result<HourlySplit, DatabaseError> {
    let created = alerts::table
        .filter(alerts::guild_id.eq(to_db_id(guild_id)))
        .select(alerts::created_ts)
        .load::<i64>(conn)?;

    let mut split = HourlySplit::default();
    for hour in created.into_iter().filter_map(local_hour) {
        bucket_into(&mut split, hour);
    }

    let seed = hourly_seeds::table
        .filter(hourly_seeds::guild_id.eq(to_db_id(guild_id)))
        .select(DbHourlySeed::as_select())
        .first::<DbHourlySeed>(conn)
        .optional()?
        .map(|seed| HourlySplit {
            morning: seed.morning,
            afternoon: seed.afternoon,
            evening: seed.evening,
            night: seed.night,
        })
        .unwrap_or_default();

    Ok(split.merged(seed))
}

fn purge_alert(
    conn: &mut SqliteConnection,
    message_id: u64,
) -> Result<Option<PurgedAlert>, DatabaseError> {
    let Some(alert) = get_alert(conn, message_id)? else {
        return Ok(None);
    };
    let participants = list_participants(conn, message_id)?;

    for participant in &participants {
        decr_counter(conn, alert.guild_id, CounterKind::Defense, participant.user_id)?;
    }
    if let Some(creator) = alert.creator_id {
        decr_counter(conn, alert.guild_id, CounterKind::Pinger, creator)?;
    }
    delete_alert_cascade(conn, message_id)?;

    Ok(Some(PurgedAlert {
        alert,
        participants,
    }))
}

pub struct SqliteAlertStore {
    pool: SqlitePool,
    write_lock: Arc<AsyncMutex<()>>,
}

impl SqliteAlertStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    async fn read<T, F>(&self, op: F) -> Result<T, DatabaseError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;
            op(&mut conn)
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }

    async fn write<T, F>(&self, op: F) -> Result<T, DatabaseError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
    {
        let _guard = tokio::time::timeout(
            Duration::from_secs(WRITE_LOCK_TIMEOUT_SECS),
            self.write_lock.lock(),
        )
        .await
        .map_err(|_| DatabaseError::LockTimeout(WRITE_LOCK_TIMEOUT_SECS))?;

        self.read(move |conn| conn.immediate_transaction(|conn| op(conn)))
            .await
    }
}

#[async_trait]
impl super::AlertStore for SqliteAlertStore {
    async fn upsert_alert(&self, alert: &AlertRecord) -> Result<(), DatabaseError> {
        let alert = alert.clone();
        self.write(move |conn| upsert_alert(conn, &alert).map(|_| ()))
            .await
    }

    async fn get_alert(&self, message_id: u64) -> Result<Option<AlertRecord>, DatabaseError> {
        self.read(move |conn| get_alert(conn, message_id)).await
    }

    async fn set_outcome(&self, message_id: u64, outcome: Outcome) -> Result<(), DatabaseError> {
        self.write(move |conn| set_outcome(conn, message_id, outcome))
            .await
    }

    async fn set_incomplete(
        &self,
        message_id: u64,
        incomplete: bool,
    ) -> Result<(), DatabaseError> {
        self.write(move |conn| set_incomplete(conn, message_id, incomplete))
            .await
    }

    async fn add_participant(
        &self,
        message_id: u64,
        user_id: u64,
        added_by: Option<u64>,
        source: ParticipantSource,
    ) -> Result<bool, DatabaseError> {
        self.write(move |conn| add_participant(conn, message_id, user_id, added_by, source))
            .await
    }

    async fn remove_participant(
        &self,
        message_id: u64,
        user_id: u64,
    ) -> Result<bool, DatabaseError> {
        self.write(move |conn| remove_participant(conn, message_id, user_id))
            .await
    }

    async fn list_participants(&self, message_id: u64) -> Result<Vec<Participant>, DatabaseError> {
        self.read(move |conn| list_participants(conn, message_id))
            .await
    }

    async fn incr_counter(
        &self,
        guild_id: u64,
        kind: CounterKind,
        user_id: u64,
    ) -> Result<(), DatabaseError> {
        self.write(move |conn| incr_counter(conn, guild_id, kind, user_id))
            .await
    }

    async fn decr_counter(
        &self,
        guild_id: u64,
        kind: CounterKind,
        user_id: u64,
    ) -> Result<bool, DatabaseError> {
        self.write(move |conn| decr_counter(conn, guild_id, kind, user_id))
            .await
    }

    async fn record_alert(&self, alert: &AlertRecord) -> Result<bool, DatabaseError> {
        let alert = alert.clone();
        self.write(move |conn| {
            let created = upsert_alert(conn, &alert)?;
            if created {
                if let Some(creator) = alert.creator_id {
                    incr_counter(conn, alert.guild_id, CounterKind::Pinger, creator)?;
                }
            }
            Ok(created)
        })
        .await
    }

    async fn join_defense(
        &self,
        message_id: u64,
        guild_id: u64,
        user_id: u64,
        added_by: Option<u64>,
        source: ParticipantSource,
    ) -> Result<bool, DatabaseError> {
        self.write(move |conn| {
            let added = add_participant(conn, message_id, user_id, added_by, source)?;
            if added {
                incr_counter(conn, guild_id, CounterKind::Defense, user_id)?;
            }
            Ok(added)
        })
        .await
    }

    async fn leave_defense(
        &self,
        message_id: u64,
        guild_id: u64,
        user_id: u64,
    ) -> Result<bool, DatabaseError> {
        self.write(move |conn| {
            let removed = remove_participant(conn, message_id, user_id)?;
            if removed {
                decr_counter(conn, guild_id, CounterKind::Defense, user_id)?;
            }
            Ok(removed)
        })
        .await
    }

    async fn apply_verdict(
        &self,
        message_id: u64,
        outcome: Outcome,
        incomplete: bool,
    ) -> Result<(), DatabaseError> {
        self.write(move |conn| {
            set_outcome(conn, message_id, outcome)?;
            set_incomplete(conn, message_id, incomplete)
        })
        .await
    }

    async fn purge_alert(&self, message_id: u64) -> Result<Option<PurgedAlert>, DatabaseError> {
        self.write(move |conn| purge_alert(conn, message_id)).await
    }

    async fn delete_alert_cascade(&self, message_id: u64) -> Result<bool, DatabaseError> {
        self.write(move |conn| delete_alert_cascade(conn, message_id))
            .await
    }

    async fn get_top(
        &self,
        guild_id: u64,
        kind: CounterKind,
        limit: i64,
    ) -> Result<Vec<CounterEntry>, DatabaseError> {
        self.read(move |conn| load_counters(conn, guild_id, kind, Some(limit)))
            .await
    }

    async fn counters_by_kind(
        &self,
        guild_id: u64,
        kind: CounterKind,
    ) -> Result<BTreeMap<u64, i64>, DatabaseError> {
        let entries = self
            .read(move |conn| load_counters(conn, guild_id, kind, None))
            .await?;
        Ok(entries
            .into_iter()
            .map(|entry| (entry.user_id, entry.count))
            .collect())
    }

    async fn has_counters(&self, guild_id: u64) -> Result<bool, DatabaseError> {
        self.read(move |conn| {
            Ok(diesel::select(exists(
                counters::table.filter(counters::guild_id.eq(to_db_id(guild_id))),
            ))
            .get_result::<bool>(conn)?)
        })
        .await
    }

    async fn get_player_stats(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<PlayerStats, DatabaseError> {
        self.read(move |conn| {
            Ok(PlayerStats {
                defenses: counter_value(conn, guild_id, CounterKind::Defense, user_id)?,
                pings: counter_value(conn, guild_id, CounterKind::Pinger, user_id)?,
                wins: decided_defenses(conn, guild_id, user_id, Outcome::Win)?,
                losses: decided_defenses(conn, guild_id, user_id, Outcome::Loss)?,
            })
        })
        .await
    }

    async fn agg_totals_all(&self, guild_id: u64) -> Result<AggregateTotals, DatabaseError> {
        self.read(move |conn| {
            let live = live_totals(conn, guild_id, None)?;
            Ok(live.merged(seeded_totals(conn, guild_id, SCOPE_GLOBAL)?))
        })
        .await
    }

    async fn agg_totals_by_team(
        &self,
        guild_id: u64,
        team: i32,
    ) -> Result<AggregateTotals, DatabaseError> {
        self.read(move |conn| {
            let live = live_totals(conn, guild_id, Some(team))?;
            Ok(live.merged(seeded_totals(conn, guild_id, &team_scope(team))?))
        })
        .await
    }

    async fn hourly_split_all(&self, guild_id: u64) -> Result<HourlySplit, DatabaseError> {
        self.read(move |conn| hourly_split(conn, guild_id)).await
    }

    async fn known_guilds(&self) -> Result<Vec<u64>, DatabaseError> {
        self.read(|conn| {
            let mut guilds = BTreeSet::new();
            guilds.extend(
                alerts::table
                    .select(alerts::guild_id)
                    .distinct()
                    .load::<i64>(conn)?,
            );
            guilds.extend(
                counters::table
                    .select(counters::guild_id)
                    .distinct()
                    .load::<i64>(conn)?,
            );
            Ok(guilds.into_iter().map(from_db_id).collect())
        })
        .await
    }

    async fn seed_counters(
        &self,
        guild_id: u64,
        kind: CounterKind,
        counts: &BTreeMap<u64, i64>,
    ) -> Result<(), DatabaseError> {
        let counts = counts.clone();
        self.write(move |conn| {
            for (user_id, count) in counts.into_iter().filter(|(_, count)| *count > 0) {
                diesel::replace_into(counters::table)
                    .values((
                        counters::guild_id.eq(to_db_id(guild_id)),
                        counters::kind.eq(kind.as_str()),
                        counters::user_id.eq(to_db_id(user_id)),
                        counters::count.eq(count),
                    ))
                    .execute(conn)?;
            }
            Ok(())
        })
        .await
    }

    async fn seed_aggregates(
        &self,
        guild_id: u64,
        seed: &AggregateSeed,
    ) -> Result<(), DatabaseError> {
        let seed = *seed;
        self.write(move |conn| {
            let guild = to_db_id(guild_id);
            for (scope, totals) in [
                (SCOPE_GLOBAL, seed.global),
                (SCOPE_TEAM_1, seed.team_1),
                (SCOPE_TEAM_2, seed.team_2),
            ] {
                diesel::replace_into(aggregate_seeds::table)
                    .values(&DbAggregateSeed {
                        guild_id: guild,
                        scope: scope.to_string(),
                        attacks: totals.total,
                        wins: totals.wins,
                        losses: totals.losses,
                        incomplete: totals.incomplete,
                    })
                    .execute(conn)?;
            }

            diesel::replace_into(hourly_seeds::table)
                .values(&DbHourlySeed {
                    guild_id: guild,
                    morning: seed.hourly.morning,
                    afternoon: seed.hourly.afternoon,
                    evening: seed.hourly.evening,
                    night: seed.hourly.night,
                })
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn get_board_post(
        &self,
        guild_id: u64,
        kind: CounterKind,
    ) -> Result<Option<BoardPost>, DatabaseError> {
        self.read(move |conn| {
            board_posts::table
                .filter(board_posts::guild_id.eq(to_db_id(guild_id)))
                .filter(board_posts::kind.eq(kind.as_str()))
                .select(DbBoardPost::as_select())
                .first::<DbBoardPost>(conn)
                .optional()?
                .map(|post| post.to_board_post())
                .transpose()
        })
        .await
    }

    async fn set_board_post(&self, post: &BoardPost) -> Result<(), DatabaseError> {
        let row = DbBoardPost {
            guild_id: to_db_id(post.guild_id),
            kind: post.kind.as_str().to_string(),
            channel_id: to_db_id(post.channel_id),
            message_id: to_db_id(post.message_id),
        };
        self.write(move |conn| {
            diesel::replace_into(board_posts::table)
                .values(&row)
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn clear_board_post(
        &self,
        guild_id: u64,
        kind: CounterKind,
    ) -> Result<(), DatabaseError> {
        self.write(move |conn| {
            diesel::delete(
                board_posts::table
                    .filter(board_posts::guild_id.eq(to_db_id(guild_id)))
                    .filter(board_posts::kind.eq(kind.as_str())),
            )
            .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn clear_board_post_by_message(
        &self,
        message_id: u64,
    ) -> Result<Option<u64>, DatabaseError> {
        self.write(move |conn| {
            let id = to_db_id(message_id);
            let guild = board_posts::table
                .filter(board_posts::message_id.eq(id))
                .select(board_posts::guild_id)
                .first::<i64>(conn)
                .optional()?;
            if guild.is_some() {
                diesel::delete(board_posts::table.filter(board_posts::message_id.eq(id)))
                    .execute(conn)?;
            }
            Ok(guild.map(from_db_id))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;
    use chrono_tz::Europe::Paris;
    use test_case::test_case;

    use diesel::r2d2::{ConnectionManager, Pool};

    use super::{SqliteAlertStore, WRITE_LOCK_TIMEOUT_SECS, bucket_into, local_hour};
    use crate::db::{
        AggregateSeed, AggregateTotals, AlertRecord, AlertStore, BoardPost, CounterEntry,
        CounterKind, DatabaseError, HourlySplit, Outcome, ParticipantSource,
    };
    use crate::testing::{alert, temp_store};

    const GUILD: u64 = 900;

    fn paris_ts(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> i64 {
        Paris
            .with_ymd_and_hms(year, month, day, hour, minute, 0)
            .single()
            .expect("unambiguous local time")
            .timestamp()
    }

    #[tokio::test]
    async fn record_alert_credits_pinger_once() {
        let (_file, store) = temp_store().await;
        let record = alert(1, GUILD, Some(10));

        assert!(store.record_alert(&record).await.expect("record"));
        assert!(!store.record_alert(&record).await.expect("record again"));

        let top = store
            .get_top(GUILD, CounterKind::Pinger, 10)
            .await
            .expect("top");
        assert_eq!(top, vec![CounterEntry { user_id: 10, count: 1 }]);
    }

    #[tokio::test]
    async fn upsert_keeps_creation_fields_and_fills_team() {
        let (_file, store) = temp_store().await;
        let original = alert(1, GUILD, Some(10));
        store.upsert_alert(&original).await.expect("insert");

        let replay = AlertRecord {
            creator_id: Some(99),
            created_ts: original.created_ts + 500,
            team: Some(2),
            ..original.clone()
        };
        store.upsert_alert(&replay).await.expect("upsert");

        let stored = store.get_alert(1).await.expect("get").expect("exists");
        assert_eq!(stored.creator_id, Some(10));
        assert_eq!(stored.created_ts, original.created_ts);
        assert_eq!(stored.team, Some(2));
    }

    #[tokio::test]
    async fn duplicate_participant_is_not_an_error() {
        let (_file, store) = temp_store().await;
        store.upsert_alert(&alert(1, GUILD, None)).await.expect("alert");

        let first = store
            .add_participant(1, 20, Some(20), ParticipantSource::Reaction)
            .await
            .expect("add");
        let second = store
            .add_participant(1, 20, Some(20), ParticipantSource::Reaction)
            .await
            .expect("add again");

        assert!(first);
        assert!(!second);
        assert_eq!(store.list_participants(1).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn participants_come_back_in_insertion_order() {
        let (_file, store) = temp_store().await;
        store.upsert_alert(&alert(1, GUILD, None)).await.expect("alert");
        for user in [30, 10, 20] {
            store
                .join_defense(1, GUILD, user, Some(user), ParticipantSource::Reaction)
                .await
                .expect("join");
        }

        let order: Vec<u64> = store
            .list_participants(1)
            .await
            .expect("list")
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(order, vec![30, 10, 20]);
    }

    #[tokio::test]
    async fn join_then_leave_restores_previous_state() {
        let (_file, store) = temp_store().await;
        store.upsert_alert(&alert(1, GUILD, None)).await.expect("alert");

        assert!(
            store
                .join_defense(1, GUILD, 20, Some(20), ParticipantSource::Reaction)
                .await
                .expect("join")
        );
        assert!(store.leave_defense(1, GUILD, 20).await.expect("leave"));
        assert!(!store.leave_defense(1, GUILD, 20).await.expect("leave again"));

        assert!(store.list_participants(1).await.expect("list").is_empty());
        assert!(!store.has_counters(GUILD).await.expect("has counters"));
    }

    #[tokio::test]
    async fn decrement_of_missing_counter_is_a_no_op() {
        let (_file, store) = temp_store().await;

        let changed = store
            .decr_counter(GUILD, CounterKind::Defense, 42)
            .await
            .expect("decr");

        assert!(!changed);
        assert!(!store.has_counters(GUILD).await.expect("has counters"));
    }

    #[tokio::test]
    async fn counters_reaching_zero_are_deleted() {
        let (_file, store) = temp_store().await;
        store
            .incr_counter(GUILD, CounterKind::Defense, 5)
            .await
            .expect("incr");
        store
            .incr_counter(GUILD, CounterKind::Defense, 5)
            .await
            .expect("incr");
        store
            .decr_counter(GUILD, CounterKind::Defense, 5)
            .await
            .expect("decr");
        assert_eq!(
            store.get_top(GUILD, CounterKind::Defense, 10).await.expect("top"),
            vec![CounterEntry { user_id: 5, count: 1 }]
        );

        store
            .decr_counter(GUILD, CounterKind::Defense, 5)
            .await
            .expect("decr");
        assert!(
            store
                .get_top(GUILD, CounterKind::Defense, 10)
                .await
                .expect("top")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn top_breaks_ties_by_user_id() {
        let (_file, store) = temp_store().await;
        for user in [7, 3, 5, 5] {
            store
                .incr_counter(GUILD, CounterKind::Defense, user)
                .await
                .expect("incr");
        }

        let top = store
            .get_top(GUILD, CounterKind::Defense, 2)
            .await
            .expect("top");
        assert_eq!(
            top,
            vec![
                CounterEntry { user_id: 5, count: 2 },
                CounterEntry { user_id: 3, count: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn purge_rolls_back_every_contribution() {
        let (_file, store) = temp_store().await;
        store.record_alert(&alert(1, GUILD, Some(10))).await.expect("alert");
        store.record_alert(&alert(2, GUILD, Some(10))).await.expect("alert");
        for user in [20, 30] {
            store
                .join_defense(1, GUILD, user, Some(user), ParticipantSource::Reaction)
                .await
                .expect("join");
        }
        store
            .join_defense(2, GUILD, 20, Some(20), ParticipantSource::Reaction)
            .await
            .expect("join");

        let purged = store.purge_alert(1).await.expect("purge").expect("tracked");
        assert_eq!(purged.participants.len(), 2);
        assert!(store.get_alert(1).await.expect("get").is_none());
        assert!(store.list_participants(1).await.expect("list").is_empty());

        let defense = store
            .counters_by_kind(GUILD, CounterKind::Defense)
            .await
            .expect("defense");
        assert_eq!(defense, BTreeMap::from([(20, 1)]));
        let pings = store
            .counters_by_kind(GUILD, CounterKind::Pinger)
            .await
            .expect("pings");
        assert_eq!(pings, BTreeMap::from([(10, 1)]));

        assert!(store.purge_alert(1).await.expect("purge again").is_none());
    }

    #[tokio::test]
    async fn empty_guild_has_zero_totals() {
        let (_file, store) = temp_store().await;
        let totals = store.agg_totals_all(GUILD).await.expect("totals");
        assert_eq!(totals, AggregateTotals::default());
        assert_eq!(totals.ratio_percent(), 0);
    }

    #[tokio::test]
    async fn totals_count_outcomes_per_team() {
        let (_file, store) = temp_store().await;
        let mut team_one = alert(1, GUILD, Some(10));
        team_one.team = Some(1);
        let mut team_two = alert(2, GUILD, Some(10));
        team_two.team = Some(2);
        store.record_alert(&team_one).await.expect("alert");
        store.record_alert(&team_two).await.expect("alert");
        store.record_alert(&alert(3, GUILD, None)).await.expect("alert");

        store.apply_verdict(1, Outcome::Win, true).await.expect("verdict");
        store.apply_verdict(2, Outcome::Loss, false).await.expect("verdict");
        store.apply_verdict(3, Outcome::Undecided, false).await.expect("verdict");

        assert_eq!(
            store.agg_totals_all(GUILD).await.expect("all"),
            AggregateTotals {
                wins: 1,
                losses: 1,
                incomplete: 1,
                total: 3
            }
        );
        assert_eq!(
            store.agg_totals_by_team(GUILD, 2).await.expect("team 2"),
            AggregateTotals {
                wins: 0,
                losses: 1,
                incomplete: 0,
                total: 1
            }
        );
    }

    #[tokio::test]
    async fn player_stats_count_decided_defenses() {
        let (_file, store) = temp_store().await;
        for id in [1, 2, 3] {
            store.record_alert(&alert(id, GUILD, Some(10))).await.expect("alert");
            store
                .join_defense(id, GUILD, 20, Some(20), ParticipantSource::Reaction)
                .await
                .expect("join");
        }
        store.apply_verdict(1, Outcome::Win, false).await.expect("verdict");
        store.apply_verdict(2, Outcome::Win, false).await.expect("verdict");
        store.apply_verdict(3, Outcome::Loss, false).await.expect("verdict");

        let defender = store.get_player_stats(GUILD, 20).await.expect("stats");
        assert_eq!((defender.defenses, defender.pings), (3, 0));
        assert_eq!((defender.wins, defender.losses), (2, 1));

        let pinger = store.get_player_stats(GUILD, 10).await.expect("stats");
        assert_eq!((pinger.defenses, pinger.pings, pinger.wins), (0, 3, 0));
    }

    #[tokio::test]
    async fn hourly_split_respects_bucket_boundaries() {
        let (_file, store) = temp_store().await;
        let times = [
            paris_ts(2024, 1, 15, 5, 59),
            paris_ts(2024, 1, 15, 6, 0),
            paris_ts(2024, 1, 15, 10, 0),
        ];
        for (id, ts) in times.into_iter().enumerate() {
            let mut record = alert(id as u64 + 1, GUILD, None);
            record.created_ts = ts;
            store.upsert_alert(&record).await.expect("alert");
        }

        let split = store.hourly_split_all(GUILD).await.expect("split");
        assert_eq!(
            (split.morning, split.afternoon, split.evening, split.night),
            (1, 1, 0, 1)
        );
    }

    #[test_case(2024, 1, 15, 18, 0, 18 ; "winter evening")]
    #[test_case(2024, 7, 15, 18, 0, 18 ; "summer evening")]
    #[test_case(2024, 7, 15, 0, 30, 0 ; "summer night")]
    fn local_hour_follows_paris_offset(y: i32, m: u32, d: u32, h: u32, min: u32, expected: u32) {
        assert_eq!(local_hour(paris_ts(y, m, d, h, min)), Some(expected));
    }

    #[test]
    fn bucket_edges() {
        let mut split = HourlySplit::default();
        for hour in [0, 5, 6, 9, 10, 17, 18, 23] {
            bucket_into(&mut split, hour);
        }
        assert_eq!(
            split,
            HourlySplit {
                morning: 2,
                afternoon: 2,
                evening: 2,
                night: 2
            }
        );
    }

    #[tokio::test]
    async fn seeded_aggregates_add_to_live_counts() {
        let (_file, store) = temp_store().await;
        let seed = AggregateSeed {
            global: AggregateTotals {
                wins: 6,
                losses: 3,
                incomplete: 1,
                total: 10,
            },
            team_1: AggregateTotals {
                wins: 4,
                losses: 1,
                incomplete: 0,
                total: 5,
            },
            team_2: AggregateTotals::default(),
            hourly: HourlySplit {
                morning: 1,
                afternoon: 2,
                evening: 3,
                night: 4,
            },
        };
        store.seed_aggregates(GUILD, &seed).await.expect("seed");
        store.seed_aggregates(GUILD, &seed).await.expect("seed twice");
        store.record_alert(&alert(1, GUILD, Some(10))).await.expect("alert");
        store.apply_verdict(1, Outcome::Win, false).await.expect("verdict");

        let totals = store.agg_totals_all(GUILD).await.expect("totals");
        assert_eq!((totals.wins, totals.losses, totals.total), (7, 3, 11));
        assert_eq!(
            store.agg_totals_by_team(GUILD, 1).await.expect("team 1"),
            seed.team_1
        );
        let split = store.hourly_split_all(GUILD).await.expect("split");
        assert_eq!(
            split.morning + split.afternoon + split.evening + split.night,
            11
        );
    }

    #[tokio::test]
    async fn seed_counters_skips_non_positive_counts() {
        let (_file, store) = temp_store().await;
        let counts = BTreeMap::from([(111, 5), (222, 3), (333, 0)]);
        store
            .seed_counters(GUILD, CounterKind::Defense, &counts)
            .await
            .expect("seed");

        assert_eq!(
            store.get_top(GUILD, CounterKind::Defense, 10).await.expect("top"),
            vec![
                CounterEntry {
                    user_id: 111,
                    count: 5
                },
                CounterEntry {
                    user_id: 222,
                    count: 3
                },
            ]
        );
    }

    #[tokio::test]
    async fn board_post_pointer_lifecycle() {
        let (_file, store) = temp_store().await;
        let post = BoardPost {
            guild_id: GUILD,
            kind: CounterKind::Defense,
            channel_id: 7,
            message_id: 70,
        };
        store.set_board_post(&post).await.expect("set");
        store
            .set_board_post(&BoardPost {
                message_id: 71,
                ..post
            })
            .await
            .expect("replace");
        assert_eq!(
            store
                .get_board_post(GUILD, CounterKind::Defense)
                .await
                .expect("get")
                .map(|p| p.message_id),
            Some(71)
        );

        assert_eq!(
            store.clear_board_post_by_message(70).await.expect("clear"),
            None
        );
        assert_eq!(
            store.clear_board_post_by_message(71).await.expect("clear"),
            Some(GUILD)
        );
        assert!(
            store
                .get_board_post(GUILD, CounterKind::Defense)
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn known_guilds_include_seeded_only_guilds() {
        let (_file, store) = temp_store().await;
        store.upsert_alert(&alert(1, 1, None)).await.expect("alert");
        store
            .seed_counters(2, CounterKind::Pinger, &BTreeMap::from([(5, 1)]))
            .await
            .expect("seed");

        assert_eq!(store.known_guilds().await.expect("guilds"), vec![1, 2]);
    }

    #[tokio::test]
    async fn outcome_and_incomplete_are_written_independently() {
        let (_file, store) = temp_store().await;
        store.upsert_alert(&alert(1, GUILD, None)).await.expect("alert");

        store.set_outcome(1, Outcome::Loss).await.expect("outcome");
        store.set_incomplete(1, true).await.expect("incomplete");
        let stored = store.get_alert(1).await.expect("get").expect("exists");
        assert_eq!(stored.outcome, Some(Outcome::Loss));
        assert!(stored.incomplete);

        store.set_incomplete(1, false).await.expect("incomplete");
        let stored = store.get_alert(1).await.expect("get").expect("exists");
        assert_eq!(stored.outcome, Some(Outcome::Loss));
        assert!(!stored.incomplete);

        // Unknown alerts are left alone.
        store.set_outcome(2, Outcome::Win).await.expect("outcome");
        assert!(store.get_alert(2).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn removing_a_participant_keeps_counters() {
        let (_file, store) = temp_store().await;
        store.upsert_alert(&alert(1, GUILD, None)).await.expect("alert");
        store
            .join_defense(1, GUILD, 20, Some(20), ParticipantSource::Reaction)
            .await
            .expect("join");

        assert!(store.remove_participant(1, 20).await.expect("remove"));
        assert!(!store.remove_participant(1, 20).await.expect("remove again"));
        assert!(store.list_participants(1).await.expect("list").is_empty());
        assert_eq!(
            store.get_top(GUILD, CounterKind::Defense, 10).await.expect("top"),
            vec![CounterEntry { user_id: 20, count: 1 }]
        );
    }

    #[tokio::test]
    async fn cascade_delete_drops_alert_and_participants_only() {
        let (_file, store) = temp_store().await;
        store.record_alert(&alert(1, GUILD, Some(10))).await.expect("alert");
        store
            .join_defense(1, GUILD, 20, Some(20), ParticipantSource::Reaction)
            .await
            .expect("join");

        assert!(store.delete_alert_cascade(1).await.expect("delete"));
        assert!(!store.delete_alert_cascade(1).await.expect("delete again"));
        assert!(store.get_alert(1).await.expect("get").is_none());
        assert!(store.list_participants(1).await.expect("list").is_empty());

        // Counters are rolled back by purge_alert, not here.
        assert_eq!(
            store
                .counters_by_kind(GUILD, CounterKind::Defense)
                .await
                .expect("defense"),
            BTreeMap::from([(20, 1)])
        );
        assert_eq!(
            store
                .counters_by_kind(GUILD, CounterKind::Pinger)
                .await
                .expect("pings"),
            BTreeMap::from([(10, 1)])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn held_write_lock_times_out() {
        let pool = Pool::builder()
            .max_size(1)
            .build_unchecked(ConnectionManager::new(":memory:"));
        let store = SqliteAlertStore::new(pool);
        let _held = store.write_lock.lock().await;

        let err = store
            .set_outcome(1, Outcome::Win)
            .await
            .expect_err("lock is held");
        assert!(matches!(err, DatabaseError::LockTimeout(WRITE_LOCK_TIMEOUT_SECS)));
    }
}
