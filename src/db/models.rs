use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Verdict recorded on an alert once at least one reaction event was reduced.
///
/// `Undecided` covers both "no vote yet" and "contested"; an alert whose
/// outcome was never written carries `None` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Win,
    Loss,
    Undecided,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Win => "win",
            Outcome::Loss => "loss",
            Outcome::Undecided => "undecided",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "win" => Ok(Outcome::Win),
            "loss" => Ok(Outcome::Loss),
            "undecided" => Ok(Outcome::Undecided),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

/// Counter family; also identifies the two leaderboard posts of a guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterKind {
    Defense,
    Pinger,
}

impl CounterKind {
    pub const ALL: [CounterKind; 2] = [CounterKind::Defense, CounterKind::Pinger];

    pub fn as_str(&self) -> &'static str {
        match self {
            CounterKind::Defense => "defense",
            CounterKind::Pinger => "pinger",
        }
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CounterKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "defense" => Ok(CounterKind::Defense),
            "pinger" => Ok(CounterKind::Pinger),
            other => Err(format!("unknown counter kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantSource {
    Reaction,
    Manual,
}

impl ParticipantSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantSource::Reaction => "reaction",
            ParticipantSource::Manual => "manual",
        }
    }
}

impl FromStr for ParticipantSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "reaction" => Ok(ParticipantSource::Reaction),
            "manual" => Ok(ParticipantSource::Manual),
            other => Err(format!("unknown participant source: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub message_id: u64,
    pub guild_id: u64,
    pub channel_id: u64,
    /// Unix seconds, UTC.
    pub created_ts: i64,
    pub creator_id: Option<u64>,
    pub team: Option<i32>,
    pub outcome: Option<Outcome>,
    pub incomplete: bool,
    pub last_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub message_id: u64,
    pub user_id: u64,
    pub added_by: Option<u64>,
    pub source: ParticipantSource,
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterEntry {
    pub user_id: u64,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub defenses: i64,
    pub pings: i64,
    pub wins: i64,
    pub losses: i64,
}

impl PlayerStats {
    /// Share of decided defenses that were won, as a rounded percentage.
    pub fn ratio_percent(&self) -> i64 {
        percent(self.wins, self.wins + self.losses)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateTotals {
    pub wins: i64,
    pub losses: i64,
    pub incomplete: i64,
    pub total: i64,
}

impl AggregateTotals {
    pub fn ratio_percent(&self) -> i64 {
        percent(self.wins, self.total)
    }

    pub fn merged(self, seed: AggregateTotals) -> AggregateTotals {
        AggregateTotals {
            wins: self.wins + seed.wins,
            losses: self.losses + seed.losses,
            incomplete: self.incomplete + seed.incomplete,
            total: self.total + seed.total,
        }
    }
}

/// Alert counts by local (Europe/Paris) creation hour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlySplit {
    /// [06, 10)
    pub morning: i64,
    /// [10, 18)
    pub afternoon: i64,
    /// [18, 24)
    pub evening: i64,
    /// [00, 06)
    pub night: i64,
}

impl HourlySplit {
    pub fn merged(self, seed: HourlySplit) -> HourlySplit {
        HourlySplit {
            morning: self.morning + seed.morning,
            afternoon: self.afternoon + seed.afternoon,
            evening: self.evening + seed.evening,
            night: self.night + seed.night,
        }
    }
}

/// Baseline aggregates restored from a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateSeed {
    pub global: AggregateTotals,
    pub team_1: AggregateTotals,
    pub team_2: AggregateTotals,
    pub hourly: HourlySplit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardPost {
    pub guild_id: u64,
    pub kind: CounterKind,
    pub channel_id: u64,
    pub message_id: u64,
}

/// What `purge_alert` removed, for logging and leaderboard refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgedAlert {
    pub alert: AlertRecord,
    pub participants: Vec<Participant>,
}

fn percent(part: i64, whole: i64) -> i64 {
    if whole <= 0 {
        return 0;
    }
    (part * 100 + whole / 2) / whole
}
