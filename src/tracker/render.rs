//! Pure builders for every embed the tracker posts.
//!
//! Output depends only on the arguments, so equal store state yields equal
//! embeds and the reconciler can skip redundant edits.

use std::fmt::Write;

use crate::db::{
    AggregateTotals, AlertRecord, CounterEntry, HourlySplit, Outcome, Participant, PlayerStats,
};
use crate::discord::DiscordEmbed;

const COLOR_OPEN: u32 = 0xf39c12;
const COLOR_WIN: u32 = 0x2ecc71;
const COLOR_LOSS: u32 = 0xe74c3c;
const COLOR_BOARD: u32 = 0x3498db;

pub const EMPTY_BOARD: &str = "Aucune entrée";

fn mention(user_id: u64) -> String {
    format!("<@{user_id}>")
}

pub fn alert_title(team: Option<i32>) -> String {
    match team {
        Some(team) => format!("🛡️ Alerte défense (équipe {team})"),
        None => "🛡️ Alerte défense".to_string(),
    }
}

pub fn status_line(outcome: Option<Outcome>, incomplete: bool) -> String {
    let base = match outcome {
        Some(Outcome::Win) => "🏆 Victoire",
        Some(Outcome::Loss) => "❌ Défaite",
        Some(Outcome::Undecided) | None => "⏳ En cours",
    };
    if incomplete {
        format!("{base} · 😡 Incomplète")
    } else {
        base.to_string()
    }
}

/// Defenders are listed in the order they joined.
pub fn alert_embed(alert: &AlertRecord, participants: &[Participant]) -> DiscordEmbed {
    let creator = match alert.creator_id {
        Some(id) => format!("Déclenchée par {}", mention(id)),
        None => "Déclenchée par un inconnu".to_string(),
    };
    let defenders = if participants.is_empty() {
        "Aucun défenseur pour l'instant".to_string()
    } else {
        participants
            .iter()
            .map(|p| mention(p.user_id))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let color = match alert.outcome {
        Some(Outcome::Win) => COLOR_WIN,
        Some(Outcome::Loss) => COLOR_LOSS,
        _ => COLOR_OPEN,
    };

    DiscordEmbed::new(alert_title(alert.team))
        .description(creator)
        .color(color)
        .field(format!("Défenseurs ({})", participants.len()), defenders, false)
        .field("Statut", status_line(alert.outcome, alert.incomplete), false)
        .timestamp(alert.created_ts)
}

fn ranking(entries: &[CounterEntry]) -> String {
    if entries.is_empty() {
        return EMPTY_BOARD.to_string();
    }
    let mut out = String::new();
    for (rank, entry) in entries.iter().enumerate() {
        if rank > 0 {
            out.push('\n');
        }
        let _ = write!(out, "**{}.** {} : {}", rank + 1, mention(entry.user_id), entry.count);
    }
    out
}

fn totals_block(totals: &AggregateTotals) -> String {
    format!(
        "Attaques : {}\nVictoires : {}\nDéfaites : {}\nIncomplètes : {}\nRatio : {}%",
        totals.total,
        totals.wins,
        totals.losses,
        totals.incomplete,
        totals.ratio_percent()
    )
}

fn hourly_block(split: &HourlySplit) -> String {
    format!(
        "Matin (6h-10h) : {}\nJournée (10h-18h) : {}\nSoir (18h-24h) : {}\nNuit (0h-6h) : {}",
        split.morning, split.afternoon, split.evening, split.night
    )
}

pub fn defense_board(
    top: &[CounterEntry],
    totals: &AggregateTotals,
    hourly: &HourlySplit,
) -> DiscordEmbed {
    DiscordEmbed::new("🛡️ Classement des défenseurs")
        .color(COLOR_BOARD)
        .description(ranking(top))
        .field("Statistiques globales", totals_block(totals), true)
        .field("Répartition horaire", hourly_block(hourly), true)
}

pub fn pinger_board(top: &[CounterEntry]) -> DiscordEmbed {
    DiscordEmbed::new("📣 Classement des pingeurs")
        .color(COLOR_BOARD)
        .description(ranking(top))
}

pub fn stats_embed(user_id: u64, stats: &PlayerStats) -> DiscordEmbed {
    DiscordEmbed::new("📊 Statistiques")
        .color(COLOR_BOARD)
        .description(mention(user_id))
        .field("Défenses", stats.defenses.to_string(), true)
        .field("Alertes", stats.pings.to_string(), true)
        .field("Victoires", stats.wins.to_string(), true)
        .field("Défaites", stats.losses.to_string(), true)
        .field("Ratio", format!("{}%", stats.ratio_percent()), true)
}
