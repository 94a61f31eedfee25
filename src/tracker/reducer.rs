use std::collections::BTreeMap;

use crate::config::EmojiConfig;
use crate::db::Outcome;

/// Live reaction counts on an alert, the bot's own reactions excluded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReactionTally {
    pub join: u64,
    pub victory: u64,
    pub defeat: u64,
    pub incomplete: u64,
}

impl ReactionTally {
    pub fn from_counts(counts: &BTreeMap<String, u64>, emojis: &EmojiConfig) -> Self {
        let count = |emoji: &str| counts.get(emoji).copied().unwrap_or(0);
        Self {
            join: count(&emojis.join),
            victory: count(&emojis.victory),
            defeat: count(&emojis.defeat),
            incomplete: count(&emojis.incomplete),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: Outcome,
    pub incomplete: bool,
}

/// Contested votes collapse to `Undecided` so they never bias aggregates.
pub fn reduce(tally: &ReactionTally) -> Verdict {
    let outcome = match (tally.victory > 0, tally.defeat > 0) {
        (true, false) => Outcome::Win,
        (false, true) => Outcome::Loss,
        _ => Outcome::Undecided,
    };
    Verdict {
        outcome,
        incomplete: tally.incomplete > 0,
    }
}
