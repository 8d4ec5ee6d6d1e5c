//! Core domain model for the pick'em event backend.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pickem-core";

/// A single bout on an event card. Owned by its [`Event`]; the `id` is the
/// ordinal position within the card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMatch {
    pub id: u32,
    pub side_a: String,
    pub side_b: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Canonical persisted event record.
///
/// Field names follow the persisted document shape (`isPPV`,
/// `manuallyEdited`), which predates this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub name: String,
    /// Stored verbatim as scraped: `DD.MM.YYYY` or ISO.
    pub date: String,
    pub promotion_id: u32,
    pub promotion_name: String,
    #[serde(default)]
    pub matches: Vec<EventMatch>,
    #[serde(rename = "isPPV", default)]
    pub is_ppv: bool,
    #[serde(default)]
    pub manually_edited: bool,
    #[serde(default)]
    pub source: String,
}

/// Player account. Created at first guest login by the frontend; only
/// mutated here (admin flag, score), never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: String,
    pub display_name: String,
    #[serde(default)]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub is_admin: bool,
}

/// Parser output contract: one listing row, before any persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStub {
    /// Vendor-prefixed store id, e.g. `cagematch-398779`.
    pub id: String,
    /// The source site's own numeric event id; in-page dedup key.
    pub source_event_id: u64,
    pub promotion_id: u32,
    pub promotion_name: String,
    pub name: String,
    pub date: String,
}

/// Lower-case and strip everything non-alphanumeric. Collapses e.g.
/// `"Wrestle Kingdom 20"` and `"wrestle kingdom 20"` onto one key.
///
/// Known heuristic: distinct events with punctuation-only differences
/// coalesce. Accepted; the reconciler ranks rather than guesses.
pub fn normalize_event_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// One weekly-show detection rule: a case-insensitive pattern plus the
/// substrings that veto it. Ordered list so each rule is testable on its own.
#[derive(Debug, Clone, Copy)]
pub struct WeeklyShowRule {
    pub label: &'static str,
    pub pattern: &'static str,
    pub exceptions: &'static [&'static str],
}

const NXT_EXCEPTIONS: &[&str] = &[
    "takeover",
    "deadline",
    "stand & deliver",
    "stand and deliver",
    "vengeance day",
    "battleground",
    "no mercy",
    "great american bash",
    "halloween havoc",
    "heatwave",
    "roadblock",
];

const IMPACT_EXCEPTIONS: &[&str] = &[
    "slammiversary",
    "rebellion",
    "bound for glory",
    "hard to kill",
    "under siege",
    "against all odds",
    "emergence",
    "victory road",
    "turning point",
    "no surrender",
    "sacrifice",
    "genesis",
];

/// Ordered weekly-show rule list. Patterns run against the raw name,
/// case-insensitively; exceptions are checked lower-cased.
pub const WEEKLY_SHOW_RULES: &[WeeklyShowRule] = &[
    WeeklyShowRule { label: "wwe-raw", pattern: r"\braw\b", exceptions: &[] },
    WeeklyShowRule { label: "wwe-smackdown", pattern: r"\bsmackdown\b", exceptions: &[] },
    WeeklyShowRule { label: "wwe-nxt", pattern: r"\bnxt\b", exceptions: NXT_EXCEPTIONS },
    WeeklyShowRule { label: "wwe-main-event", pattern: r"\bmain event\b", exceptions: &[] },
    WeeklyShowRule { label: "wwe-speed", pattern: r"\bspeed\b", exceptions: &[] },
    WeeklyShowRule { label: "aew-dynamite", pattern: r"\bdynamite\b", exceptions: &[] },
    WeeklyShowRule { label: "aew-collision", pattern: r"\bcollision\b", exceptions: &[] },
    WeeklyShowRule { label: "aew-rampage", pattern: r"\brampage\b", exceptions: &[] },
    WeeklyShowRule { label: "aew-dark", pattern: r"\bdark\b", exceptions: &[] },
    WeeklyShowRule { label: "aew-elevation", pattern: r"\belevation\b", exceptions: &[] },
    WeeklyShowRule { label: "impact-tv", pattern: r"\bimpact\b", exceptions: IMPACT_EXCEPTIONS },
    WeeklyShowRule { label: "njpw-strong", pattern: r"\bstrong\b", exceptions: &[] },
    WeeklyShowRule { label: "njpw-road-to", pattern: r"\broad to\b", exceptions: &[] },
    WeeklyShowRule { label: "episode-number", pattern: r"#\s*\d+", exceptions: &[] },
    WeeklyShowRule { label: "episode-word", pattern: r"\bepisode\s+\d+", exceptions: &[] },
    WeeklyShowRule { label: "tv-taping", pattern: r"\btaping\b", exceptions: &[] },
    WeeklyShowRule { label: "house-show", pattern: r"\bhouse show\b", exceptions: &[] },
    WeeklyShowRule { label: "live-event", pattern: r"\blive event\b", exceptions: &[] },
];

fn compiled_rules() -> &'static Vec<Regex> {
    static COMPILED: OnceLock<Vec<Regex>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        WEEKLY_SHOW_RULES
            .iter()
            .map(|rule| {
                Regex::new(&format!("(?i){}", rule.pattern))
                    .unwrap_or_else(|e| panic!("invalid weekly-show pattern {}: {e}", rule.label))
            })
            .collect()
    })
}

fn rule_applies(rule: &WeeklyShowRule, regex: &Regex, name: &str) -> bool {
    if !regex.is_match(name) {
        return false;
    }
    let lower = name.to_lowercase();
    !rule.exceptions.iter().any(|ex| lower.contains(ex))
}

/// First rule in [`WEEKLY_SHOW_RULES`] that classifies `name` as a weekly
/// show, or `None` for one-off events.
pub fn matching_rule(name: &str) -> Option<&'static WeeklyShowRule> {
    WEEKLY_SHOW_RULES
        .iter()
        .zip(compiled_rules())
        .find_map(|(rule, regex)| rule_applies(rule, regex, name).then_some(rule))
}

/// True if the name looks like a recurring TV show rather than a one-off
/// premium event. Pure function over [`WEEKLY_SHOW_RULES`].
pub fn is_weekly_show(name: &str) -> bool {
    matching_rule(name).is_some()
}
