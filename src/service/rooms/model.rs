use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::protocol::{
    ParticipantId, ParticipantInfo, PrivacyMode, RevealStats, Role, RoomId, RoundId, RoundState,
    Tier,
};

fn default_owner_tier() -> Tier {
    Tier::Free
}

/// A room row. Created by the CRUD surface; the core reads it and only ever
/// touches `last_active_at`. `deleted_at` is terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Room {
    pub room_id: RoomId,
    pub title: String,
    pub owner_user_id: String,
    pub privacy_mode: PrivacyMode,
    #[serde(default)]
    pub org: Option<String>,
    /// Tier of the plan the room was created under; free rooms get the
    /// reduced capacity.
    #[serde(default = "default_owner_tier")]
    pub owner_tier: Tier,
    #[serde(default)]
    pub config: RoomConfig,
    pub created_at: u64,
    pub last_active_at: u64,
    #[serde(default)]
    pub deleted_at: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomConfig {
    #[serde(default = "default_deck_name")]
    pub deck: String,
    /// Reveal automatically once every eligible voter has cast.
    #[serde(default)]
    pub auto_reveal: bool,
    #[serde(default)]
    pub timer_seconds: Option<u64>,
    #[serde(default = "default_true")]
    pub observers_can_chat: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            deck: default_deck_name(),
            auto_reveal: false,
            timer_seconds: None,
            observers_can_chat: true,
        }
    }
}

fn default_deck_name() -> String {
    "fibonacci".to_owned()
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub room_id: RoomId,
    pub user_id: Option<String>,
    pub display_name: String,
    pub role: Role,
    pub connected_at: u64,
    #[serde(default)]
    pub disconnected_at: Option<u64>,
    #[serde(default)]
    pub grace_deadline: Option<u64>,
}

impl Participant {
    pub fn is_connected(&self) -> bool {
        self.disconnected_at.is_none()
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: self.participant_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            connected: self.is_connected(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Round {
    pub round_id: RoundId,
    pub room_id: RoomId,
    pub round_number: u64,
    #[serde(default)]
    pub story_title: Option<String>,
    pub started_at: u64,
    #[serde(default)]
    pub revealed_at: Option<u64>,
    /// The deck valid when the round started. Room config changes never
    /// affect an in-flight round.
    pub deck_snapshot: Vec<String>,
    pub state: RoundState,
    #[serde(default)]
    pub timer_seconds: Option<u64>,
    #[serde(default)]
    pub average: Option<f64>,
    #[serde(default)]
    pub median: Option<f64>,
    #[serde(default)]
    pub consensus_reached: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vote {
    pub round_id: RoundId,
    pub participant_id: ParticipantId,
    pub card_value: String,
    pub voted_at: u64,
}

/// One append-only reporting row, written when a round reveals.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionHistoryEntry {
    pub session_id: String,
    pub room_id: RoomId,
    pub started_at: u64,
    pub ended_at: u64,
    pub total_rounds: u64,
    pub total_stories: u64,
    pub summary_stats_json: JsonValue,
    pub participants_json: JsonValue,
}

fn round_half_up(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn numeric(card_value: &str) -> Option<f64> {
    card_value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

/// Aggregate statistics disclosed with `round.revealed.v1`.
///
/// Numeric cards are parsed as decimals; everything else ("?", "☕", t-shirt
/// sizes) participates only in mode, distribution and the consensus check.
pub fn compute_stats(votes: &[Vote], deck_snapshot: &[String]) -> RevealStats {
    let mut numeric_values: Vec<f64> = votes
        .iter()
        .filter_map(|vote| numeric(&vote.card_value))
        .collect();
    numeric_values.sort_by(|a, b| a.partial_cmp(b).expect("card values are finite"));

    let average = if numeric_values.is_empty() {
        None
    } else {
        Some(round_half_up(
            numeric_values.iter().sum::<f64>() / numeric_values.len() as f64,
        ))
    };

    let median = if numeric_values.is_empty() {
        None
    } else {
        let mid = numeric_values.len() / 2;
        let median = if numeric_values.len() % 2 == 1 {
            numeric_values[mid]
        } else {
            (numeric_values[mid - 1] + numeric_values[mid]) / 2.0
        };
        Some(round_half_up(median))
    };

    let mut distribution: BTreeMap<String, u64> = BTreeMap::new();
    for vote in votes {
        *distribution.entry(vote.card_value.clone()).or_default() += 1;
    }

    let deck_order = |value: &str| {
        deck_snapshot
            .iter()
            .position(|card| card == value)
            .unwrap_or(usize::MAX)
    };
    let mode = distribution
        .iter()
        .max_by(|(a_value, a_count), (b_value, b_count)| {
            a_count
                .cmp(b_count)
                .then_with(|| deck_order(b_value).cmp(&deck_order(a_value)))
        })
        .map(|(value, _)| value.clone());

    let non_numeric: Vec<&str> = votes
        .iter()
        .filter(|vote| numeric(&vote.card_value).is_none())
        .map(|vote| vote.card_value.as_str())
        .collect();

    let numeric_agree = numeric_values.windows(2).all(|w| w[0] == w[1]);
    let non_numeric_agree = non_numeric.windows(2).all(|w| w[0] == w[1]);
    let consensus_reached = !votes.is_empty() && numeric_agree && non_numeric_agree;

    RevealStats {
        average,
        median,
        mode,
        consensus_reached,
        total_votes: votes.len() as u64,
        distribution,
    }
}
