//! Keyword heuristic mapping an assistant reply to the avatar mood.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    #[default]
    Happy,
    Neutral,
    Sad,
    Excited,
    /// Set while a reply is being generated; never produced by [`classify`].
    Thinking,
}

// Checked in this order; the first table with a hit wins.
const EXCITED_MARKERS: &[&str] = &["すごい", "やばい", "マジ", "最高"];
const HAPPY_MARKERS: &[&str] = &["嬉しい", "楽しい", "素敵", "！", "よかった"];
const SAD_MARKERS: &[&str] = &["悲しい", "辛い", "残念", "ごめん"];

const MOOD_TABLE: &[(Mood, &[&str])] = &[
    (Mood::Excited, EXCITED_MARKERS),
    (Mood::Happy, HAPPY_MARKERS),
    (Mood::Sad, SAD_MARKERS),
];

/// Classify `text` by case-sensitive substring match against the marker tables.
pub fn classify(text: &str) -> Mood {
    MOOD_TABLE
        .iter()
        .find(|(_, markers)| markers.iter().any(|m| text.contains(m)))
        .map(|(mood, _)| *mood)
        .unwrap_or(Mood::Neutral)
}
