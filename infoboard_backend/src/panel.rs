//! Projection of a snapshot into the side panel layout.

use serde::{Deserialize, Serialize};

use crate::snapshot::{
    extract_arousal_percent, maybe_strip_brackets, split_mood_to_chips, SnapshotRecord,
};

pub const EMPTY_PANEL_MESSAGE: &str = "No info board found yet.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PanelView {
    Empty { message: String },
    Board { sections: Vec<PanelSection> },
}

impl PanelView {
    pub fn empty() -> Self {
        PanelView::Empty {
            message: EMPTY_PANEL_MESSAGE.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, PanelView::Empty { .. })
    }

    pub fn section(&self, title: &str) -> Option<&PanelSection> {
        match self {
            PanelView::Board { sections } => sections.iter().find(|s| s.title == title),
            PanelView::Empty { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelSection {
    pub title: String,
    pub fields: Vec<PanelField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PanelField {
    Text {
        label: String,
        value: String,
        #[serde(default)]
        subtle: bool,
        #[serde(default)]
        mono: bool,
    },
    Chips {
        label: String,
        items: Vec<String>,
    },
    Meter {
        label: String,
        percent: u8,
        text: String,
    },
}

impl PanelField {
    pub fn label(&self) -> &str {
        match self {
            PanelField::Text { label, .. }
            | PanelField::Chips { label, .. }
            | PanelField::Meter { label, .. } => label,
        }
    }
}

#[derive(Default, Clone, Copy)]
struct TextStyle {
    subtle: bool,
    mono: bool,
}

const PLAIN: TextStyle = TextStyle {
    subtle: false,
    mono: false,
};
const SUBTLE: TextStyle = TextStyle {
    subtle: true,
    mono: false,
};

fn text_field(label: &str, value: Option<&str>, style: TextStyle) -> Option<PanelField> {
    let value = value?;
    if value.trim().is_empty() {
        return None;
    }
    Some(PanelField::Text {
        label: label.to_string(),
        value: value.to_string(),
        subtle: style.subtle,
        mono: style.mono,
    })
}

fn chips_field(label: &str, items: Vec<String>) -> Option<PanelField> {
    if items.is_empty() {
        return None;
    }
    Some(PanelField::Chips {
        label: label.to_string(),
        items,
    })
}

fn arousal_field(value: Option<&str>) -> Option<PanelField> {
    let text = value?;
    if text.trim().is_empty() {
        return None;
    }
    Some(PanelField::Meter {
        label: "Arousal".to_string(),
        percent: extract_arousal_percent(text).unwrap_or(0),
        text: text.to_string(),
    })
}

fn section(title: &str, fields: impl IntoIterator<Item = Option<PanelField>>) -> PanelSection {
    PanelSection {
        title: title.to_string(),
        fields: fields.into_iter().flatten().collect(),
    }
}

/// Build the panel for `record`. Pure: neither the record nor any cache is
/// touched.
pub fn render(record: Option<&SnapshotRecord>, strip_outer_brackets: bool) -> PanelView {
    let Some(data) = record.filter(|r| !r.is_empty()) else {
        return PanelView::empty();
    };

    let emoji = data
        .get("Emoji")
        .map(|value| maybe_strip_brackets(value, strip_outer_brackets));

    let mut sections = vec![
        section(
            "Presence",
            [
                text_field("Posture", data.get("Posture"), PLAIN),
                text_field("Clothes", data.get("Clothes"), SUBTLE),
                text_field("Emoji", emoji.as_deref(), SUBTLE),
            ],
        ),
        section(
            "Mind",
            [
                chips_field(
                    "Mood",
                    data.get("Mood").map(split_mood_to_chips).unwrap_or_default(),
                ),
                text_field(
                    "Thought",
                    data.get("Thought"),
                    TextStyle {
                        subtle: true,
                        mono: true,
                    },
                ),
            ],
        ),
        section(
            "Connection",
            [
                text_field("Affinity", data.get("Affinity"), PLAIN),
                arousal_field(data.get("Arousal")),
            ],
        ),
        section(
            "World",
            [
                text_field("Location", data.get("Location"), PLAIN),
                text_field("Time", data.get("Timezone"), SUBTLE),
                text_field("Objective", data.get("Objective"), SUBTLE),
            ],
        ),
    ];

    let extras: Vec<Option<PanelField>> = data
        .extras()
        .map(|(key, value)| text_field(key, Some(value), SUBTLE))
        .collect();
    if !extras.is_empty() {
        sections.push(section("Extra", extras));
    }

    PanelView::Board { sections }
}
