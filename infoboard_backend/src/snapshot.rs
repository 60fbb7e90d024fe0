//! Snapshot parsing.
//!
//! The agent writes its state as a fenced block of `Label: value` lines. This
//! module turns such a block into a [`SnapshotRecord`] and decides whether an
//! arbitrary code block looks like one at all.

use std::fmt;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// The ten labels the standing instruction asks the agent to fill in.
pub const EXPECTED_KEYS: [&str; 10] = [
    "Posture",
    "Clothes",
    "Affinity",
    "Mood",
    "Emoji",
    "Thought",
    "Arousal",
    "Location",
    "Timezone",
    "Objective",
];

/// Minimum number of recognized labels for a block to count as a snapshot.
pub const SNAPSHOT_MIN_KEY_HITS: usize = 4;

pub const MAX_MOOD_CHIPS: usize = 10;

/// Ordered field map parsed from one snapshot block.
///
/// Keys keep the position of their first occurrence; a repeated key overwrites
/// the value only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotRecord {
    fields: Vec<(String, String)>,
}

impl SnapshotRecord {
    /// Parse `Key: value` lines. Lines without a colon or with an empty key are
    /// skipped; values are trimmed and optionally lose one pair of enclosing
    /// square brackets.
    pub fn parse(text: &str, strip_outer_brackets: bool) -> Self {
        let mut record = Self::default();
        for raw in text.split('\n') {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            record.upsert(key, maybe_strip_brackets(value, strip_outer_brackets));
        }
        record
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Fields whose key is not one of [`EXPECTED_KEYS`], in encounter order.
    pub fn extras(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().filter(|(k, _)| !is_expected_key(k))
    }

    fn upsert(&mut self, key: &str, value: String) {
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }
}

impl<K, V> FromIterator<(K, V)> for SnapshotRecord
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Self::default();
        for (key, value) in iter {
            record.upsert(key.as_ref(), value.into());
        }
        record
    }
}

impl Serialize for SnapshotRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SnapshotRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(RecordVisitor)
    }
}

struct RecordVisitor;

impl<'de> Visitor<'de> for RecordVisitor {
    type Value = SnapshotRecord;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an object of snapshot fields")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut record = SnapshotRecord::default();
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            let value = match value {
                Value::Null => continue,
                Value::String(s) => s,
                other => other.to_string(),
            };
            record.upsert(&key, value);
        }
        Ok(record)
    }
}

pub fn is_expected_key(key: &str) -> bool {
    EXPECTED_KEYS.contains(&key)
}

fn key_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        EXPECTED_KEYS
            .iter()
            .filter_map(|key| {
                Regex::new(&format!(r"(?i)(?:^|\n)\s*{}\s*:", regex_lite::escape(key))).ok()
            })
            .collect()
    })
}

fn arousal_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(\d{1,3})\s*%").ok())
        .as_ref()
}

/// Count recognized labels that start a line; loose on purpose so partially
/// malformed boards still qualify.
pub fn count_key_hits(text: &str) -> usize {
    key_patterns().iter().filter(|re| re.is_match(text)).count()
}

pub fn looks_like_snapshot(text: &str) -> bool {
    count_key_hits(text) >= SNAPSHOT_MIN_KEY_HITS
}

/// Trim, then drop one pair of enclosing `[...]` when `enabled`.
pub fn maybe_strip_brackets(value: &str, enabled: bool) -> String {
    let trimmed = value.trim();
    if enabled && trimmed.len() >= 2 && trimmed.starts_with('[') && trimmed.ends_with(']') {
        return trimmed[1..trimmed.len() - 1].trim().to_string();
    }
    trimmed.to_string()
}

/// First `NN%` in the value, clamped to 0..=100.
pub fn extract_arousal_percent(value: &str) -> Option<u8> {
    let captures = arousal_pattern()?.captures(value)?;
    let number: u32 = captures.get(1)?.as_str().parse().ok()?;
    Some(number.min(100) as u8)
}

pub fn split_mood_to_chips(value: &str) -> Vec<String> {
    let inner = value.strip_prefix('[').unwrap_or(value);
    let inner = inner.strip_suffix(']').unwrap_or(inner);
    inner
        .split(',')
        .map(str::trim)
        .filter(|chip| !chip.is_empty())
        .take(MAX_MOOD_CHIPS)
        .map(str::to_string)
        .collect()
}
