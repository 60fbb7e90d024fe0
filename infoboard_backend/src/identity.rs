use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};

/// Key used when no host signal identifies the conversation.
pub const GLOBAL_KEY: &str = "global";

/// Opaque identifier of the active conversation, e.g. `chid:alice.png`.
pub type ConversationKey = String;

/// In-memory reference to the host's active character.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterRef {
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub index: Option<i64>,
}

impl CharacterRef {
    /// Avatar, else name, else index.
    fn id_like(&self) -> Option<String> {
        non_blank(self.avatar.as_deref())
            .map(str::to_string)
            .or_else(|| non_blank(self.name.as_deref()).map(str::to_string))
            .or_else(|| self.index.map(|index| index.to_string()))
    }
}

/// Identity signals the host application exposes.
pub trait HostSignals: Send + Sync {
    fn active_character(&self) -> Option<CharacterRef>;
    fn character_name(&self) -> Option<String>;
    fn chat_title(&self) -> Option<String>;
}

/// Signals as last reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostState {
    #[serde(default)]
    pub active_character: Option<CharacterRef>,
    #[serde(default)]
    pub character_name: Option<String>,
    #[serde(default)]
    pub chat_title: Option<String>,
}

impl HostSignals for HostState {
    fn active_character(&self) -> Option<CharacterRef> {
        self.active_character.clone()
    }

    fn character_name(&self) -> Option<String> {
        self.character_name.clone()
    }

    fn chat_title(&self) -> Option<String> {
        self.chat_title.clone()
    }
}

type IdentityProbe = fn(&dyn HostSignals) -> Option<ConversationKey>;

const IDENTITY_PROBES: &[IdentityProbe] = &[
    probe_active_character,
    probe_character_name,
    probe_chat_title,
];

fn probe_active_character(signals: &dyn HostSignals) -> Option<ConversationKey> {
    let id = signals.active_character()?.id_like()?;
    Some(format!("chid:{}", id))
}

fn probe_character_name(signals: &dyn HostSignals) -> Option<ConversationKey> {
    let name = signals.character_name()?;
    non_blank(Some(name.as_str())).map(|name| format!("name:{}", name))
}

fn probe_chat_title(signals: &dyn HostSignals) -> Option<ConversationKey> {
    let title = signals.chat_title()?;
    non_blank(Some(title.as_str())).map(|title| format!("chat:{}", title))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Resolve the active conversation key. Probes run in tier order and the
/// first hit wins; a probe that panics is treated as a miss.
pub fn resolve_active_key(signals: &dyn HostSignals) -> ConversationKey {
    IDENTITY_PROBES
        .iter()
        .find_map(|probe| {
            catch_unwind(AssertUnwindSafe(|| probe(signals)))
                .ok()
                .flatten()
        })
        .unwrap_or_else(|| GLOBAL_KEY.to_string())
}
