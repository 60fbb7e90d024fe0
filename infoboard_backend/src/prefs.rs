use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::KvStore;

pub const PREFS_STORE_KEY: &str = "infoboard_sidebar_prefs";

/// Role used for the injected instruction in message-list payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InjectRole {
    #[default]
    System,
    User,
}

impl InjectRole {
    pub fn as_str(self) -> &'static str {
        match self {
            InjectRole::System => "system",
            InjectRole::User => "user",
        }
    }

    /// Anything other than exactly `user` means `system`.
    pub fn from_pref(raw: &str) -> Self {
        if raw == "user" {
            InjectRole::User
        } else {
            InjectRole::System
        }
    }
}

impl From<String> for InjectRole {
    fn from(raw: String) -> Self {
        Self::from_pref(&raw)
    }
}

impl From<InjectRole> for String {
    fn from(role: InjectRole) -> Self {
        role.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub open: bool,
    pub hide_in_chat: bool,
    pub strip_outer_brackets: bool,
    pub auto_inject_prompt: bool,
    pub inject_mode: InjectRole,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            open: true,
            hide_in_chat: true,
            strip_outer_brackets: false,
            auto_inject_prompt: false,
            inject_mode: InjectRole::System,
        }
    }
}

impl Preferences {
    /// Read a persisted blob field by field. Anything missing, mistyped or
    /// unparseable keeps its default.
    pub fn from_blob(raw: &str) -> Self {
        let mut prefs = Self::default();
        let Ok(Value::Object(saved)) = serde_json::from_str::<Value>(raw) else {
            return prefs;
        };

        if let Some(open) = saved.get("open").and_then(Value::as_bool) {
            prefs.open = open;
        }
        if let Some(hide) = saved.get("hideInChat").and_then(Value::as_bool) {
            prefs.hide_in_chat = hide;
        }
        if let Some(strip) = saved.get("stripOuterBrackets").and_then(Value::as_bool) {
            prefs.strip_outer_brackets = strip;
        }
        if let Some(inject) = saved.get("autoInjectPrompt").and_then(Value::as_bool) {
            prefs.auto_inject_prompt = inject;
        }
        if let Some(mode) = saved.get("injectMode").and_then(Value::as_str) {
            prefs.inject_mode = InjectRole::from_pref(mode);
        }
        prefs
    }
}

/// Owns the process-wide preferences and writes them back on every change.
pub struct PreferenceStore {
    store: Arc<dyn KvStore>,
    current: RwLock<Preferences>,
}

impl PreferenceStore {
    pub fn load(store: Arc<dyn KvStore>) -> Self {
        let current = match store.get(PREFS_STORE_KEY) {
            Ok(Some(raw)) => Preferences::from_blob(&raw),
            Ok(None) => Preferences::default(),
            Err(e) => {
                tracing::warn!("Failed to read preferences, using defaults: {}", e);
                Preferences::default()
            }
        };

        Self {
            store,
            current: RwLock::new(current),
        }
    }

    pub fn snapshot(&self) -> Preferences {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whole preference set and persist it.
    pub fn replace(&self, prefs: Preferences) -> Preferences {
        {
            let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
            *guard = prefs.clone();
        }
        self.save(&prefs);
        prefs
    }

    pub fn update<F>(&self, mutate: F) -> Preferences
    where
        F: FnOnce(&mut Preferences),
    {
        let updated = {
            let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
            mutate(&mut guard);
            guard.clone()
        };
        self.save(&updated);
        updated
    }

    fn save(&self, prefs: &Preferences) {
        let result = serde_json::to_string(prefs)
            .map_err(anyhow::Error::from)
            .and_then(|raw| self.store.set(PREFS_STORE_KEY, &raw));
        if let Err(e) = result {
            tracing::warn!("Failed to save preferences: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    #[test]
    fn defaults_match_fresh_install() {
        let prefs = Preferences::default();
        assert!(prefs.open);
        assert!(prefs.hide_in_chat);
        assert!(!prefs.strip_outer_brackets);
        assert!(!prefs.auto_inject_prompt);
        assert_eq!(prefs.inject_mode, InjectRole::System);
    }

    #[test]
    fn blob_fields_fall_back_individually() {
        let prefs = Preferences::from_blob(
            r#"{"open": "yes", "hideInChat": false, "autoInjectPrompt": true, "injectMode": "user", "extra": 1}"#,
        );
        assert!(prefs.open);
        assert!(!prefs.hide_in_chat);
        assert!(prefs.auto_inject_prompt);
        assert_eq!(prefs.inject_mode, InjectRole::User);

        assert_eq!(Preferences::from_blob("{not json"), Preferences::default());
        assert_eq!(Preferences::from_blob("null"), Preferences::default());
        assert_eq!(
            Preferences::from_blob(r#"{"injectMode": "assistant"}"#).inject_mode,
            InjectRole::System
        );
    }

    #[test]
    fn inject_role_matches_user_exactly() {
        assert_eq!(InjectRole::from_pref("user"), InjectRole::User);
        for raw in [" USER ", "User", "user ", "", "system"] {
            assert_eq!(InjectRole::from_pref(raw), InjectRole::System, "{:?}", raw);
        }
        assert_eq!(
            Preferences::from_blob(r#"{"injectMode": "USER"}"#).inject_mode,
            InjectRole::System
        );
    }

    #[test]
    fn saved_blob_uses_wire_names() {
        let prefs = Preferences {
            inject_mode: InjectRole::User,
            ..Preferences::default()
        };
        let value = serde_json::to_value(&prefs).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "open": true,
                "hideInChat": true,
                "stripOuterBrackets": false,
                "autoInjectPrompt": false,
                "injectMode": "user"
            })
        );
    }

    #[test]
    fn store_persists_updates_across_loads() {
        let backing: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let store = PreferenceStore::load(backing.clone());
        store.update(|prefs| {
            prefs.strip_outer_brackets = true;
            prefs.open = false;
        });

        let reloaded = PreferenceStore::load(backing);
        let prefs = reloaded.snapshot();
        assert!(prefs.strip_outer_brackets);
        assert!(!prefs.open);
        assert!(prefs.hide_in_chat);
    }
}
