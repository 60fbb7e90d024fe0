use crate::prefs::Preferences;
use crate::watcher::BoardState;

/// Backend events, relayed to frontends over `/ws/events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardEvent {
    BoardUpdated(BoardState),
    PrefsChanged(Preferences),
    PromptInjected { url: String, shape: String },
}
