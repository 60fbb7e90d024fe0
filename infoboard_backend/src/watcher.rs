use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::cache::SnapshotCache;
use crate::events::BoardEvent;
use crate::identity::{resolve_active_key, ConversationKey, HostSignals};
use crate::panel::{self, PanelView};
use crate::prefs::PreferenceStore;
use crate::snapshot::SnapshotRecord;
use crate::transcript::{find_latest_snapshot, BlockId, TranscriptSource};

/// Reasons to re-run the transcript scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchSignal {
    TranscriptChanged,
    VisibilityRegained,
    RefreshRequested,
}

/// Where the currently displayed board came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoardSource {
    Transcript { block: BlockId },
    Cache,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardState {
    pub key: ConversationKey,
    pub source: BoardSource,
    pub view: PanelView,
    pub updated_at: DateTime<Utc>,
}

impl BoardState {
    fn empty(key: ConversationKey) -> Self {
        Self {
            key,
            source: BoardSource::Empty,
            view: PanelView::empty(),
            updated_at: Utc::now(),
        }
    }
}

/// Keeps the panel and the per-conversation cache in step with the transcript.
pub struct TranscriptWatcher {
    transcript: Arc<dyn TranscriptSource>,
    signals: Arc<dyn HostSignals>,
    prefs: Arc<PreferenceStore>,
    cache: Mutex<SnapshotCache>,
    board: RwLock<BoardState>,
    /// Serializes refreshes between the watch loop and API callers.
    refresh_lock: Mutex<()>,
    events: Option<Sender<BoardEvent>>,
}

impl TranscriptWatcher {
    pub fn new(
        transcript: Arc<dyn TranscriptSource>,
        signals: Arc<dyn HostSignals>,
        prefs: Arc<PreferenceStore>,
        cache: SnapshotCache,
    ) -> Self {
        let key = resolve_active_key(signals.as_ref());
        Self {
            transcript,
            signals,
            prefs,
            cache: Mutex::new(cache),
            board: RwLock::new(BoardState::empty(key)),
            refresh_lock: Mutex::new(()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Sender<BoardEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn board(&self) -> BoardState {
        self.board
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn active_key(&self) -> ConversationKey {
        self.board().key
    }

    pub fn cached(&self, key: &str) -> Option<SnapshotRecord> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Scan the transcript for the latest snapshot and sync panel and cache.
    ///
    /// Falls back to the cached record for the active conversation, then to
    /// the empty panel. Safe to call repeatedly.
    pub fn refresh(&self) -> BoardState {
        let _guard = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let key = resolve_active_key(self.signals.as_ref());
        let prefs = self.prefs.snapshot();
        let blocks = self.transcript.code_blocks();

        let board = match find_latest_snapshot(&blocks) {
            Some(block) => {
                let record = SnapshotRecord::parse(block.text.trim(), prefs.strip_outer_brackets);
                let view = panel::render(Some(&record), prefs.strip_outer_brackets);
                self.cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .put(&key, record);
                self.transcript
                    .set_block_hidden(block.id, prefs.hide_in_chat);
                tracing::debug!(
                    "Snapshot found in block {:?} for {} (hidden: {})",
                    block.id,
                    key,
                    prefs.hide_in_chat
                );
                BoardState {
                    key,
                    source: BoardSource::Transcript { block: block.id },
                    view,
                    updated_at: Utc::now(),
                }
            }
            None => self.board_from_cache(key),
        };

        self.publish(board)
    }

    /// Re-resolve identity; when the key moved, show the cached board for
    /// the new key (or the empty panel). Returns the new board on change.
    pub fn poll_identity(&self) -> Option<BoardState> {
        let _guard = self.refresh_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let next = resolve_active_key(self.signals.as_ref());
        if next == self.active_key() {
            return None;
        }
        tracing::info!("Active conversation changed to {}", next);
        let board = self.board_from_cache(next);
        Some(self.publish(board))
    }

    fn board_from_cache(&self, key: ConversationKey) -> BoardState {
        let strip = self.prefs.snapshot().strip_outer_brackets;
        match self.cached(&key) {
            Some(record) => BoardState {
                view: panel::render(Some(&record), strip),
                key,
                source: BoardSource::Cache,
                updated_at: Utc::now(),
            },
            None => BoardState::empty(key),
        }
    }

    fn publish(&self, board: BoardState) -> BoardState {
        {
            let mut guard = self.board.write().unwrap_or_else(PoisonError::into_inner);
            *guard = board.clone();
        }
        if let Some(events) = self.events.as_ref() {
            let _ = events.send(BoardEvent::BoardUpdated(board.clone()));
        }
        board
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatchTiming {
    /// Coalescing window for change bursts, one animation frame by default.
    pub frame: Duration,
    pub identity_poll: Duration,
}

impl Default for WatchTiming {
    fn default() -> Self {
        Self {
            frame: Duration::from_millis(16),
            identity_poll: Duration::from_millis(600),
        }
    }
}

/// Drive the watcher: one refresh up front, then at most one refresh per
/// frame for any burst of signals, plus the identity poll. Ends when every
/// signal sender is gone.
pub async fn run_watch_loop(
    watcher: Arc<TranscriptWatcher>,
    signals: Receiver<WatchSignal>,
    timing: WatchTiming,
) {
    watcher.refresh();

    let mut identity_tick = tokio::time::interval(timing.identity_poll);
    identity_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    identity_tick.tick().await;

    loop {
        tokio::select! {
            signal = signals.recv_async() => {
                let Ok(signal) = signal else {
                    break;
                };
                if signal == WatchSignal::TranscriptChanged {
                    tokio::time::sleep(timing.frame).await;
                }
                let coalesced = signals.drain().count();
                tracing::trace!("Refreshing board ({:?} + {} coalesced)", signal, coalesced);
                watcher.refresh();
            }
            _ = identity_tick.tick() => {
                watcher.poll_identity();
            }
        }
    }

    tracing::debug!("Watch loop stopped");
}
