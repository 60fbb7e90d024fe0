use std::sync::Arc;

use anyhow::{Context, Result};
use flume::{Receiver, Sender};
use tokio::task::JoinHandle;

use crate::cache::SnapshotCache;
use crate::chat_log::ChatLogTranscript;
use crate::config::BoardConfig;
use crate::events::BoardEvent;
use crate::http_client::build_http_client_with_timeout;
use crate::identity::HostSignals;
use crate::inject::NetworkEntryPoint;
use crate::prefs::{PreferenceStore, Preferences};
use crate::store::{KvStore, MemoryKvStore, SqliteKvStore};
use crate::transcript::{LiveTranscript, TranscriptSource};
use crate::watcher::{run_watch_loop, TranscriptWatcher, WatchSignal};

/// Where the transcript comes from.
#[derive(Clone)]
pub enum TranscriptFeed {
    /// Pushed by the host through the control API.
    Live(Arc<LiveTranscript>),
    /// Tailed from a chat log on disk.
    ChatLog(Arc<ChatLogTranscript>),
}

impl TranscriptFeed {
    fn from_config(config: &BoardConfig) -> Self {
        match config.chat_log_path.as_deref() {
            Some(path) => {
                tracing::info!("Watching chat log {}", path);
                TranscriptFeed::ChatLog(Arc::new(ChatLogTranscript::open(path)))
            }
            None => TranscriptFeed::Live(Arc::new(LiveTranscript::new())),
        }
    }

    pub fn source(&self) -> Arc<dyn TranscriptSource> {
        match self {
            TranscriptFeed::Live(live) => live.clone(),
            TranscriptFeed::ChatLog(log) => log.clone(),
        }
    }

    pub fn signals(&self) -> Arc<dyn HostSignals> {
        match self {
            TranscriptFeed::Live(live) => live.clone(),
            TranscriptFeed::ChatLog(log) => log.clone(),
        }
    }

    pub fn live(&self) -> Option<&Arc<LiveTranscript>> {
        match self {
            TranscriptFeed::Live(live) => Some(live),
            TranscriptFeed::ChatLog(_) => None,
        }
    }
}

pub struct BoardRuntime {
    pub config: BoardConfig,
    pub prefs: Arc<PreferenceStore>,
    pub feed: TranscriptFeed,
    pub watcher: Arc<TranscriptWatcher>,
    pub outbound: Arc<NetworkEntryPoint<reqwest::Client>>,
    event_tx: Sender<BoardEvent>,
    signal_tx: Sender<WatchSignal>,
    signal_rx: Receiver<WatchSignal>,
}

impl BoardRuntime {
    pub fn bootstrap(config: BoardConfig, event_tx: Sender<BoardEvent>) -> Result<Self> {
        let store = open_store(&config);
        let feed = TranscriptFeed::from_config(&config);
        let client = build_http_client_with_timeout(config.request_timeout())
            .context("Failed to build upstream HTTP client")?;
        Ok(Self::assemble(config, store, feed, client, event_tx))
    }

    fn assemble(
        config: BoardConfig,
        store: Arc<dyn KvStore>,
        feed: TranscriptFeed,
        client: reqwest::Client,
        event_tx: Sender<BoardEvent>,
    ) -> Self {
        let prefs = Arc::new(PreferenceStore::load(store.clone()));

        let (signal_tx, signal_rx) = flume::unbounded();
        feed.source().subscribe(signal_tx.clone());

        let watcher = Arc::new(
            TranscriptWatcher::new(
                feed.source(),
                feed.signals(),
                prefs.clone(),
                SnapshotCache::load(store),
            )
            .with_events(event_tx.clone()),
        );

        let outbound = Arc::new(NetworkEntryPoint::new(client));
        outbound.install_injection(prefs.clone(), Some(event_tx.clone()));

        Self {
            config,
            prefs,
            feed,
            watcher,
            outbound,
            event_tx,
            signal_tx,
            signal_rx,
        }
    }

    /// Start the watch loop (and the chat log poller when tailing a file).
    /// Must be called from inside a tokio runtime.
    pub fn spawn_watch_loop(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(run_watch_loop(
            self.watcher.clone(),
            self.signal_rx.clone(),
            self.config.watch_timing(),
        ))];

        if let TranscriptFeed::ChatLog(log) = &self.feed {
            handles.push(log.clone().spawn_poller(self.config.chat_log_poll_interval()));
        }
        handles
    }

    pub fn signal(&self, signal: WatchSignal) {
        let _ = self.signal_tx.send(signal);
    }

    /// Replace and persist preferences, announce them and schedule a refresh
    /// so the hide/strip choices apply to the current board.
    pub fn update_prefs(&self, prefs: Preferences) -> Preferences {
        let saved = self.prefs.replace(prefs);
        tracing::debug!("Preferences updated: {:?}", saved);
        let _ = self.event_tx.send(BoardEvent::PrefsChanged(saved.clone()));
        self.signal(WatchSignal::RefreshRequested);
        saved
    }
}

fn open_store(config: &BoardConfig) -> Arc<dyn KvStore> {
    match SqliteKvStore::open(&config.store_path) {
        Ok(store) => {
            tracing::info!("Blob store at {}", config.store_path);
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!(
                "Failed to open blob store, preferences and cache will not persist: {:#}",
                e
            );
            Arc::new(MemoryKvStore::new())
        }
    }
}

#[cfg(test)]
pub(crate) fn test_runtime(feed: TranscriptFeed, event_tx: Sender<BoardEvent>) -> BoardRuntime {
    let config = BoardConfig {
        upstream_url: "http://127.0.0.1:9".to_string(),
        ..BoardConfig::default()
    };
    BoardRuntime::assemble(
        config,
        Arc::new(MemoryKvStore::new()),
        feed,
        reqwest::Client::new(),
        event_tx,
    )
}
