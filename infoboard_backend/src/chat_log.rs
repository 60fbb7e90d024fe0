//! Transcript backed by a SillyTavern-style JSONL chat log.
//!
//! The first line of such a file is a header (`user_name`, `character_name`,
//! `chat_metadata`); every following line is one message with its text in
//! `mes`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::identity::{CharacterRef, HostSignals};
use crate::transcript::{
    collect_blocks, notify_changed, retain_hidden, BlockId, CodeBlock, TranscriptMessage,
    TranscriptSource,
};
use crate::watcher::WatchSignal;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChatLogHeader {
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub character_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatLogLine {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    mes: Option<String>,
    #[serde(default)]
    character_name: Option<String>,
    #[serde(default)]
    user_name: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedChatLog {
    pub header: Option<ChatLogHeader>,
    pub messages: Vec<TranscriptMessage>,
}

/// Lines that are not valid JSON are skipped.
pub fn parse_chat_log(contents: &str) -> ParsedChatLog {
    let mut parsed = ParsedChatLog::default();
    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        let Ok(entry) = serde_json::from_str::<ChatLogLine>(line) else {
            continue;
        };
        match entry.mes {
            Some(text) => parsed.messages.push(TranscriptMessage {
                author: entry.name,
                text,
            }),
            None if parsed.header.is_none() => {
                parsed.header = Some(ChatLogHeader {
                    user_name: entry.user_name,
                    character_name: entry.character_name,
                });
            }
            None => {}
        }
    }
    parsed
}

#[derive(Default)]
struct ChatLogState {
    parsed: ParsedChatLog,
    hidden: HashSet<BlockId>,
    fingerprint: Option<(SystemTime, u64)>,
}

pub struct ChatLogTranscript {
    path: PathBuf,
    state: RwLock<ChatLogState>,
    notify: Mutex<Option<flume::Sender<WatchSignal>>>,
}

impl ChatLogTranscript {
    /// Open the log; a missing or unreadable file yields an empty transcript
    /// that fills in once the file appears.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let transcript = Self {
            path: path.as_ref().to_path_buf(),
            state: RwLock::new(ChatLogState::default()),
            notify: Mutex::new(None),
        };
        if let Err(e) = transcript.reload_if_changed() {
            tracing::warn!("Chat log {:?} not loaded yet: {}", transcript.path, e);
        }
        transcript
    }

    /// Re-read the file when its modification time or size moved. Returns
    /// whether the transcript changed.
    pub fn reload_if_changed(&self) -> Result<bool> {
        let metadata = fs::metadata(&self.path)
            .with_context(|| format!("Failed to stat chat log {:?}", self.path))?;
        let fingerprint = (
            metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            metadata.len(),
        );

        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if state.fingerprint == Some(fingerprint) {
                return Ok(false);
            }
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read chat log {:?}", self.path))?;
        let parsed = parse_chat_log(&contents);

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let changed = state.parsed != parsed;
        let ChatLogState {
            parsed: current,
            hidden,
            fingerprint: stored,
        } = &mut *state;
        retain_hidden(hidden, &current.messages, &parsed.messages);
        *current = parsed;
        *stored = Some(fingerprint);
        Ok(changed)
    }

    /// Poll the file on a fixed interval and notify subscribers on change.
    pub fn spawn_poller(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.reload_if_changed() {
                    Ok(true) => {
                        tracing::debug!("Chat log {:?} changed", self.path);
                        notify_changed(&self.notify);
                    }
                    Ok(false) => {}
                    Err(e) => tracing::trace!("Chat log poll skipped: {}", e),
                }
            }
        })
    }

    fn header(&self) -> Option<ChatLogHeader> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .parsed
            .header
            .clone()
    }
}

impl TranscriptSource for ChatLogTranscript {
    fn code_blocks(&self) -> Vec<CodeBlock> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        collect_blocks(&state.parsed.messages, &state.hidden)
    }

    fn set_block_hidden(&self, id: BlockId, hidden: bool) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if hidden {
            state.hidden.insert(id);
        } else {
            state.hidden.remove(&id);
        }
    }

    fn subscribe(&self, notify: flume::Sender<WatchSignal>) {
        *self.notify.lock().unwrap_or_else(PoisonError::into_inner) = Some(notify);
    }
}

impl HostSignals for ChatLogTranscript {
    fn active_character(&self) -> Option<CharacterRef> {
        None
    }

    fn character_name(&self) -> Option<String> {
        self.header()?.character_name
    }

    fn chat_title(&self) -> Option<String> {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
    }
}
