use std::collections::HashSet;
use std::sync::{Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::identity::{CharacterRef, HostSignals, HostState};
use crate::snapshot::looks_like_snapshot;
use crate::watcher::WatchSignal;

/// Position of a fenced block: message index, then block index inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    pub message: usize,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub id: BlockId,
    pub text: String,
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    #[serde(default)]
    pub author: Option<String>,
    #[serde(alias = "mes")]
    pub text: String,
}

/// Read surface over the host's rendered transcript.
pub trait TranscriptSource: Send + Sync {
    /// Every fenced code block, in document order.
    fn code_blocks(&self) -> Vec<CodeBlock>;

    /// Toggle display of a block without removing it.
    fn set_block_hidden(&self, id: BlockId, hidden: bool);

    /// Register the channel to notify on structural changes.
    fn subscribe(&self, notify: flume::Sender<WatchSignal>);
}

/// Most-recent-wins: the last block, in document order, that looks like a
/// snapshot.
pub fn find_latest_snapshot(blocks: &[CodeBlock]) -> Option<&CodeBlock> {
    blocks
        .iter()
        .rev()
        .find(|block| looks_like_snapshot(block.text.trim()))
}

/// Fenced (```) blocks of one message. An unterminated fence runs to the end
/// of the message, which is how a still-streaming reply renders.
pub fn extract_code_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in text.lines() {
        let is_fence = line.trim_start().starts_with("```");
        match current.as_mut() {
            None if is_fence => current = Some(Vec::new()),
            None => {}
            Some(lines) if is_fence => {
                blocks.push(lines.join("\n"));
                current = None;
            }
            Some(lines) => lines.push(line),
        }
    }

    if let Some(lines) = current {
        blocks.push(lines.join("\n"));
    }
    blocks
}

/// Blocks of a whole message list, with hidden flags applied.
pub fn collect_blocks(messages: &[TranscriptMessage], hidden: &HashSet<BlockId>) -> Vec<CodeBlock> {
    messages
        .iter()
        .enumerate()
        .flat_map(|(message, msg)| {
            extract_code_blocks(&msg.text)
                .into_iter()
                .enumerate()
                .map(move |(index, text)| (BlockId { message, index }, text))
        })
        .map(|(id, text)| CodeBlock {
            hidden: hidden.contains(&id),
            id,
            text,
        })
        .collect()
}

/// Hidden flags survive a transcript update only for blocks whose text is
/// unchanged; new content starts visible.
pub(crate) fn retain_hidden(
    hidden: &mut HashSet<BlockId>,
    before: &[TranscriptMessage],
    after: &[TranscriptMessage],
) {
    let previous = collect_blocks(before, &HashSet::new());
    let current = collect_blocks(after, &HashSet::new());
    hidden.retain(|id| {
        let old = previous.iter().find(|b| b.id == *id);
        let new = current.iter().find(|b| b.id == *id);
        matches!((old, new), (Some(old), Some(new)) if old.text == new.text)
    });
}

pub(crate) fn notify_changed(notify: &Mutex<Option<flume::Sender<WatchSignal>>>) {
    let guard = notify.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(tx) = guard.as_ref() {
        let _ = tx.send(WatchSignal::TranscriptChanged);
    }
}

#[derive(Default)]
struct LiveState {
    messages: Vec<TranscriptMessage>,
    hidden: HashSet<BlockId>,
    host: HostState,
}

/// Transcript and identity signals pushed by the host through the control API.
#[derive(Default)]
pub struct LiveTranscript {
    state: RwLock<LiveState>,
    notify: Mutex<Option<flume::Sender<WatchSignal>>>,
}

impl LiveTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_messages(&self, messages: Vec<TranscriptMessage>) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let LiveState {
                messages: current,
                hidden,
                ..
            } = &mut *state;
            retain_hidden(hidden, current, &messages);
            *current = messages;
        }
        notify_changed(&self.notify);
    }

    pub fn push_message(&self, message: TranscriptMessage) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.messages.push(message);
        }
        notify_changed(&self.notify);
    }

    /// Identity changes are picked up by the identity poll, not by a
    /// transcript notification.
    pub fn set_host_state(&self, host: HostState) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.host = host;
    }

    pub fn host_state(&self) -> HostState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .host
            .clone()
    }
}

impl TranscriptSource for LiveTranscript {
    fn code_blocks(&self) -> Vec<CodeBlock> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        collect_blocks(&state.messages, &state.hidden)
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

impl HostSignals for LiveTranscript {
    fn active_character(&self) -> Option<CharacterRef> {
        self.host_state().active_character
    }

    fn character_name(&self) -> Option<String> {
        self.host_state().character_name
    }

    fn chat_title(&self) -> Option<String> {
        self.host_state().chat_title
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> TranscriptMessage {
        TranscriptMessage {
            author: None,
            text: text.to_string(),
        }
    }

    const BOARD_A: &str = "Posture: a\nMood: a\nLocation: a\nObjective: a";
    const BOARD_B: &str = "Posture: b\nMood: b\nLocation: b\nObjective: b";

    #[test]
    fn extracts_fenced_blocks_in_order() {
        let text = "intro\n```\nfirst\n```\nmiddle\n  ```text\nsecond\nline\n```\n```\nopen";
        assert_eq!(
            extract_code_blocks(text),
            vec!["first".to_string(), "second\nline".to_string(), "open".to_string()]
        );
        assert!(extract_code_blocks("no fences").is_empty());
    }

    #[test]
    fn latest_qualifying_block_wins() {
        let messages = vec![
            message(&format!("<info_board>\n```\n{}\n```\n</info_board>", BOARD_A)),
            message("```\nfn main() {}\n```"),
            message(&format!("```\n{}\n```\n```\nPosture: only\n```", BOARD_B)),
        ];
        let blocks = collect_blocks(&messages, &HashSet::new());
        assert_eq!(blocks.len(), 4);

        let latest = find_latest_snapshot(&blocks).unwrap();
        assert_eq!(latest.id, BlockId { message: 2, index: 0 });
        assert_eq!(latest.text, BOARD_B);
    }

    #[test]
    fn no_qualifying_block() {
        let blocks = collect_blocks(&[message("```\nMood: x\n```")], &HashSet::new());
        assert!(find_latest_snapshot(&blocks).is_none());
    }

    #[test]
    fn hidden_flags_follow_unchanged_blocks_only() {
        let live = LiveTranscript::new();
        live.replace_messages(vec![
            message(&format!("```\n{}\n```", BOARD_A)),
            message(&format!("```\n{}\n```", BOARD_B)),
        ]);
        live.set_block_hidden(BlockId { message: 0, index: 0 }, true);
        live.set_block_hidden(BlockId { message: 1, index: 0 }, true);

        live.replace_messages(vec![
            message(&format!("```\n{}\n```", BOARD_A)),
            message("```\nrewritten\n```"),
        ]);
        let blocks = live.code_blocks();
        assert!(blocks[0].hidden);
        assert!(!blocks[1].hidden);

        live.set_block_hidden(BlockId { message: 0, index: 0 }, false);
        assert!(!live.code_blocks()[0].hidden);
    }

    #[test]
    fn changes_notify_subscriber() {
        let live = LiveTranscript::new();
        let (tx, rx) = flume::unbounded();
        live.subscribe(tx);

        live.push_message(message("hello"));
        live.set_host_state(HostState {
            chat_title: Some("t".to_string()),
            ..HostState::default()
        });

        assert!(matches!(rx.try_recv(), Ok(WatchSignal::TranscriptChanged)));
        assert!(rx.try_recv().is_err());
        assert_eq!(live.chat_title().as_deref(), Some("t"));
    }
}
