//! Bounded conversation memory for the chat relays.

use std::collections::{HashMap, VecDeque};

/// Thread identity for a message: replies to it continue that conversation.
pub fn thread_id(chat_id: i64, message_id: i64) -> String {
    format!("{chat_id}<-{message_id}")
}

/// Fixed-capacity map from thread identity to transcript.
///
/// The tracking queue starts full of empty slots, so the first `capacity`
/// insertions evict nothing. After that every new thread evicts the thread
/// that was *inserted* earliest. Overwriting a tracked thread does not move
/// it in the queue, so this is FIFO, not LRU.
#[derive(Debug)]
pub struct ConversationMemory<T> {
    slots: VecDeque<Option<String>>,
    transcripts: HashMap<String, T>,
}

impl<T: Clone> ConversationMemory<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: std::iter::repeat_n(None, capacity).collect(),
            transcripts: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Insert or overwrite the transcript for `thread`.
    pub fn remember(&mut self, thread: &str, transcript: T) {
        if let Some(existing) = self.transcripts.get_mut(thread) {
            *existing = transcript;
            return;
        }

        // Zero capacity disables memory
        let Some(victim) = self.slots.pop_front() else {
            return;
        };
        if let Some(victim) = victim {
            self.transcripts.remove(&victim);
        }
        self.slots.push_back(Some(thread.to_string()));
        self.transcripts.insert(thread.to_string(), transcript);
    }

    /// Stored transcript for `thread`, if still remembered.
    pub fn recall(&self, thread: &str) -> Option<T> {
        self.transcripts.get(thread).cloned()
    }

    pub fn len(&self) -> usize {
        self.transcripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transcripts.is_empty()
    }
}
