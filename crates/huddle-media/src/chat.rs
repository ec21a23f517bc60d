use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

use huddle_shared::protocol::ChatMessage;

/// Session chat history, oldest first, deduplicated by message id.
#[derive(Debug)]
pub struct ChatTranscript {
    entries: VecDeque<ChatMessage>,
    seen: HashSet<Uuid>,
    max_len: usize,
}

impl ChatTranscript {
    pub fn new(max_len: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            seen: HashSet::new(),
            max_len: max_len.max(1),
        }
    }

    /// Returns `false` for a message already in the transcript.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        self.entries.push_back(message);
        while self.entries.len() > self.max_len {
            if let Some(evicted) = self.entries.pop_front() {
                self.seen.remove(&evicted.id);
            }
        }
        true
    }

    pub fn entries(&self) -> Vec<ChatMessage> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_shared::types::PeerId;

    fn message(body: &str) -> ChatMessage {
        ChatMessage::new(PeerId::from("a"), "Ada", body)
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let mut transcript = ChatTranscript::new(10);
        let msg = message("hi");
        assert!(transcript.append(msg.clone()));
        assert!(!transcript.append(msg));
        assert_eq!(transcript.len(), 1);
    }

    #[test]
    fn test_oldest_evicted_at_cap() {
        let mut transcript = ChatTranscript::new(2);
        transcript.append(message("one"));
        transcript.append(message("two"));
        transcript.append(message("three"));

        let bodies: Vec<_> = transcript.entries().into_iter().map(|m| m.body).collect();
        assert_eq!(bodies, vec!["two", "three"]);
    }
}
