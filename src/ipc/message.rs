//! IPC messages and the UTCB
//!
//! A message is a bounded block of untyped words plus a few capability
//! selectors. The kernel copies the words verbatim and translates the
//! selectors from the sender's into the receiver's capability space.

use alloc::vec::Vec;

use crate::types::{CapId, Word};

// ============================================================================
// Constants
// ============================================================================

/// Maximum payload words per message
pub const MAX_MSG_WORDS: usize = 64;

/// Maximum capability selectors per message
pub const MAX_MSG_CAPS: usize = 4;

/// Maximum length of thread and PD labels
pub const LABEL_LEN: usize = 32;

/// Fixed-size object label
pub type Label = heapless::String<LABEL_LEN>;

/// Build a label, truncated to `LABEL_LEN` bytes
pub fn label(name: &str) -> Label {
    let mut label = Label::new();
    for c in name.chars() {
        if label.push(c).is_err() {
            break;
        }
    }
    label
}

// ============================================================================
// Message
// ============================================================================

/// Message staged in a UTCB
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub words: heapless::Vec<Word, MAX_MSG_WORDS>,
    pub caps: heapless::Vec<CapId, MAX_MSG_CAPS>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message carrying `words`, excess words are dropped
    pub fn from_words(words: &[Word]) -> Self {
        let mut msg = Self::new();
        for &word in words.iter().take(MAX_MSG_WORDS) {
            let _ = msg.words.push(word);
        }
        msg
    }

    /// Append a capability selector, `false` if the message is full
    pub fn push_cap(&mut self, cap: CapId) -> bool {
        self.caps.push(cap).is_ok()
    }

    pub fn clear(&mut self) {
        self.words.clear();
        self.caps.clear();
    }
}

// ============================================================================
// Signal Delivery
// ============================================================================

/// One delivered signal context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    /// User-defined value bound to the context at creation
    pub imprint: Word,
    /// Number of submissions since the last delivery
    pub count: u32,
}

// ============================================================================
// UTCB
// ============================================================================

/// User-level thread control block
#[derive(Debug, Clone, Default)]
pub struct Utcb {
    /// Outgoing message before a send, incoming message after a receive
    pub msg: Message,
    /// Batch written by the last signal delivery
    pub signals: Vec<Signal>,
    /// Label staged for `new_thread`, `new_pd` and friends
    pub name: Label,
}

impl Utcb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_words_truncates() {
        let words: Vec<Word> = (0..100).collect();
        let msg = Message::from_words(&words);
        assert_eq!(msg.words.len(), MAX_MSG_WORDS);
        assert_eq!(msg.words[63], 63);
    }

    #[test]
    fn test_cap_limit() {
        let mut msg = Message::new();
        for n in 1..=MAX_MSG_CAPS as u32 {
            assert!(msg.push_cap(CapId(n)));
        }
        assert!(!msg.push_cap(CapId(99)));
        msg.clear();
        assert!(msg.caps.is_empty());
    }

    #[test]
    fn test_label_truncates() {
        let long = "a-very-long-thread-label-that-does-not-fit";
        assert_eq!(label(long).len(), LABEL_LEN);
        assert_eq!(label("init").as_str(), "init");
    }
}
