//! Fixed-size IPC messages.
//!
//! A message is a tag (label + untyped word count) followed by up to
//! [`MSG_WORDS`] message registers. Messages are `Copy` and never allocate.

use crate::id::Word;

/// Number of untyped message registers carried per message.
pub const MSG_WORDS: usize = 16;

/// Message tag: protocol label and the number of words in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgTag {
    pub label: u16,
    pub len: u8,
}

impl MsgTag {
    /// Packs the tag into one word (`label << 16 | len`).
    #[must_use]
    pub const fn to_word(self) -> Word {
        (self.label as Word) << 16 | self.len as Word
    }
}

/// One IPC message.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Message {
    tag: MsgTag,
    words: [Word; MSG_WORDS],
}

impl Message {
    /// An empty message with `label`.
    #[must_use]
    pub const fn new(label: u16) -> Self {
        Self {
            tag: MsgTag { label, len: 0 },
            words: [0; MSG_WORDS],
        }
    }

    /// Builds a message from `label` and `words`, truncating at [`MSG_WORDS`].
    #[must_use]
    pub fn with_words(label: u16, words: &[Word]) -> Self {
        let mut msg = Self::new(label);
        for &w in words.iter().take(MSG_WORDS) {
            msg.push(w);
        }
        msg
    }

    /// Appends one word. Returns `false` when the registers are full.
    pub fn push(&mut self, word: Word) -> bool {
        let len = self.tag.len as usize;
        if len == MSG_WORDS {
            return false;
        }
        self.words[len] = word;
        self.tag.len += 1;
        true
    }

    #[must_use]
    pub const fn tag(&self) -> MsgTag {
        self.tag
    }

    #[must_use]
    pub const fn label(&self) -> u16 {
        self.tag.label
    }

    /// The words in use.
    #[must_use]
    pub fn words(&self) -> &[Word] {
        &self.words[..self.tag.len as usize]
    }

    /// Word `i`, or 0 when `i` is past the end.
    #[must_use]
    pub fn word(&self, i: usize) -> Word {
        self.words().get(i).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tag.len as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tag.len == 0
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("label", &self.tag.label)
            .field("words", &self.words())
            .finish()
    }
}
