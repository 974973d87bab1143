/*!
 * Receive-Side Byte Accumulator
 *
 * A `Buffer` collects bytes read off a socket and holds at most one pending
 * match term: a delimiter byte-string or an exact byte count. When the term
 * is satisfied the matched chunk is split off and handed to the waiting
 * loop; everything past the match stays buffered for the next term.
 */

use bytes::{Bytes, BytesMut};

/// A pending match criterion on incoming bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// Match the shortest prefix ending with these bytes; the match includes
    /// the delimiter itself.
    Delimiter(Bytes),
    /// Match exactly this many bytes.
    Length(usize),
}

impl Term {
    pub fn delimiter(delim: impl AsRef<[u8]>) -> Term {
        let delim = delim.as_ref();
        assert!(!delim.is_empty(), "empty delimiter term");
        Term::Delimiter(Bytes::copy_from_slice(delim))
    }

    pub fn length(n: usize) -> Term {
        assert!(n > 0, "zero-length term");
        Term::Length(n)
    }
}

#[derive(Debug, Default)]
pub struct Buffer {
    data: BytesMut,
    term: Option<Term>,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::default()
    }

    /// Append bytes without touching the pending term. Used by the read edge
    /// to accumulate a whole socket drain before matching once.
    pub(crate) fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append bytes and, if the pending term is now satisfied, split off and
    /// return the matched chunk.
    pub fn feed(&mut self, bytes: &[u8]) -> Option<Bytes> {
        self.append(bytes);
        self.check()
    }

    /// Install a match term. At most one term may be active at a time;
    /// installing a different term over an active one is an engine invariant
    /// violation (terms are cleared on every loop wake).
    pub fn set_term(&mut self, term: Term) {
        if let Some(current) = &self.term {
            assert!(
                *current == term,
                "conflicting buffer term: {current:?} replaced by {term:?}"
            );
        }
        self.term = Some(term);
    }

    /// With the current term, split off and return the match if already
    /// satisfied. Matching is greedy at the earliest position.
    pub fn check(&mut self) -> Option<Bytes> {
        let take = match self.term.as_ref()? {
            Term::Delimiter(delim) => find(&self.data, delim)? + delim.len(),
            Term::Length(n) if self.data.len() >= *n => *n,
            Term::Length(_) => return None,
        };
        Some(self.data.split_to(take).freeze())
    }

    /// Discard the active term, keeping buffered bytes.
    pub fn clear_term(&mut self) {
        self.term = None;
    }

    /// Return and clear all buffered bytes. Used at shutdown to surface
    /// trailing data to whoever was waiting.
    pub fn pop(&mut self) -> Bytes {
        self.data.split().freeze()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
