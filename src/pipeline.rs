/*!
 * Send-Side Priority Pipeline
 *
 * Outbound chunks are queued with a priority; lower values are sent first
 * and equal priorities keep insertion order. The write edge draws bounded
 * slices from the front, and pushes unsent suffixes back after a partial
 * or refused send. A soft close marker lets queued data flush before the
 * connection tears down.
 */

use bytes::{Bytes, BytesMut};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct Entry {
    priority: u8,
    seq: u64,
    data: Bytes,
}

// The heap hands out the entry with the smallest (priority, seq) pair, so
// the comparison is reversed relative to the natural key order.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

/// Outcome of drawing bytes from the pipeline.
pub enum Drained {
    /// Up to the requested number of bytes, in (priority, insertion) order.
    Data(Bytes),
    /// Nothing queued.
    Empty,
    /// Nothing queued and a close was requested: time to tear down.
    CloseRequested,
}

#[derive(Default)]
pub struct Pipeline {
    queue: BinaryHeap<Entry>,
    backed: BytesMut,
    seq: u64,
    close_requested: bool,
}

impl Pipeline {
    pub fn new() -> Pipeline {
        Pipeline::default()
    }

    /// Enqueue a payload. Lower priority values are sent first.
    pub fn add(&mut self, data: impl Into<Bytes>, priority: u8) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.queue.push(Entry {
            priority,
            seq: self.seq,
            data,
        });
        self.seq += 1;
    }

    /// Draw up to `n` bytes, splitting the front entry if needed. Backed-up
    /// bytes from an earlier partial send always come out first.
    pub fn read(&mut self, n: usize) -> Drained {
        if self.is_empty() {
            return if self.close_requested {
                Drained::CloseRequested
            } else {
                Drained::Empty
            };
        }
        let mut out = BytesMut::new();
        if !self.backed.is_empty() {
            let take = n.min(self.backed.len());
            out.extend_from_slice(&self.backed.split_to(take));
        }
        while out.len() < n {
            let Some(mut entry) = self.queue.pop() else {
                break;
            };
            let want = n - out.len();
            if entry.data.len() > want {
                out.extend_from_slice(&entry.data.split_to(want));
                // Remainder keeps its (priority, seq) key, so it stays at
                // the front of its priority class.
                self.queue.push(entry);
                break;
            }
            out.extend_from_slice(&entry.data);
        }
        Drained::Data(out.freeze())
    }

    /// Re-prepend bytes so the next `read` returns them before anything
    /// else. Called after a would-block or partial send.
    pub fn backup(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut backed = BytesMut::with_capacity(data.len() + self.backed.len());
        backed.extend_from_slice(data);
        backed.extend_from_slice(&self.backed);
        self.backed = backed;
    }

    /// Mark the pipeline for teardown once drained.
    pub fn close_request(&mut self) {
        self.close_requested = true;
    }

    pub fn is_empty(&self) -> bool {
        self.backed.is_empty() && self.queue.is_empty()
    }
}
