use bytes::Bytes;

use crate::raft::error::{RaftError, RaftResult};
use crate::raft::message::{Entry, EntryId};

// Represents the replicated log of a single member. Indexes are 1-based and
// contiguous. The entry immediately before the first one is the (0, 0)
// sentinel, which every log contains.
#[derive(Clone)]
pub struct Log {
    entries: Vec<Entry>,

    // The sum of the sizes of all payloads in the stored entries.
    size_bytes: i64,
}

impl Log {
    // Returns a new instance holding the supplied entries, which must start at
    // index 1 and be contiguous.
    pub fn new(entries: Vec<Entry>) -> RaftResult<Self> {
        let mut next_index = 1;
        let mut last_term = 0;
        let mut total_size_bytes = 0;
        for entry in &entries {
            if entry.index != next_index {
                return Err(RaftError::NonContiguousLog {
                    expected: next_index,
                    actual: entry.index,
                });
            }
            if entry.term < last_term {
                return Err(RaftError::Internal(format!(
                    "Entry {} has a lower term than its predecessor",
                    entry.id()
                )));
            }
            last_term = entry.term;
            total_size_bytes += size_bytes(entry);
            next_index += 1;
        }

        Ok(Log {
            entries,
            size_bytes: total_size_bytes,
        })
    }

    // Returns a log with no entries.
    pub fn initial() -> Self {
        Log {
            entries: Vec::new(),
            size_bytes: 0,
        }
    }

    // Adds a new entry to the end of the log. Returns the id of the newly
    // appended entry.
    pub fn append(&mut self, term: i64, payload: Bytes) -> EntryId {
        assert!(term >= self.last_id().term, "Appended term went backwards");

        let entry = Entry::new(term, self.next_index(), payload);
        let entry_id = entry.id();
        self.size_bytes += size_bytes(&entry);
        self.entries.push(entry);
        entry_id
    }

    // Returns the id of the last entry, or the sentinel if the log is empty.
    pub fn last_id(&self) -> EntryId {
        match self.entries.last() {
            Some(entry) => entry.id(),
            None => EntryId::sentinel(),
        }
    }

    // Returns the expected index of the next element added to the log.
    pub fn next_index(&self) -> i64 {
        self.last_id().index + 1
    }

    // Returns true if a log ending in the supplied id is at least as
    // up-to-date as this log.
    pub fn is_up_to_date(&self, other_last: &EntryId) -> bool {
        let this_last = self.last_id();
        if this_last.term != other_last.term {
            return other_last.term > this_last.term;
        }

        // Terms are equal, last index decides.
        other_last.index >= this_last.index
    }

    // Returns true if the supplied entry id is present in this log. Both the
    // term and the index need to match. The sentinel is always present.
    pub fn contains(&self, query: &EntryId) -> bool {
        match self.id_at(query.index) {
            Some(id) => &id == query,
            None => false,
        }
    }

    // Returns the id of the entry at the supplied index, if present. Index 0
    // resolves to the sentinel.
    pub fn id_at(&self, index: i64) -> Option<EntryId> {
        if index == 0 {
            return Some(EntryId::sentinel());
        }
        self.entry_at(index).map(|e| e.id())
    }

    // Returns the entry at the supplied (positive) index, if present.
    pub fn entry_at(&self, index: i64) -> Option<&Entry> {
        if index < 1 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    // Returns all entries with an index strictly greater than the supplied one.
    pub fn entries_after(&self, index: i64) -> Vec<Entry> {
        let start = index.max(0) as usize;
        if start >= self.entries.len() {
            return Vec::new();
        }
        self.entries[start..].to_vec()
    }

    // Returns all the entries in the log, in order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    // Incorporates entries received from a leader. Entries already present with
    // a matching term are left alone. At the first entry whose term conflicts
    // with ours, our log is truncated from that index onward and the remaining
    // supplied entries appended. Returns whether the log changed.
    //
    // Note that we never drop entries beyond the supplied ones unless there is
    // a conflict: an older (delayed) request must not undo a newer one.
    pub fn merge(&mut self, entries: &[Entry]) -> RaftResult<bool> {
        let Some(first) = entries.first() else {
            return Ok(false);
        };

        // Reject bad batches before touching anything.
        if first.index < 1 || first.index > self.next_index() {
            return Err(RaftError::NonContiguousLog {
                expected: self.next_index(),
                actual: first.index,
            });
        }
        for (entry, expected) in entries.iter().zip(first.index..) {
            if entry.index != expected {
                return Err(RaftError::NonContiguousLog {
                    expected,
                    actual: entry.index,
                });
            }
        }

        let mut changed = false;
        for entry in entries {
            if entry.index < self.next_index() {
                if self.id_at(entry.index) == Some(entry.id()) {
                    continue;
                }
                self.truncate_from(entry.index);
            }
            self.size_bytes += size_bytes(entry);
            self.entries.push(entry.clone());
            changed = true;
        }
        Ok(changed)
    }

    // Computes the hint a follower returns to a leader whose "previous" entry
    // is not in this log. Returns (conflict_index, conflict_term). A term of 0
    // means our log is too short and the leader should continue at the index.
    pub fn conflict_hint(&self, previous: &EntryId) -> (i64, i64) {
        let term = match self.id_at(previous.index) {
            None => return (self.next_index(), 0),
            Some(id) => id.term,
        };

        let mut first = previous.index;
        while first > 1 && self.id_at(first - 1).map(|id| id.term) == Some(term) {
            first -= 1;
        }
        (first, term)
    }

    // Returns the highest index holding an entry of the supplied term.
    pub fn last_index_of_term(&self, term: i64) -> Option<i64> {
        self.entries
            .iter()
            .rev()
            .skip_while(|e| e.term > term)
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    // Returns the total size in bytes of all stored payloads.
    pub fn size_bytes(&self) -> i64 {
        self.size_bytes
    }

    // Removes the entry at the supplied index and everything after it.
    fn truncate_from(&mut self, index: i64) {
        let local = (index - 1).max(0) as usize;
        for entry in self.entries.drain(local..) {
            self.size_bytes -= size_bytes(&entry);
        }
    }
}

fn size_bytes(entry: &Entry) -> i64 {
    entry.payload.len() as i64
}
