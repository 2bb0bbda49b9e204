// Messages exchanged between cluster members, as well as the persisted state of a
// member. All of these are prost messages so that they can be put on a wire or
// written to disk as-is.

use bytes::Bytes;
use std::fmt;

// Identifies a single member of the cluster.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Message)]
pub struct Server {
    #[prost(string, tag = "1")]
    pub name: String,
}

impl Server {
    pub fn new(name: &str) -> Self {
        Server {
            name: name.to_string(),
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// The position of an entry in the log. The (term=0, index=0) id is a sentinel
// which stands for the empty prefix before the first entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct EntryId {
    #[prost(int64, tag = "1")]
    pub term: i64,
    #[prost(int64, tag = "2")]
    pub index: i64,
}

impl EntryId {
    pub fn new(term: i64, index: i64) -> Self {
        EntryId { term, index }
    }

    pub fn sentinel() -> Self {
        EntryId { term: 0, index: 0 }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(term={},index={})", self.term, self.index)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Entry {
    #[prost(int64, tag = "1")]
    pub term: i64,
    #[prost(int64, tag = "2")]
    pub index: i64,
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
}

impl Entry {
    pub fn new(term: i64, index: i64, payload: Bytes) -> Self {
        Entry {
            term,
            index,
            payload,
        }
    }

    pub fn id(&self) -> EntryId {
        EntryId::new(self.term, self.index)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VoteRequest {
    #[prost(int64, tag = "1")]
    pub term: i64,
    #[prost(message, optional, tag = "2")]
    pub candidate: Option<Server>,
    // The id of the last entry in the candidate's log.
    #[prost(message, optional, tag = "3")]
    pub last: Option<EntryId>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VoteResponse {
    #[prost(int64, tag = "1")]
    pub term: i64,
    #[prost(bool, tag = "2")]
    pub granted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendRequest {
    #[prost(int64, tag = "1")]
    pub term: i64,
    #[prost(message, optional, tag = "2")]
    pub leader: Option<Server>,
    // The id of the entry immediately preceding "entries".
    #[prost(message, optional, tag = "3")]
    pub previous: Option<EntryId>,
    #[prost(message, repeated, tag = "4")]
    pub entries: Vec<Entry>,
    // The leader's commit index.
    #[prost(int64, tag = "5")]
    pub committed: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AppendResponse {
    #[prost(int64, tag = "1")]
    pub term: i64,
    #[prost(bool, tag = "2")]
    pub success: bool,
    // Only set on failed consistency checks. Lets the leader skip back a whole
    // term at a time rather than one entry per round trip.
    #[prost(int64, tag = "3")]
    pub conflict_index: i64,
    #[prost(int64, tag = "4")]
    pub conflict_term: i64,
}

// Everything a member needs to write to durable storage before acting on it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PersistentState {
    #[prost(int64, tag = "1")]
    pub term: i64,
    #[prost(message, optional, tag = "2")]
    pub voted_for: Option<Server>,
    #[prost(message, repeated, tag = "3")]
    pub entries: Vec<Entry>,
}

// Delivered to the service for every committed entry, in index order.
#[derive(Clone, Debug, PartialEq)]
pub struct ApplyMsg {
    pub index: i64,
    pub command: Bytes,
}
