mod client;
pub use client::{Client, Members, new_client};

mod cluster;

mod consensus;
pub use consensus::{RaftImpl, RaftStatus};

mod diagnostics;
pub use diagnostics::{Diagnostics, ServerDiagnostics};

mod error;
pub use error::{RaftError, RaftResult};

mod failure_injection;
pub use failure_injection::FailureOptions;

mod log;

pub mod message;
pub use message::{ApplyMsg, Entry, EntryId, Server};

mod network;
pub use network::{LocalNetwork, Raft, Transport};

mod options;
pub use options::Options;

pub mod persistence;
pub use persistence::{MemoryPersistence, Persistence, PersistenceOptions};

mod store;
