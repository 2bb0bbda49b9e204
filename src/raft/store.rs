use bytes::Bytes;
use futures::channel::mpsc::UnboundedSender;
use futures::channel::oneshot::{Receiver, Sender, channel};
use prost::Message;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::raft::error::{RaftError, RaftResult};
use crate::raft::log::Log;
use crate::raft::message::{ApplyMsg, Entry, EntryId, PersistentState, Server};
use crate::raft::persistence::Persistence;

// Handles the state of a Raft member which has to survive restarts (term, vote
// and log) together with the bookkeeping built on top of it: the committed
// index, delivering committed entries to the service in order, and informing
// listeners waiting for specific indexes to commit.
//
// Every mutation of the persistent state is written out before the mutating
// call returns, so callers can reply to RPCs as soon as the call completes.
pub struct Store {
    // Dependencies and constants.
    name: String,
    persistence: Box<dyn Persistence + Send + Sync>,
    apply_sender: UnboundedSender<ApplyMsg>,

    // Persistent raft state as defined in the paper.
    log: Log,
    term: i64,
    voted_for: Option<Server>,

    // Non-persistent. Just bookkeeping.
    committed: i64,
    applied: i64,

    listener_uid: i64,
    listeners: BTreeSet<CommitListener>,
}

impl Store {
    pub async fn new(
        persistence: Box<dyn Persistence + Send + Sync>,
        apply_sender: UnboundedSender<ApplyMsg>,
        name: &str,
    ) -> RaftResult<Self> {
        let mut result = Self {
            name: name.to_string(),
            persistence,
            apply_sender,

            log: Log::initial(),
            term: 0,
            voted_for: None,

            committed: 0,
            applied: 0,

            listener_uid: 0,
            listeners: BTreeSet::new(),
        };

        // Restoring has to happen before anything else touches the store, to
        // avoid clobbering the persisted state.
        result.restore_persisted().await?;
        Ok(result)
    }

    // Reads state from the persistence instance and installs it in this store.
    async fn restore_persisted(&mut self) -> RaftResult<()> {
        let blob = match self.persistence.read_state().await? {
            Some(blob) if !blob.is_empty() => blob,
            _ => {
                info!(name = %self.name, "no persisted state, starting fresh");
                return Ok(());
            }
        };

        let loaded = PersistentState::decode(blob).map_err(|e| RaftError::Decode(e.to_string()))?;
        self.log = Log::new(loaded.entries)?;
        self.term = loaded.term;
        self.voted_for = loaded.voted_for;
        info!(
            name = %self.name,
            term = self.term,
            voted_for = ?self.voted_for.as_ref().map(|s| s.name.as_str()),
            last = %self.log.last_id(),
            "restored persisted state"
        );
        Ok(())
    }

    // Writes the supplied persistent state. Callers only install new state in
    // memory once this has succeeded, so memory never runs ahead of disk.
    async fn persist(&self, term: i64, voted_for: &Option<Server>, log: &Log) -> RaftResult<()> {
        let state = PersistentState {
            term,
            voted_for: voted_for.clone(),
            entries: log.entries().to_vec(),
        };
        self.persistence
            .save_state(Bytes::from(state.encode_to_vec()))
            .await?;
        Ok(())
    }

    pub fn term(&self) -> i64 {
        self.term
    }

    pub fn voted_for(&self) -> Option<Server> {
        self.voted_for.clone()
    }

    // Returns read access to the log. Mutations have to go through the store
    // so that they get persisted.
    pub fn log(&self) -> &Log {
        &self.log
    }

    // Updates the term information in persistent state.
    pub async fn update_term_info(&mut self, term: i64, voted_for: &Option<Server>) -> RaftResult<()> {
        assert!(term >= self.term, "Term should never decrease");
        self.persist(term, voted_for, &self.log).await?;
        self.term = term;
        self.voted_for = voted_for.clone();
        Ok(())
    }

    // Appends a new entry with the supplied payload. Returns the id of the
    // created entry once it has been persisted.
    pub async fn append(&mut self, term: i64, payload: Bytes) -> RaftResult<EntryId> {
        let mut log = self.log.clone();
        let entry_id = log.append(term, payload);
        self.persist(self.term, &self.voted_for, &log).await?;
        self.log = log;
        Ok(entry_id)
    }

    // Incorporates entries sent by a leader, replacing any conflicting suffix.
    // Only writes to persistence if the log actually changed.
    pub async fn merge(&mut self, entries: &[Entry]) -> RaftResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut log = self.log.clone();
        if !log.merge(entries)? {
            return Ok(());
        }
        self.persist(self.term, &self.voted_for, &log).await?;
        self.log = log;
        debug!(
            name = %self.name,
            last = %self.log.last_id(),
            size_bytes = self.log.size_bytes(),
            "merged entries"
        );
        Ok(())
    }

    // Returns the index up to (and including) which the corresponding entries are
    // considered committed.
    pub fn committed_index(&self) -> i64 {
        self.committed
    }

    // Returns the index up to (and including) which the entries have been handed
    // to the service.
    pub fn applied_index(&self) -> i64 {
        self.applied
    }

    // Marks the stored entries up to (and including) the supplied index as
    // committed, delivering them to the service and informing listeners.
    // Calls with an index at or below the current commit index are no-ops.
    pub fn commit_to(&mut self, new_commit_index: i64) -> RaftResult<()> {
        if new_commit_index <= self.committed {
            return Ok(());
        }
        if new_commit_index >= self.log.next_index() {
            return Err(RaftError::Internal(format!(
                "Cannot commit index {} beyond the end of the log at {}",
                new_commit_index,
                self.log.last_id()
            )));
        }

        let old_commit_index = self.committed;
        self.committed = new_commit_index;
        debug!(
            name = %self.name,
            "updated committed index from {} to {}", old_commit_index, self.committed
        );

        self.apply_committed();
        self.resolve_listeners();
        Ok(())
    }

    // Registers a listener for the supplied index. The returned receiver
    // resolves with the id of whichever entry ends up committed at the index.
    pub fn add_listener(&mut self, index: i64) -> Receiver<EntryId> {
        let (sender, receiver) = channel::<EntryId>();
        self.listeners.insert(CommitListener {
            index,
            sender,
            uid: self.listener_uid,
        });
        self.listener_uid += 1;

        // If the index has already been committed, resolve immediately.
        self.resolve_listeners();

        receiver
    }

    // Hands every committed but not yet applied entry to the service, in order.
    fn apply_committed(&mut self) {
        while self.applied < self.committed {
            let index = self.applied + 1;
            let entry = match self.log.entry_at(index) {
                Some(entry) => entry,
                None => {
                    warn!(name = %self.name, index, "committed entry missing from log");
                    return;
                }
            };

            let message = ApplyMsg {
                index,
                command: entry.payload.clone(),
            };
            if self.apply_sender.unbounded_send(message).is_err() {
                // The service went away. We still advance so that we never
                // deliver anything twice.
                debug!(name = %self.name, index, "apply channel closed");
            }
            self.applied = index;
            debug!(name = %self.name, entry = %entry.id(), "applied");
        }
    }

    // Tries to resolve the promises for listeners waiting for commits.
    fn resolve_listeners(&mut self) {
        while self
            .listeners
            .first()
            .is_some_and(|first| first.index <= self.committed)
        {
            let Some(next) = self.listeners.pop_first() else {
                break;
            };
            let index = next.index;
            match self.log.id_at(index) {
                Some(id) => {
                    next.sender
                        .send(id)
                        .map_err(|_| debug!("Listener for commit {} no longer listening", index))
                        .ok();
                }
                // Dropping the sender notifies the receiver of the cancellation.
                None => (),
            }
        }
    }
}

// Each instance represents an ongoing commit operation waiting for the committed
// index to reach the index of their tentative new entry.
#[derive(Debug)]
struct CommitListener {
    // The index the listener would like to be notified about.
    index: i64,

    // Used to send the resulting entry id to the listener.
    sender: Sender<EntryId>,

    // Used to disambiguate between structs for the same index.
    uid: i64,
}

impl Eq for CommitListener {}

impl PartialEq<Self> for CommitListener {
    fn eq(&self, other: &Self) -> bool {
        (self.index, self.uid).eq(&(other.index, other.uid))
    }
}

impl PartialOrd<Self> for CommitListener {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CommitListener {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.index, self.uid).cmp(&(other.index, other.uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::persistence::{MemoryPersistence, PersistenceOptions};
    use crate::raft::persistence;
    use futures::FutureExt;
    use futures::StreamExt;
    use futures::channel::mpsc::{UnboundedReceiver, unbounded};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_initial() {
        let fixture = Fixture::new();
        let (store, _) = fixture.make_store().await;
        assert_eq!(store.committed_index(), 0);
        assert_eq!(store.applied_index(), 0);
        assert_eq!(store.log().next_index(), 1);
        assert_eq!(store.term(), 0);
        assert_eq!(store.voted_for(), None);
    }

    #[tokio::test]
    async fn test_commit_to_bad_index() {
        let fixture = Fixture::new();
        let (mut store, _) = fixture.make_store().await;
        store.append(2, Bytes::new()).await.unwrap();

        // Attempt to "commit to" a value which hasn't yet been appended.
        assert!(store.commit_to(17).is_err());
        assert_eq!(store.committed_index(), 0);
    }

    #[tokio::test]
    async fn test_commit_to_applies_in_order() {
        let fixture = Fixture::new();
        let (mut store, mut applied) = fixture.make_store().await;
        store.append(2, Bytes::from("a")).await.unwrap();
        store.append(2, Bytes::from("b")).await.unwrap();
        let eid = store.append(3, Bytes::from("c")).await.unwrap();

        store.commit_to(2).unwrap();
        assert_eq!(store.applied_index(), 2);

        // Should succeed (noop), commit never goes backwards.
        store.commit_to(1).unwrap();
        assert_eq!(store.committed_index(), 2);

        store.commit_to(eid.index).unwrap();
        assert_eq!(store.applied_index(), 3);

        let messages: Vec<ApplyMsg> = (0..3).map(|_| applied.next().now_or_never().unwrap().unwrap()).collect();
        assert_eq!(messages[0], apply_msg(1, "a"));
        assert_eq!(messages[1], apply_msg(2, "b"));
        assert_eq!(messages[2], apply_msg(3, "c"));

        // Nothing delivered twice.
        assert!(applied.next().now_or_never().is_none());
    }

    #[tokio::test]
    async fn test_commit_with_closed_channel() {
        let fixture = Fixture::new();
        let (mut store, applied) = fixture.make_store().await;
        drop(applied);

        store.append(2, Bytes::from("a")).await.unwrap();
        store.commit_to(1).unwrap();
        assert_eq!(store.applied_index(), 1);
    }

    #[tokio::test]
    async fn test_listener() {
        let fixture = Fixture::new();
        let (mut store, _) = fixture.make_store().await;
        let receiver = store.add_listener(2);

        store.append(67, Bytes::new()).await.unwrap();
        store.append(68, Bytes::new()).await.unwrap();
        store.append(68, Bytes::new()).await.unwrap();

        store.commit_to(2).unwrap();
        let output = receiver.now_or_never();
        assert!(output.is_some());

        let result = output.unwrap().unwrap();
        assert_eq!(2, result.index);
        assert_eq!(68, result.term);
    }

    #[tokio::test]
    async fn test_listener_multi() {
        let fixture = Fixture::new();
        let (mut store, _) = fixture.make_store().await;
        let receiver1 = store.add_listener(1);
        let receiver2 = store.add_listener(2);
        let receiver3 = store.add_listener(1);

        store.append(67, Bytes::new()).await.unwrap();
        store.append(67, Bytes::new()).await.unwrap();
        store.commit_to(1).unwrap();

        assert!(receiver1.now_or_never().is_some());
        assert!(receiver2.now_or_never().is_none());
        assert!(receiver3.now_or_never().is_some());
    }

    #[tokio::test]
    async fn test_listener_past() {
        let fixture = Fixture::new();
        let (mut store, _) = fixture.make_store().await;

        store.append(67, Bytes::new()).await.unwrap();
        store.append(67, Bytes::new()).await.unwrap();
        store.commit_to(2).unwrap();

        let receiver = store.add_listener(1);
        assert!(receiver.now_or_never().is_some());
    }

    #[tokio::test]
    async fn test_listener_sees_replaced_entry() {
        let fixture = Fixture::new();
        let (mut store, _) = fixture.make_store().await;

        let ours = store.append(3, Bytes::from("ours")).await.unwrap();
        let receiver = store.add_listener(ours.index);

        // A new leader overwrites the entry before it gets committed.
        store.merge(&[Entry::new(4, 1, Bytes::from("theirs"))]).await.unwrap();
        store.commit_to(1).unwrap();

        let committed = receiver.now_or_never().unwrap().unwrap();
        assert_ne!(committed, ours);
        assert_eq!(committed, EntryId::new(4, 1));
    }

    #[tokio::test]
    async fn test_restore_persisted_voted_for() {
        let fixture = Fixture::new();
        let voted_for = Some(Server::new("some-server"));

        // Make some changes with a first store, then let it go out of scope.
        {
            let (mut store, _) = fixture.make_store().await;
            store.update_term_info(4, &voted_for).await.unwrap();
        }

        // Now create another store backed by the same state and check we can load contents.
        {
            let (store, _) = fixture.make_store().await;
            assert_eq!(store.voted_for(), voted_for);
            assert_eq!(store.term(), 4);
        }
    }

    #[tokio::test]
    async fn test_restore_persisted_term() {
        let fixture = Fixture::new();
        let term = 728;

        {
            let (mut store, _) = fixture.make_store().await;
            store.update_term_info(term, &None).await.unwrap();
        }

        {
            let (store, _) = fixture.make_store().await;
            assert_eq!(store.term(), term);
        }
    }

    #[tokio::test]
    async fn test_restore_persisted_entries() {
        let fixture = Fixture::new();

        {
            let (mut store, _) = fixture.make_store().await;
            store
                .merge(&[
                    payload_entry(12, 1),
                    payload_entry(12, 2),
                    payload_entry(12, 3),
                ])
                .await
                .unwrap();
            assert_eq!(3, store.log().last_id().index);
        }

        {
            let (store, _) = fixture.make_store().await;
            assert_eq!(store.log().last_id(), EntryId::new(12, 3));

            // Commit state is volatile and starts over.
            assert_eq!(store.committed_index(), 0);
        }
    }

    #[tokio::test]
    async fn test_restore_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let options = PersistenceOptions::Directory {
            path: temp_dir.path().to_str().unwrap().to_string(),
            wipe: false,
        };

        {
            let persistence = persistence::new(options.clone()).await.unwrap();
            let (sender, _receiver) = unbounded();
            let mut store = Store::new(persistence, sender, "file-store").await.unwrap();
            store.update_term_info(9, &Some(Server::new("B"))).await.unwrap();
            store.append(9, Bytes::from("payload")).await.unwrap();
        }

        let persistence = persistence::new(options).await.unwrap();
        let (sender, _receiver) = unbounded();
        let store = Store::new(persistence, sender, "file-store").await.unwrap();
        assert_eq!(store.term(), 9);
        assert_eq!(store.voted_for(), Some(Server::new("B")));
        assert_eq!(store.log().entry_at(1).unwrap().payload, Bytes::from("payload"));
    }

    #[tokio::test]
    async fn test_restore_garbage_fails() {
        let fixture = Fixture::new();
        fixture
            .memory
            .save_state(Bytes::from(vec![0xff, 0xff, 0xff]))
            .await
            .unwrap();

        let (sender, _receiver) = unbounded();
        let result = Store::new(Box::new(fixture.memory.clone()), sender, "garbage").await;
        assert!(matches!(result, Err(RaftError::Decode(_))));
    }

    #[tokio::test]
    async fn test_failed_write_is_reported() {
        let fixture = Fixture::new();
        let (mut store, _) = fixture.make_store().await;
        fixture.memory.set_fail_writes(true);

        let result = store.update_term_info(3, &Some(Server::new("A"))).await;
        assert!(matches!(result, Err(RaftError::Persistence(_))));
        assert!(store.append(3, Bytes::new()).await.is_err());
        assert!(store.merge(&[payload_entry(3, 1)]).await.is_err());

        // Nothing that failed to persist is visible.
        assert_eq!(store.term(), 0);
        assert_eq!(store.voted_for(), None);
        assert_eq!(store.log().next_index(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_write_leaves_memory_behind_disk() {
        let fixture = Fixture::new();
        let (mut store, _) = fixture.make_store().await;
        fixture.memory.set_write_delay(Duration::from_millis(200));

        let entries = [payload_entry(1, 1), payload_entry(1, 2)];
        let merge = store.merge(&entries);
        assert!(timeout(Duration::from_millis(20), merge).await.is_err());
        assert_eq!(store.log().next_index(), 1);

        // Retrying writes the entries out rather than treating them as present.
        store.merge(&entries).await.unwrap();
        assert_eq!(store.log().next_index(), 3);
        assert_eq!(fixture.persisted().await.entries.len(), 2);

        let voted_for = Some(Server::new("B"));
        let update = store.update_term_info(4, &voted_for);
        assert!(timeout(Duration::from_millis(20), update).await.is_err());
        assert_eq!(store.term(), 0);
        assert_eq!(store.voted_for(), None);
    }

    struct Fixture {
        memory: MemoryPersistence,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                memory: MemoryPersistence::new(),
            }
        }

        async fn persisted(&self) -> PersistentState {
            let blob = self.memory.read_state().await.unwrap().unwrap();
            PersistentState::decode(blob).unwrap()
        }

        async fn make_store(&self) -> (Store, UnboundedReceiver<ApplyMsg>) {
            let (sender, receiver) = unbounded();
            let store = Store::new(Box::new(self.memory.clone()), sender, "testing-store")
                .await
                .unwrap();
            (store, receiver)
        }
    }

    fn payload_entry(term: i64, index: i64) -> Entry {
        Entry::new(term, index, Bytes::new())
    }

    fn apply_msg(index: i64, command: &'static str) -> ApplyMsg {
        ApplyMsg {
            index,
            command: Bytes::from(command),
        }
    }
}
