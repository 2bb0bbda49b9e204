use async_std::sync::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc::{UnboundedReceiver, unbounded};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::raft::cluster::Cluster;
use crate::raft::diagnostics::ServerDiagnostics;
use crate::raft::error::{RaftError, RaftResult};
use crate::raft::message::{
    AppendRequest, AppendResponse, ApplyMsg, Entry, EntryId, Server, VoteRequest, VoteResponse,
};
use crate::raft::network::{Raft, Transport};
use crate::raft::options::Options;
use crate::raft::persistence::Persistence;
use crate::raft::store::Store;

// Upper bound on how long "commit" waits for an appended entry to commit.
const COMMIT_TIMEOUT_MS: u64 = 2000;

// Canonical implementation of the raft service. Acts as one server among peers
// which form a cluster.
//
// Cloning is cheap and yields a handle to the same server. Background tasks
// hold such handles, so they only stop once "kill" has been called.
#[derive(Clone)]
pub struct RaftImpl {
    address: Server,
    options: Arc<Options>,
    state: Arc<Mutex<RaftState>>,
    transport: Arc<dyn Transport + Send + Sync>,
    killed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    span: Span,
}

// A point-in-time summary of a server's state.
#[derive(Debug, Clone, PartialEq)]
pub struct RaftStatus {
    pub term: i64,
    pub is_leader: bool,
    pub voted_for: Option<Server>,
    pub leader: Option<Server>,
    pub last: EntryId,
    pub committed: i64,
    pub applied: i64,
}

impl RaftImpl {
    // Creates a new server, restoring any state previously written to the
    // supplied persistence. Returns the server together with the stream of
    // committed entries. Nothing happens until "run" is called.
    pub async fn new(
        address: &Server,
        all: &[Server],
        options: Options,
        persistence: Box<dyn Persistence + Send + Sync>,
        transport: Arc<dyn Transport + Send + Sync>,
        diagnostics: Option<Arc<Mutex<ServerDiagnostics>>>,
    ) -> RaftResult<(RaftImpl, UnboundedReceiver<ApplyMsg>)> {
        options.validate()?;
        let (sender, receiver) = unbounded();
        let store = Store::new(persistence, sender, &address.name).await?;
        let election_deadline = Instant::now() + options.follower_timeout();

        let raft = RaftImpl {
            address: address.clone(),
            options: Arc::new(options),
            state: Arc::new(Mutex::new(RaftState {
                store,
                role: RaftRole::Follower,
                cluster: Cluster::new(address.clone(), all),
                election_deadline,
                diagnostics,
            })),
            transport,
            killed: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            span: info_span!("raft", server = %address),
        };
        Ok((raft, receiver))
    }

    // Starts the background activity of this server. The server starts out as
    // a follower in whatever term it restored from persistence.
    pub fn run(&self) {
        let raft = self.clone();
        tokio::spawn(
            async move {
                info!("starting");
                raft.role_loop().await;
                info!("stopped");
            }
            .instrument(self.span.clone()),
        );
    }

    pub fn address(&self) -> &Server {
        &self.address
    }

    // Appends the supplied command to the log if we are the leader. Returns the
    // id of the new entry, or None if we are not the leader (or killed). Does
    // not wait for the entry to be replicated.
    pub async fn start(&self, command: Bytes) -> RaftResult<Option<EntryId>> {
        if self.is_killed() {
            return Ok(None);
        }
        let mut state = self.state.lock().await;
        if self.is_killed() || !state.role.is_leader() {
            return Ok(None);
        }

        let term = state.store.term();
        let result = state.store.append(term, command).await;
        let entry_id = self.guard_fatal(result)?;
        debug!(parent: &self.span, entry = %entry_id, "appended new entry");

        // Matters for single-server clusters, where nobody else will reply.
        state.update_committed()?;
        Ok(Some(entry_id))
    }

    // Returns the current term and whether we believe we are the leader.
    pub async fn get_state(&self) -> (i64, bool) {
        let state = self.state.lock().await;
        if self.is_killed() {
            return (state.store.term(), false);
        }
        (state.store.term(), state.role.is_leader())
    }

    pub async fn status(&self) -> RaftStatus {
        let state = self.state.lock().await;
        RaftStatus {
            term: state.store.term(),
            is_leader: !self.is_killed() && state.role.is_leader(),
            voted_for: state.store.voted_for(),
            leader: state.cluster.leader(),
            last: state.store.log().last_id(),
            committed: state.store.committed_index(),
            applied: state.store.applied_index(),
        }
    }

    // Returns a copy of all the entries currently in our log.
    pub async fn entries(&self) -> Vec<Entry> {
        self.state.lock().await.store.log().entries().to_vec()
    }

    // Stops all background activity. Any further calls into this instance
    // return without touching its state. Calling this more than once is fine.
    pub fn kill(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            info!(parent: &self.span, "killed");
        }
        self.shutdown.notify_waiters();
    }

    // Kills this instance and waits for any state change already under way to
    // finish. Once this returns, the instance never writes to its persistence
    // again, so a replacement can safely take over the same storage.
    pub async fn shutdown(&self) {
        self.kill();

        // Everyone else checks for "killed" after taking the lock.
        let _state = self.state.lock().await;
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    // Makes a leader revert to follower without changing the term.
    pub async fn step_down(&self) -> RaftResult<()> {
        self.check_alive()?;
        let mut state = self.state.lock().await;
        self.check_alive()?;
        if !state.role.is_leader() {
            return Err(RaftError::NotLeader {
                leader: state.cluster.leader().map(|l| l.name),
            });
        }
        let term = state.store.term();
        info!(parent: &self.span, term, "stepping down");
        let result = self.become_follower(&mut state, term).await;
        self.guard_fatal(result)
    }

    // Appends the supplied command and waits for it to be committed. Returns
    // the id of the committed entry. Fails if we are not the leader or if the
    // entry got replaced by another leader's entry.
    pub async fn commit(&self, command: Bytes) -> RaftResult<EntryId> {
        let entry_id = match self.start(command).await? {
            Some(entry_id) => entry_id,
            None => return Err(self.not_leader().await),
        };

        let receiver = self.state.lock().await.store.add_listener(entry_id.index);
        match timeout(Duration::from_millis(COMMIT_TIMEOUT_MS), receiver).await {
            Ok(Ok(committed)) if committed == entry_id => Ok(entry_id),
            Ok(Ok(committed)) => {
                debug!(parent: &self.span, expected = %entry_id, actual = %committed, "entry replaced");
                Err(self.not_leader().await)
            }
            Ok(Err(_)) => Err(RaftError::Killed),
            Err(_) => Err(RaftError::Internal(format!(
                "Timed out waiting for entry {} to commit",
                entry_id
            ))),
        }
    }

    async fn not_leader(&self) -> RaftError {
        let state = self.state.lock().await;
        RaftError::NotLeader {
            leader: state.cluster.leader().map(|l| l.name),
        }
    }

    fn check_alive(&self) -> RaftResult<()> {
        if self.is_killed() {
            return Err(RaftError::Killed);
        }
        Ok(())
    }

    // Kills this instance if the supplied result carries a fatal error. A
    // server which cannot persist its state must stop participating.
    fn guard_fatal<T>(&self, result: RaftResult<T>) -> RaftResult<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(parent: &self.span, "fatal error, shutting down: {}", e);
                self.kill();
            }
        }
        result
    }

    // Sleeps for the supplied duration. Returns false if we got killed.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => (),
            _ = self.shutdown.notified() => (),
        }
        !self.is_killed()
    }

    // Drives role transitions triggered by the passage of time. Followers and
    // candidates whose election deadline has passed start a new election.
    async fn role_loop(&self) {
        loop {
            if self.is_killed() {
                return;
            }
            let deadline = {
                let state = self.state.lock().await;
                match state.role {
                    RaftRole::Leader { .. } => None,
                    _ => Some(state.election_deadline),
                }
            };

            let alive = match deadline {
                // Leaders have no deadline, their replication tasks do the work.
                None => self.pause(self.options.leader_replicate()).await,
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => (),
                        _ = self.shutdown.notified() => (),
                    }
                    !self.is_killed()
                }
            };
            if !alive {
                return;
            }

            let mut state = self.state.lock().await;
            if self.is_killed() || state.role.is_leader() {
                continue;
            }

            // The deadline may have been pushed back while we were sleeping.
            if Instant::now() < state.election_deadline {
                continue;
            }
            let result = self.become_candidate(&mut state).await;
            if self.guard_fatal(result).is_err() {
                return;
            }
        }
    }

    // Reverts to follower in the supplied term, which must not be lower than
    // our current one. Clears our vote if the term changes.
    async fn become_follower(&self, state: &mut RaftState, term: i64) -> RaftResult<()> {
        if term > state.store.term() {
            state.store.update_term_info(term, &None).await?;
            state.cluster.clear_leader();
        }
        if !matches!(state.role, RaftRole::Follower) {
            info!(parent: &self.span, term, "became follower");
            state.role = RaftRole::Follower;
            state.reset_deadline(self.options.follower_timeout());
        }
        Ok(())
    }

    // Starts a new election in the next term, voting for ourselves.
    async fn become_candidate(&self, state: &mut RaftState) -> RaftResult<()> {
        let term = state.store.term() + 1;
        state
            .store
            .update_term_info(term, &Some(self.address.clone()))
            .await?;
        state.cluster.clear_leader();
        state.role = RaftRole::Candidate {
            votes: HashSet::from([self.address.name.clone()]),
        };
        state.reset_deadline(self.options.candidate_timeout());
        info!(parent: &self.span, term, last = %state.store.log().last_id(), "starting election");

        if state.cluster.is_majority(1) {
            self.become_leader(state).await;
            return Ok(());
        }

        let request = VoteRequest {
            term,
            candidate: Some(self.address.clone()),
            last: Some(state.store.log().last_id()),
        };
        for peer in state.cluster.others() {
            let raft = self.clone();
            let request = request.clone();
            tokio::spawn(
                async move { raft.request_vote(peer, request).await }.instrument(self.span.clone()),
            );
        }
        Ok(())
    }

    // Takes over as leader for the current term and starts replicating to
    // every other member.
    async fn become_leader(&self, state: &mut RaftState) {
        let term = state.store.term();
        let next_index = state.store.log().next_index();
        let followers = state
            .cluster
            .others()
            .into_iter()
            .map(|peer| {
                let position = FollowerPosition {
                    next_index,
                    match_index: 0,
                };
                (peer.name, position)
            })
            .collect();
        state.role = RaftRole::Leader { followers };
        state.cluster.record_leader(&self.address);
        info!(parent: &self.span, term, "became leader");
        if let Some(d) = &state.diagnostics {
            d.lock().await.report_leader(term, &self.address);
        }

        for peer in state.cluster.others() {
            let raft = self.clone();
            tokio::spawn(
                async move { raft.replicate_loop(peer, term).await }.instrument(self.span.clone()),
            );
        }
    }

    // Asks a single peer for its vote and incorporates the answer.
    async fn request_vote(&self, peer: Server, request: VoteRequest) {
        let term = request.term;
        debug!(peer = %peer, term, "requesting vote");
        let response = match timeout(self.options.rpc_timeout(), self.transport.vote(&peer, request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!(peer = %peer, "vote request failed: {}", e);
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "vote request timed out");
                return;
            }
        };

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if self.is_killed() {
            return;
        }
        if response.term > state.store.term() {
            info!(peer = %peer, term = response.term, "detected higher term");
            let result = self.become_follower(state, response.term).await;
            let _ = self.guard_fatal(result);
            return;
        }

        // The world has moved on since we asked.
        if state.store.term() != term || !response.granted {
            return;
        }
        let won = match &mut state.role {
            RaftRole::Candidate { votes } => {
                votes.insert(peer.name.clone());
                debug!(peer = %peer, votes = votes.len(), "got vote");
                state.cluster.is_majority(votes.len())
            }
            _ => false,
        };
        if won {
            self.become_leader(state).await;
        }
    }

    // Keeps a single follower up to date for as long as we remain leader in
    // the supplied term. Doubles as the heartbeat.
    async fn replicate_loop(&self, peer: Server, term: i64) {
        loop {
            if self.is_killed() {
                return;
            }
            let request = {
                let state = self.state.lock().await;
                if state.store.term() != term || !state.role.is_leader() {
                    debug!(peer = %peer, term, "no longer leader, stopping replication");
                    return;
                }
                state.create_append_request(&self.address, &peer)
            };

            if let Some(request) = request {
                self.replicate_once(&peer, request).await;
            }
            if !self.pause(self.options.leader_replicate()).await {
                return;
            }
        }
    }

    async fn replicate_once(&self, peer: &Server, request: AppendRequest) {
        let call = self.transport.append(peer, request.clone());
        let response = match timeout(self.options.rpc_timeout(), call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                debug!(peer = %peer, "append request failed: {}", e);
                return;
            }
            Err(_) => {
                debug!(peer = %peer, "append request timed out");
                return;
            }
        };

        let mut state = self.state.lock().await;
        if self.is_killed() {
            return;
        }
        if response.term > state.store.term() {
            info!(peer = %peer, term = response.term, "detected higher term");
            let result = self.become_follower(&mut state, response.term).await;
            let _ = self.guard_fatal(result);
            return;
        }
        if state.store.term() != request.term {
            return;
        }
        state.handle_append_response(peer, &request, &response);
        if let Err(e) = state.update_committed() {
            warn!("failed to update committed index: {}", e);
        }
    }

    async fn handle_vote(&self, request: VoteRequest) -> RaftResult<VoteResponse> {
        self.check_alive()?;
        let candidate = request.candidate.ok_or_else(|| RaftError::missing("candidate"))?;
        let last = request.last.ok_or_else(|| RaftError::missing("last"))?;

        let mut state = self.state.lock().await;
        self.check_alive()?;
        debug!(candidate = %candidate, term = request.term, last = %last, "handling vote request");

        // Reject anything from an outdated term.
        if request.term < state.store.term() {
            return Ok(VoteResponse {
                term: state.store.term(),
                granted: false,
            });
        }

        // If we're in an outdated term, we revert to follower in the new later
        // term and may still grant the requesting candidate our vote.
        if request.term > state.store.term() {
            let result = self.become_follower(&mut state, request.term).await;
            self.guard_fatal(result)?;
        }

        let term = state.store.term();
        let available = match state.store.voted_for() {
            None => true,
            Some(voted_for) => voted_for == candidate,
        };
        let granted = available && state.store.log().is_up_to_date(&last);
        if granted {
            let result = state.store.update_term_info(term, &Some(candidate.clone())).await;
            self.guard_fatal(result)?;
            state.reset_deadline(self.options.follower_timeout());
            info!(candidate = %candidate, term, "granted vote");
        } else {
            info!(
                candidate = %candidate,
                term,
                voted_for = ?state.store.voted_for().map(|s| s.name),
                "denied vote"
            );
        }
        Ok(VoteResponse { term, granted })
    }

    async fn handle_append(&self, request: AppendRequest) -> RaftResult<AppendResponse> {
        self.check_alive()?;
        let leader = request.leader.clone().ok_or_else(|| RaftError::missing("leader"))?;
        let previous = request.previous.ok_or_else(|| RaftError::missing("previous"))?;
        if let Some(first) = request.entries.first() {
            if first.index != previous.index + 1 {
                return Err(RaftError::NonContiguousLog {
                    expected: previous.index + 1,
                    actual: first.index,
                });
            }
        }

        let mut state = self.state.lock().await;
        self.check_alive()?;
        debug!(
            leader = %leader,
            term = request.term,
            previous = %previous,
            entries = request.entries.len(),
            "handling append request"
        );

        // Handle the case where we are ahead of the leader. We inform the
        // leader of our (greater) term and fail the append.
        if request.term < state.store.term() {
            return Ok(AppendResponse {
                term: state.store.term(),
                success: false,
                conflict_index: 0,
                conflict_term: 0,
            });
        }

        if request.term == state.store.term() && state.role.is_leader() {
            warn!(leader = %leader, term = request.term, "another leader in our own term");
        }
        let result = self.become_follower(&mut state, request.term).await;
        self.guard_fatal(result)?;
        state.reset_deadline(self.options.follower_timeout());

        let term = state.store.term();
        if state.cluster.leader().as_ref() != Some(&leader) {
            info!(leader = %leader, term, "following new leader");
            state.cluster.record_leader(&leader);
        }
        if let Some(d) = &state.diagnostics {
            d.lock().await.report_leader(term, &leader);
        }

        // Make sure we have the previous entry. If not, tell the leader where
        // to continue.
        if !state.store.log().contains(&previous) {
            let (conflict_index, conflict_term) = state.store.log().conflict_hint(&previous);
            debug!(previous = %previous, conflict_index, conflict_term, "missing previous entry");
            return Ok(AppendResponse {
                term,
                success: false,
                conflict_index,
                conflict_term,
            });
        }

        let result = state.store.merge(&request.entries).await;
        self.guard_fatal(result)?;

        // Everything up to the last entry in this request is known to match the
        // leader's log, so it is safe to commit up to there.
        let last_new = previous.index + request.entries.len() as i64;
        state.store.commit_to(request.committed.min(last_new))?;

        Ok(AppendResponse {
            term,
            success: true,
            conflict_index: 0,
            conflict_term: 0,
        })
    }
}

#[async_trait]
impl Raft for RaftImpl {
    async fn vote(&self, request: VoteRequest) -> RaftResult<VoteResponse> {
        self.handle_vote(request).instrument(self.span.clone()).await
    }

    async fn append(&self, request: AppendRequest) -> RaftResult<AppendResponse> {
        self.handle_append(request).instrument(self.span.clone()).await
    }
}

// Holds the state a cluster leader tracks about its followers. Used to decide
// which entries to replicate to the follower.
#[derive(Debug, Clone, PartialEq)]
struct FollowerPosition {
    // Next log entry to send to the follower.
    next_index: i64,

    // Highest index known to be replicated on the follower.
    match_index: i64,
}

enum RaftRole {
    Follower,
    Candidate {
        // Names of the members which granted us their vote, ourselves included.
        votes: HashSet<String>,
    },
    Leader {
        followers: HashMap<String, FollowerPosition>,
    },
}

impl RaftRole {
    fn is_leader(&self) -> bool {
        matches!(self, RaftRole::Leader { .. })
    }
}

struct RaftState {
    // Persistent state, commit index and apply pipeline.
    store: Store,

    // Volatile state.
    role: RaftRole,
    cluster: Cluster,

    // Followers and candidates start a new election once this passes.
    election_deadline: Instant,

    // If present, this instance will inform the diagnostics object of relevant
    // updates as they happen during execution.
    diagnostics: Option<Arc<Mutex<ServerDiagnostics>>>,
}

impl RaftState {
    fn reset_deadline(&mut self, timeout: Duration) {
        self.election_deadline = Instant::now() + timeout;
    }

    // Returns the next append request to send to this follower, or None if we
    // are not leading or don't know the follower.
    fn create_append_request(&self, me: &Server, follower: &Server) -> Option<AppendRequest> {
        let RaftRole::Leader { followers } = &self.role else {
            return None;
        };
        let position = followers.get(&follower.name)?;
        let log = self.store.log();
        let next_index = position.next_index.clamp(1, log.next_index());
        let previous = log.id_at(next_index - 1)?;
        Some(AppendRequest {
            term: self.store.term(),
            leader: Some(me.clone()),
            previous: Some(previous),
            entries: log.entries_after(previous.index),
            committed: self.store.committed_index(),
        })
    }

    // Incorporates the provided response corresponding to the supplied request.
    // Must only be called for responses in our current term.
    fn handle_append_response(
        &mut self,
        peer: &Server,
        request: &AppendRequest,
        response: &AppendResponse,
    ) {
        let log = self.store.log();
        let RaftRole::Leader { followers } = &mut self.role else {
            return;
        };
        let Some(f) = followers.get_mut(&peer.name) else {
            debug!(peer = %peer, "ignoring append response for unknown peer");
            return;
        };
        let previous = request.previous.unwrap_or_else(EntryId::sentinel);
        let old = f.clone();

        if response.success {
            // Responses can arrive out of order, so only ever move forward.
            let matched = previous.index + request.entries.len() as i64;
            f.match_index = f.match_index.max(matched);
            f.next_index = f.next_index.max(f.match_index + 1);
        } else {
            // Only the rejection of our latest attempt tells us anything new.
            if previous.index + 1 != f.next_index {
                return;
            }
            let hinted = match response.conflict_term {
                0 => response.conflict_index,
                term => log
                    .last_index_of_term(term)
                    .map(|index| index + 1)
                    .unwrap_or(response.conflict_index),
            };
            f.next_index = hinted.min(f.next_index - 1).max(f.match_index + 1).max(1);
        }

        if *f != old {
            debug!(
                peer = %peer,
                next_index = f.next_index,
                match_index = f.match_index,
                "updated follower position"
            );
        }
    }

    // Scans the state of our followers in the hope of finding a new index which
    // has been replicated to a majority. Only entries from the current term are
    // committed this way; earlier ones get committed along with them.
    fn update_committed(&mut self) -> RaftResult<()> {
        let RaftRole::Leader { followers } = &self.role else {
            return Ok(());
        };
        let term = self.store.term();
        let log = self.store.log();
        let committed = self.store.committed_index();

        let candidate = (committed + 1..log.next_index())
            .rev()
            .take_while(|index| log.id_at(*index).is_some_and(|id| id.term == term))
            .find(|index| {
                // We match.
                let matches = 1 + followers.values().filter(|f| f.match_index >= *index).count();
                self.cluster.is_majority(matches)
            });

        match candidate {
            Some(index) => self.store.commit_to(index),
            None => Ok(()),
        }
    }
}
