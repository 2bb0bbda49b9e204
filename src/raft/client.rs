use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_std::sync::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::sleep;
use tracing::debug;

use crate::raft::client::Outcome::{Failure, NewLeader, Success};
use crate::raft::consensus::RaftImpl;
use crate::raft::error::{RaftError, RaftResult};
use crate::raft::message::{EntryId, Server};

const DEFAULT_ATTEMPTS: usize = 10;
const DEFAULT_RETRY_SLEEP_MS: u64 = 100;

// The members of a cluster, by name. Shared with whoever owns the members, so
// that restarted members are picked up.
pub type Members = Arc<Mutex<BTreeMap<String, RaftImpl>>>;

// Returns a new client instance talking to the supplied cluster.
pub fn new_client(name: &str, members: Members) -> Box<dyn Client + Sync + Send> {
    Box::new(ClientImpl {
        name: name.into(),
        members,
        leader: Mutex::new(None),
        max_leader_follow_attempts: DEFAULT_ATTEMPTS,
        retry_sleep: Duration::from_millis(DEFAULT_RETRY_SLEEP_MS),
    })
}

// A client object which can be used to interact with a Raft cluster.
#[async_trait]
pub trait Client {
    // Adds the supplied payload as the next entry in the cluster's shared log.
    // Returns once the payload has been committed (or the operation has failed).
    async fn commit(&self, payload: Bytes) -> RaftResult<EntryId>;

    // Asks the cluster leader to step down. Returns the member which stepped
    // down.
    async fn preempt_leader(&self) -> RaftResult<Server>;
}

// The outcome of an individual operation sent to one member of the cluster.
// Used to facilitate retries which follow the leader around.
enum Outcome<T> {
    // The operation has completed successfully and yielded a result.
    Success(T),

    // The operation failed (permanently) and should not be retried.
    Failure(RaftError),

    // The operation should be retried elsewhere, with the new leader if known.
    NewLeader(Option<String>),
}

impl<T> Outcome<T> {
    fn from_result(result: RaftResult<T>, tried: &str) -> Self {
        match result {
            Ok(value) => Success(value),
            Err(RaftError::NotLeader { leader }) => NewLeader(leader.filter(|l| l != tried)),
            Err(RaftError::Killed)
            | Err(RaftError::Unreachable { .. })
            | Err(RaftError::Internal(_)) => NewLeader(None),
            Err(e) => Failure(e),
        }
    }
}

struct ClientImpl {
    // Used for logging only.
    name: String,

    members: Members,

    // Our current best guess as to who is the leader.
    leader: Mutex<Option<String>>,

    // The number of times to try and redirect the request to a new leader
    // before failing.
    max_leader_follow_attempts: usize,
    retry_sleep: Duration,
}

impl ClientImpl {
    // Encapsulates updating the leader in a thread-safe way.
    async fn update_leader(&self, leader: &str) {
        let mut locked = self.leader.lock().await;
        if locked.as_deref() != Some(leader) {
            *locked = Some(leader.to_string());
            debug!(name = %self.name, leader, "updated leader");
        }
    }

    // Returns the member with the supplied name if known, otherwise the first
    // member after the supplied name (wrapping around).
    async fn pick(&self, preferred: Option<&str>, after: Option<&str>) -> Option<(String, RaftImpl)> {
        let members = self.members.lock().await;
        if let Some(member) = preferred.and_then(|name| members.get(name)) {
            return Some((member.address().name.clone(), member.clone()));
        }
        let next = match after {
            Some(after) => members
                .range::<str, _>((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .next()
                .or_else(|| members.iter().next()),
            None => members.iter().next(),
        };
        next.map(|(name, member)| (name.clone(), member.clone()))
    }

    // Some operations need to talk to the leader. This helper takes care of
    // retrying a supplied operation a fixed number of times, following the
    // leader as it changes and trying members in turn when no leader is known.
    async fn retry_helper<T, Fut>(&self, operation: impl Fn(RaftImpl) -> Fut) -> RaftResult<T>
    where
        Fut: Future<Output = RaftResult<T>>,
    {
        let mut preferred = self.leader.lock().await.clone();
        let mut last_tried: Option<String> = None;
        let attempts = self.max_leader_follow_attempts;
        for _ in 0..attempts {
            let Some((name, member)) = self.pick(preferred.as_deref(), last_tried.as_deref()).await
            else {
                return Err(RaftError::InvalidArgument("Cluster has no members".to_string()));
            };

            match Outcome::from_result(operation(member).await, &name) {
                Failure(e) => return Err(e),
                Success(result) => {
                    self.update_leader(&name).await;
                    return Ok(result);
                }
                NewLeader(Some(new_leader)) => {
                    debug!(name = %self.name, tried = %name, leader = %new_leader, "redirected");
                    preferred = Some(new_leader);
                }
                NewLeader(None) => {
                    debug!(name = %self.name, tried = %name, "no leader known, trying next member");
                    preferred = None;
                }
            }
            last_tried = Some(name);
            sleep(self.retry_sleep).await;
        }
        Err(RaftError::Internal(format!(
            "Failed to contact leader after {} attempts",
            attempts
        )))
    }
}

#[async_trait]
impl Client for ClientImpl {
    async fn commit(&self, payload: Bytes) -> RaftResult<EntryId> {
        self.retry_helper(|member| {
            let payload = payload.clone();
            async move { member.commit(payload).await }
        })
        .await
    }

    async fn preempt_leader(&self) -> RaftResult<Server> {
        self.retry_helper(|member| async move {
            member.step_down().await?;
            Ok(member.address().clone())
        })
        .await
    }
}
