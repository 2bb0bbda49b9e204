use rand::Rng;
use std::ops::Range;
use std::time::Duration;

use crate::raft::error::{RaftError, RaftResult};

const DEFAULT_FOLLOWER_TIMEOUT_MS: Range<u64> = 300..1500;
const DEFAULT_CANDIDATE_TIMEOUT_MS: Range<u64> = 1000..1300;
const DEFAULT_LEADER_REPLICATE_MS: u64 = 20;
const DEFAULT_RPC_TIMEOUT_MS: u64 = 250;

// Parameters used to configure the behavior of a cluster participant.
#[derive(Debug, Clone)]
pub struct Options {
    // Window from which a follower picks its timeout (uniformly at random),
    // after which it starts a new election.
    follower_timeout_ms: Range<u64>,

    // Window from which a candidate picks its timeout, after which it declares
    // its candidacy a failure and starts a new election.
    candidate_timeout_ms: Range<u64>,

    // How frequently a leader will wake up and replicate entries to followers.
    // Note that this also serves as the leader's heartbeat, so this should be
    // lower than the follower timeout.
    leader_replicate_ms: u64,

    // Upper bound on how long we wait for any single outgoing rpc.
    rpc_timeout_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            follower_timeout_ms: DEFAULT_FOLLOWER_TIMEOUT_MS,
            candidate_timeout_ms: DEFAULT_CANDIDATE_TIMEOUT_MS,
            leader_replicate_ms: DEFAULT_LEADER_REPLICATE_MS,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
        }
    }
}

impl Options {
    pub fn with_follower_timeout_ms(self, range: Range<u64>) -> Self {
        Self {
            follower_timeout_ms: range,
            ..self
        }
    }

    pub fn with_candidate_timeout_ms(self, range: Range<u64>) -> Self {
        Self {
            candidate_timeout_ms: range,
            ..self
        }
    }

    pub fn with_leader_replicate_ms(self, leader_replicate_ms: u64) -> Self {
        Self {
            leader_replicate_ms,
            ..self
        }
    }

    pub fn with_rpc_timeout_ms(self, rpc_timeout_ms: u64) -> Self {
        Self {
            rpc_timeout_ms,
            ..self
        }
    }

    // Checks that the timing parameters can produce a working cluster.
    pub fn validate(&self) -> RaftResult<()> {
        if self.follower_timeout_ms.is_empty() || self.candidate_timeout_ms.is_empty() {
            return Err(RaftError::InvalidArgument(
                "Election timeout ranges must not be empty".to_string(),
            ));
        }
        let min_timeout = self.follower_timeout_ms.start.min(self.candidate_timeout_ms.start);
        if self.leader_replicate_ms == 0 || self.leader_replicate_ms >= min_timeout {
            return Err(RaftError::InvalidArgument(format!(
                "Leader replicate interval {}ms must be positive and below the minimum election timeout {}ms",
                self.leader_replicate_ms, min_timeout
            )));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(RaftError::InvalidArgument(
                "Rpc timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn follower_timeout(&self) -> Duration {
        random_duration(&self.follower_timeout_ms)
    }

    pub fn candidate_timeout(&self) -> Duration {
        random_duration(&self.candidate_timeout_ms)
    }

    pub fn leader_replicate(&self) -> Duration {
        Duration::from_millis(self.leader_replicate_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

// Picks a duration uniformly at random from the supplied range of milliseconds.
fn random_duration(range_ms: &Range<u64>) -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(range_ms.clone()))
}
