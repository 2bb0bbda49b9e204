use async_std::sync::Mutex;
use async_trait::async_trait;
use prost::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::debug;

use crate::raft::error::{RaftError, RaftResult};
use crate::raft::failure_injection::{FailureOptions, Verdict};
use crate::raft::message::{AppendRequest, AppendResponse, Server, VoteRequest, VoteResponse};

// The inbound side of a cluster member: handlers for the rpcs peers send us.
#[async_trait]
pub trait Raft {
    async fn vote(&self, request: VoteRequest) -> RaftResult<VoteResponse>;
    async fn append(&self, request: AppendRequest) -> RaftResult<AppendResponse>;
}

// The outbound side: a way to reach named peers. Calls may be dropped or
// delayed arbitrarily. An error only means "no reply", never that the peer did
// or did not process the request.
#[async_trait]
pub trait Transport {
    async fn vote(&self, peer: &Server, request: VoteRequest) -> RaftResult<VoteResponse>;
    async fn append(&self, peer: &Server, request: AppendRequest) -> RaftResult<AppendResponse>;
}

// Connects cluster members running in the same process. Every request and
// response is encoded and decoded as it would be on a real wire, and every
// call is subject to the configured failure injection.
pub struct LocalNetwork {
    members: Mutex<HashMap<String, Arc<dyn Raft + Send + Sync>>>,
    failures: Arc<Mutex<FailureOptions>>,
}

impl LocalNetwork {
    pub fn new(failures: Arc<Mutex<FailureOptions>>) -> Arc<Self> {
        Arc::new(LocalNetwork {
            members: Mutex::new(HashMap::new()),
            failures,
        })
    }

    // Makes the supplied member reachable under the supplied name, replacing
    // any previous registration.
    pub async fn register(&self, name: &str, member: Arc<dyn Raft + Send + Sync>) {
        self.members.lock().await.insert(name.to_string(), member);
    }

    // Makes the named member unreachable, e.g., because it crashed.
    pub async fn unregister(&self, name: &str) {
        self.members.lock().await.remove(name);
    }

    // Returns a transport which sends calls on behalf of the supplied member.
    pub fn transport(self: &Arc<Self>, src: &str) -> Arc<dyn Transport + Send + Sync> {
        Arc::new(LocalTransport {
            src: src.to_string(),
            network: self.clone(),
        })
    }

    // Applies failure injection for one direction of a call between the
    // supplied members, sleeping for any injected latency.
    async fn intercept(&self, src: &str, dst: &str) -> RaftResult<()> {
        let verdict = self.failures.lock().await.verdict(src, dst);
        match verdict {
            Verdict::Fail(message) => {
                debug!(src, dst, "dropping rpc: {}", message);
                Err(RaftError::unreachable(dst, message))
            }
            Verdict::Deliver(delay) => {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                Ok(())
            }
        }
    }

    async fn member(&self, dst: &str) -> RaftResult<Arc<dyn Raft + Send + Sync>> {
        self.members
            .lock()
            .await
            .get(dst)
            .cloned()
            .ok_or_else(|| RaftError::unreachable(dst, "no such member"))
    }
}

struct LocalTransport {
    src: String,
    network: Arc<LocalNetwork>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn vote(&self, peer: &Server, request: VoteRequest) -> RaftResult<VoteResponse> {
        let dst = peer.name.as_str();
        self.network.intercept(&self.src, dst).await?;
        let member = self.network.member(dst).await?;
        let request = over_the_wire(&request)?;

        // Like a real server, the peer finishes handling the call even if we
        // stop waiting for the reply.
        let response = tokio::spawn(async move { member.vote(request).await })
            .await
            .map_err(|e| RaftError::Internal(format!("Vote handler failed: {}", e)))??;

        // The reply can get lost too.
        self.network.intercept(dst, &self.src).await?;
        over_the_wire(&response)
    }

    async fn append(&self, peer: &Server, request: AppendRequest) -> RaftResult<AppendResponse> {
        let dst = peer.name.as_str();
        self.network.intercept(&self.src, dst).await?;
        let member = self.network.member(dst).await?;
        let request = over_the_wire(&request)?;
        let response = tokio::spawn(async move { member.append(request).await })
            .await
            .map_err(|e| RaftError::Internal(format!("Append handler failed: {}", e)))??;

        self.network.intercept(dst, &self.src).await?;
        over_the_wire(&response)
    }
}

// Returns a copy of the supplied message made by encoding and decoding it.
fn over_the_wire<M: Message + Default>(message: &M) -> RaftResult<M> {
    M::decode(message.encode_to_vec().as_slice()).map_err(|e| RaftError::Internal(e.to_string()))
}
