use async_std::sync::Mutex;
use futures::StreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span};
#[cfg(test)]
use {bytes::Bytes, std::future::Future, std::time::Duration, tokio::time::sleep};

use crate::raft::persistence;
use crate::raft::{
    ApplyMsg, Client, Diagnostics, FailureOptions, LocalNetwork, MemoryPersistence, Members,
    Options, PersistenceOptions, RaftImpl, Server, ServerDiagnostics, new_client,
};

// Represents a collection of participants that interact with each other. In a real
// production deployment, these participants might be on different actual machines,
// but the harness manages all of them in a single process for convenience.
pub struct Harness {
    addresses: Vec<Server>,
    options: Options,
    network: Arc<LocalNetwork>,
    diagnostics: Arc<Mutex<Diagnostics>>,
    failures: Arc<Mutex<FailureOptions>>,

    // The members which are currently up, by name.
    members: Members,

    // Where each member keeps its state. Survives crashes.
    persistence: Mutex<HashMap<String, PersistenceOptions>>,

    // Tasks feeding each running member's applied entries into diagnostics.
    appliers: Mutex<HashMap<String, JoinHandle<()>>>,
}

// Used to capture the configuration of a harness before creating its members.
pub struct HarnessBuilder {
    names: Vec<String>,
    failure: FailureOptions,
    options: Options,

    // If present, members persist to files under this directory. The flag
    // indicates whether to discard existing state.
    directory: Option<(String, bool)>,
}

impl HarnessBuilder {
    // Creates all the members of the harness. They stay idle until "start".
    pub async fn build(self) -> Result<Harness, Box<dyn Error>> {
        if self.names.is_empty() {
            return Err("A harness needs at least one member".into());
        }
        let addresses: Vec<Server> = self.names.iter().map(|n| Server::new(n)).collect();
        let failures = Arc::new(Mutex::new(self.failure));

        let mut persistence = HashMap::new();
        for address in &addresses {
            let options = match &self.directory {
                Some((root, wipe)) => {
                    let path = Path::new(root).join(&address.name);
                    PersistenceOptions::Directory {
                        path: path.to_string_lossy().to_string(),
                        wipe: *wipe,
                    }
                }
                None => PersistenceOptions::Memory(MemoryPersistence::new()),
            };
            persistence.insert(address.name.clone(), options);
        }

        let harness = Harness {
            addresses: addresses.clone(),
            options: self.options,
            network: LocalNetwork::new(failures.clone()),
            diagnostics: Arc::new(Mutex::new(Diagnostics::new())),
            failures,
            members: Arc::new(Mutex::new(BTreeMap::new())),
            persistence: Mutex::new(persistence),
            appliers: Mutex::new(HashMap::new()),
        };
        for address in &addresses {
            harness.launch(address).await?;
        }
        Ok(harness)
    }

    // Consumes this instance and returns an instance with the failure options set.
    pub fn with_failure(self, failure_options: FailureOptions) -> Self {
        Self {
            failure: failure_options,
            ..self
        }
    }

    // Consumes this instance and returns an instance with the raft options set.
    pub fn with_options(self, options: Options) -> Self {
        Self { options, ..self }
    }

    // Consumes this instance and returns one whose members persist their state
    // in a subdirectory of the supplied directory.
    pub fn with_persistence_directory(self, directory: &str, wipe: bool) -> Self {
        Self {
            directory: Some((directory.to_string(), wipe)),
            ..self
        }
    }
}

impl Harness {
    // Creates a harness builder for members with the supplied names.
    pub fn builder(names: Vec<String>) -> HarnessBuilder {
        HarnessBuilder {
            names,
            failure: FailureOptions::no_failures(),
            options: Options::default(),
            directory: None,
        }
    }

    // Returns all the addresses managed by this harness, including the ones of
    // members which are currently down.
    pub fn addresses(&self) -> Vec<Server> {
        self.addresses.clone()
    }

    // Returns the diagnostics object used for this harness.
    pub fn diagnostics(&self) -> Arc<Mutex<Diagnostics>> {
        self.diagnostics.clone()
    }

    // Returns the failure options object used for this harness.
    pub fn failures(&self) -> Arc<Mutex<FailureOptions>> {
        self.failures.clone()
    }

    // Returns the named member, if it is currently up.
    pub async fn member(&self, name: &str) -> Option<RaftImpl> {
        self.members.lock().await.get(name).cloned()
    }

    // Returns a client that can be used to interact with the cluster.
    pub fn make_client(&self) -> Box<dyn Client + Send + Sync> {
        new_client("harness-client", self.members.clone())
    }

    // Validates all available diagnostics.
    pub async fn validate(&self) -> Result<(), String> {
        self.diagnostics.lock().await.validate().await
    }

    // Starts the background logic of all members.
    pub async fn start(&self) {
        for raft in self.members.lock().await.values() {
            raft.run();
        }
        info!(members = self.addresses.len(), "started harness");
    }

    // Stops all the members of this harness.
    pub async fn stop(&self) {
        let names: Vec<String> = self.members.lock().await.keys().cloned().collect();
        for name in names {
            self.crash(&name).await;
        }
        info!("stopped harness");
    }

    // Simulates a crash of the named member. Its persisted state survives and
    // is left alone by the crashed instance from here on.
    pub async fn crash(&self, name: &str) {
        let Some(raft) = self.members.lock().await.remove(name) else {
            return;
        };
        self.network.unregister(name).await;
        raft.shutdown().await;
        if let Some(applier) = self.appliers.lock().await.remove(name) {
            applier.abort();
        }
        info!(server = name, "crashed");
    }

    // Brings a previously crashed member back up from its persisted state.
    pub async fn restart(&self, name: &str) -> Result<(), Box<dyn Error>> {
        let Some(address) = self.addresses.iter().find(|a| a.name == name).cloned() else {
            return Err(format!("Unknown member {}", name).into());
        };
        self.crash(name).await;
        let raft = self.launch(&address).await?;
        raft.run();
        info!(server = name, "restarted");
        Ok(())
    }

    // Returns the entries the named member has applied since it last started.
    pub async fn applied(&self, name: &str) -> Vec<ApplyMsg> {
        let server_diagnostics = self.diagnostics.lock().await.get_server(&Server::new(name));
        let applied = server_diagnostics.lock().await.applied().to_vec();
        applied
    }

    // Returns the (term, leader) pairs of all members which currently believe
    // they are the leader.
    pub async fn leaders(&self) -> Vec<(i64, Server)> {
        let members: Vec<RaftImpl> = self.members.lock().await.values().cloned().collect();
        let mut result = Vec::new();
        for raft in members {
            let (term, is_leader) = raft.get_state().await;
            if is_leader {
                result.push((term, raft.address().clone()));
            }
        }
        result
    }

    // Creates the named member from its persisted state and makes it reachable.
    async fn launch(&self, address: &Server) -> Result<RaftImpl, Box<dyn Error>> {
        let options = {
            let mut persistence = self.persistence.lock().await;
            let Some(options) = persistence.get_mut(&address.name) else {
                return Err(format!("No persistence for {}", address.name).into());
            };
            let current = options.clone();

            // Whatever happens, a restart must pick up where we left off.
            if let PersistenceOptions::Directory { wipe, .. } = options {
                *wipe = false;
            }
            current
        };

        let server_diagnostics = self.diagnostics.lock().await.get_server(address);

        // Restarted members deliver their log from the start again.
        server_diagnostics.lock().await.reset_applied();

        let (raft, applied) = RaftImpl::new(
            address,
            &self.addresses,
            self.options.clone(),
            persistence::new(options).await?,
            self.network.transport(&address.name),
            Some(server_diagnostics.clone()),
        )
        .await
        .map_err(|e| format!("Failed to create Raft for '{}': {}", address.name, e))?;

        self.network.register(&address.name, Arc::new(raft.clone())).await;
        let span = info_span!("apply", server = %address.name);
        let applier = tokio::spawn(collect_applied(applied, server_diagnostics).instrument(span));
        self.appliers.lock().await.insert(address.name.clone(), applier);
        self.members.lock().await.insert(address.name.clone(), raft.clone());
        Ok(raft)
    }

    // Waits until the leader of the highest term among the running members
    // satisfies the supplied matcher. Returns that leader.
    #[cfg(test)]
    pub async fn wait_for_leader<M>(&self, timeout_duration: Duration, matcher: M) -> (i64, Server)
    where
        M: Fn(&(i64, Server)) -> bool,
    {
        wait_for(timeout_duration, || async {
            let latest = self.leaders().await.into_iter().max_by_key(|(term, _)| *term)?;
            if matcher(&latest) { Some(latest) } else { None }
        })
        .await
        .expect("wait_for_leader")
    }

    // Waits until at least "count" members have applied the entry at the
    // supplied index. Returns the applied command.
    #[cfg(test)]
    pub async fn wait_for_applied(
        &self,
        index: i64,
        count: usize,
        timeout_duration: Duration,
    ) -> Bytes {
        wait_for(timeout_duration, || async {
            let mut commands = Vec::new();
            for address in &self.addresses {
                let applied = self.applied(&address.name).await;
                if let Some(message) = applied.iter().find(|m| m.index == index) {
                    commands.push(message.command.clone());
                }
            }
            if commands.len() >= count {
                commands.first().cloned()
            } else {
                None
            }
        })
        .await
        .expect("wait_for_applied")
    }
}

// Feeds everything the member applies into its diagnostics.
async fn collect_applied(
    mut applied: UnboundedReceiver<ApplyMsg>,
    diagnostics: Arc<Mutex<ServerDiagnostics>>,
) {
    while let Some(message) = applied.next().await {
        diagnostics.lock().await.report_applied(&message);
    }
}

// Waits for a condition to become true, up to the given `timeout_duration`.
// Returns `Ok(T)` if the condition is met in time, or `Err(())` on timeout.
#[cfg(test)]
async fn wait_for<F, Fut, T>(timeout_duration: Duration, mut condition: F) -> Result<T, ()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if let Some(result) = condition().await {
            return Ok(result);
        }
        sleep(Duration::from_millis(50)).await;
    }
    Err(())
}
