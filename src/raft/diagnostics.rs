use async_std::sync::{Arc, Mutex};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::raft::message::{ApplyMsg, Server};

// Holds information about the execution of a cluster over time. Can be used
// to perform various integrity checks based on the recorded data. For
// instance, there should be no term in the cluster's history where members
// disagree on who is the leader.
pub struct Diagnostics {
    servers: HashMap<String, Arc<Mutex<ServerDiagnostics>>>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    // Returns a new instance which, initially, know about no servers.
    pub fn new() -> Self {
        Diagnostics {
            servers: HashMap::new(),
        }
    }

    // Returns the ServerDiagnostics object for the supplied server, creating
    // one if necessary.
    pub fn get_server(&mut self, server: &Server) -> Arc<Mutex<ServerDiagnostics>> {
        self.servers
            .entry(server.name.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ServerDiagnostics::new())))
            .clone()
    }

    // Performs a set of a sequence of checks on the data recorded by the
    // individual servers. Returns an error if any of the checks fail.
    pub async fn validate(&self) -> Result<(), String> {
        self.validate_leaders().await?;
        self.validate_applied().await?;
        Ok(())
    }

    // Validates that across the execution history, all servers have a
    // compatible view of who was the leader for every term. Specifically,
    // there should be no term for which two servers recognize different peers
    // as the leader of the cluster.
    async fn validate_leaders(&self) -> Result<(), String> {
        let mut leaders: BTreeMap<i64, Server> = BTreeMap::new();
        for (name, server) in &self.servers {
            let s = server.lock().await;
            if let Some(conflict) = s.conflicts.first() {
                return Err(format!("Server {} saw conflicting leaders: {}", name, conflict));
            }
            for (term, leader) in &s.leaders {
                match leaders.get(term) {
                    Some(existing) if existing != leader => {
                        return Err(format!(
                            "Incompatible leader for term {}: {} and {}",
                            term, existing, leader
                        ));
                    }
                    Some(_) => (),
                    None => {
                        leaders.insert(*term, leader.clone());
                    }
                }
            }
        }
        debug!(terms = leaders.len(), "validated leaders");
        Ok(())
    }

    // Validates that every server applied a contiguous prefix of the log,
    // starting at index 1, and that no two servers applied different commands
    // at the same index.
    async fn validate_applied(&self) -> Result<(), String> {
        let mut applied: BTreeMap<i64, ApplyMsg> = BTreeMap::new();
        for (name, server) in &self.servers {
            let s = server.lock().await;
            for (position, message) in s.applied.iter().enumerate() {
                let expected = position as i64 + 1;
                if message.index != expected {
                    return Err(format!(
                        "Server {} applied index {} but expected {}",
                        name, message.index, expected
                    ));
                }
                match applied.get(&message.index) {
                    Some(existing) if existing.command != message.command => {
                        return Err(format!(
                            "Server {} applied a different command at index {}",
                            name, message.index
                        ));
                    }
                    Some(_) => (),
                    None => {
                        applied.insert(message.index, message.clone());
                    }
                }
            }
        }
        debug!(entries = applied.len(), "validated applied entries");
        Ok(())
    }
}

// Holds information about a single server's execution as part of a raft
// cluster over time.
pub struct ServerDiagnostics {
    // Keeps track of the leader for each term.
    leaders: BTreeMap<i64, Server>,

    // Descriptions of any leader conflicts observed by this server.
    conflicts: Vec<String>,

    // Everything applied since the server (re)started.
    applied: Vec<ApplyMsg>,
}

impl ServerDiagnostics {
    fn new() -> Self {
        ServerDiagnostics {
            leaders: BTreeMap::new(),
            conflicts: Vec::new(),
            applied: Vec::new(),
        }
    }

    // Called when the server acknowledges a leader for the supplied term.
    pub fn report_leader(&mut self, term: i64, leader: &Server) {
        match self.leaders.get(&term) {
            Some(existing) if existing != leader => {
                let conflict = format!("term {}: {} and {}", term, existing, leader);
                warn!("conflicting leaders for {}", conflict);
                self.conflicts.push(conflict);
            }
            Some(_) => (),
            None => {
                self.leaders.insert(term, leader.clone());
            }
        }
    }

    // Called for every message the server delivers to its service.
    pub fn report_applied(&mut self, message: &ApplyMsg) {
        self.applied.push(message.clone());
    }

    // Called when the server restarts, at which point it applies its log from
    // the beginning again.
    pub fn reset_applied(&mut self) {
        self.applied.clear();
    }

    pub fn applied(&self) -> &[ApplyMsg] {
        &self.applied
    }
}
