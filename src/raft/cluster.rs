use crate::raft::message::Server;

// Holds information about the (fixed) membership of a Raft cluster.
pub struct Cluster {
    others: Vec<Server>,
    last_known_leader: Option<Server>,
}

impl Cluster {
    // Creates a new cluster object from the supplied servers. The list of all
    // servers may or may not include "me".
    pub fn new(me: Server, all: &[Server]) -> Self {
        let mut others: Vec<Server> = all.iter().filter(|s| **s != me).cloned().collect();
        others.sort();
        others.dedup();
        Cluster {
            others,
            last_known_leader: None,
        }
    }

    // Returns the last known leader of this cluster, if any. This information could
    // be stale.
    pub fn leader(&self) -> Option<Server> {
        self.last_known_leader.clone()
    }

    // Stores the fact that we have observed a new leader.
    pub fn record_leader(&mut self, leader: &Server) {
        self.last_known_leader = Some(leader.clone());
    }

    // Forgets about the last known leader, e.g., because a new term has started.
    pub fn clear_leader(&mut self) {
        self.last_known_leader = None;
    }

    // Returns the addresses of all other members in the cluster.
    pub fn others(&self) -> Vec<Server> {
        self.others.to_vec()
    }

    // Returns the number of participants in the cluster (including us).
    pub fn size(&self) -> usize {
        self.others.len() + 1
    }

    // Returns true if the supplied number of members (including us, if we
    // count ourselves) constitutes a strict majority of the cluster.
    pub fn is_majority(&self, count: usize) -> bool {
        2 * count > self.size()
    }
}
