use crate::error::Result;
use crate::raft::log::Entry;
use serde_derive::{Deserialize, Serialize};

/// A node identifier, used both as a message address and as a map key
pub type NodeId = String;

/// A message passed between Raft nodes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The sender address
    pub from: NodeId,
    /// The recipient address
    pub to: NodeId,
    /// The message event
    pub event: Event,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// Fixes the cluster membership and activates an initialising node
    Init {
        /// The full membership list, including the recipient
        nodes: Vec<NodeId>,
    },
    /// Candidates solicit votes from all peers
    RequestVote {
        /// The candidate's term
        term: u64,
        /// The campaigning candidate
        candidate_id: NodeId,
        /// The index of the candidate's last log entry
        last_log_index: u64,
        /// The term of the candidate's last log entry
        last_log_term: u64,
    },
    /// A voter grants its vote for the sender's term
    GrantVote { term: u64 },
    /// A voter refuses its vote, returning its current term
    DenyVote { term: u64 },
    /// Leaders replicate log entries to followers. An empty entries payload
    /// doubles as the heartbeat
    AppendEntries {
        /// The leader's term
        term: u64,
        /// The leader's id, so followers can forward client requests
        leader_id: NodeId,
        /// The index of the entry immediately preceding the payload
        prev_log_index: u64,
        /// The term of the entry immediately preceding the payload
        prev_log_term: u64,
        /// Entries to replicate, positioned after prev_log_index
        entries: Vec<Entry>,
        /// The leader's commit index
        leader_commit: u64,
    },
    /// A follower accepted an AppendEntries, reporting its new last index
    AppendSuccess { term: u64, index: u64 },
    /// A follower rejected an AppendEntries, returning its current term
    AppendFailure { term: u64 },
    /// A client submits a command for replication
    ClientRequest {
        /// The client's request id, echoed in the response
        cid: u64,
        /// The opaque state machine command
        command: Vec<u8>,
    },
    /// The committing leader returns the state machine result to the client
    ClientResponse { cid: u64, result: Result<Vec<u8>> },
}

impl Event {
    /// Returns the protocol term carried by the event, if any. Init and
    /// client traffic are termless.
    pub fn term(&self) -> Option<u64> {
        match self {
            Event::RequestVote { term, .. }
            | Event::GrantVote { term }
            | Event::DenyVote { term }
            | Event::AppendEntries { term, .. }
            | Event::AppendSuccess { term, .. }
            | Event::AppendFailure { term } => Some(*term),
            Event::Init { .. } | Event::ClientRequest { .. } | Event::ClientResponse { .. } => None,
        }
    }
}
