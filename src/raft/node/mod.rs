mod candidate;
mod follower;
mod leader;

pub use candidate::Candidate;
pub use follower::Follower;
pub use leader::Leader;

use crate::error::{Error, Result};
use crate::raft::log::Log;
use crate::raft::message::{Event, Message, NodeId};
use crate::raft::state::State;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// The interval between node ticks. Timeouts below are counted in ticks.
pub const TICK_INTERVAL: Duration = Duration::from_millis(25);

/// The minimum election timeout, in ticks
const ELECTION_TIMEOUT_MIN: u64 = 8;

/// The maximum election timeout, in ticks
const ELECTION_TIMEOUT_MAX: u64 = 12;

/// The minimum leader heartbeat interval, in ticks
const HEARTBEAT_INTERVAL_MIN: u64 = 4;

/// The maximum leader heartbeat interval, in ticks
const HEARTBEAT_INTERVAL_MAX: u64 = 8;

/// A snapshot of a node's externally observable state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub id: NodeId,
    pub role: String,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub last_index: u64,
    pub commit_index: u64,
    pub apply_index: u64,
}

/// The local Raft node state machine
pub enum Node {
    Initialise(RoleNode<Initialise>),
    Follower(RoleNode<Follower>),
    Candidate(RoleNode<Candidate>),
    Leader(RoleNode<Leader>),
}

impl Node {
    /// Creates a new Raft node. It starts in the initialise role and joins
    /// the consensus protocol once it receives its membership via Init.
    pub fn new(
        id: &str,
        mut log: Log,
        mut state: Box<dyn State>,
        node_tx: mpsc::UnboundedSender<Message>,
    ) -> Result<Self> {
        let applied_index = state.applied_index();
        if applied_index > log.commit_index {
            return Err(Error::Internal(format!(
                "State machine applied index {} greater than log commit index {}",
                applied_index, log.commit_index
            )));
        }
        log.apply_index = applied_index;
        if log.apply_index < log.commit_index {
            info!(
                "Replaying log entries {} to {}",
                log.apply_index + 1,
                log.commit_index
            );
            while log.apply(&mut *state)?.is_some() {}
        }

        let (term, voted_for) = log.load_term()?;
        let node = RoleNode {
            id: id.to_owned(),
            peers: Vec::new(),
            term,
            log,
            state,
            node_tx,
            role: Initialise { voted_for },
        };
        Ok(node.into())
    }

    /// Returns the node id
    pub fn id(&self) -> NodeId {
        match self {
            Node::Initialise(n) => n.id.clone(),
            Node::Follower(n) => n.id.clone(),
            Node::Candidate(n) => n.id.clone(),
            Node::Leader(n) => n.id.clone(),
        }
    }

    /// Returns the node's current term
    pub fn term(&self) -> u64 {
        match self {
            Node::Initialise(n) => n.term,
            Node::Follower(n) => n.term,
            Node::Candidate(n) => n.term,
            Node::Leader(n) => n.term,
        }
    }

    /// Returns a read-only view of the node's log
    pub fn log(&self) -> &Log {
        match self {
            Node::Initialise(n) => &n.log,
            Node::Follower(n) => &n.log,
            Node::Candidate(n) => &n.log,
            Node::Leader(n) => &n.log,
        }
    }

    /// Returns a status snapshot of the node
    pub fn status(&self) -> Status {
        let role = match self {
            Node::Initialise(_) => "initialise",
            Node::Follower(_) => "follower",
            Node::Candidate(_) => "candidate",
            Node::Leader(_) => "leader",
        };
        let leader = match self {
            Node::Follower(n) => n.role.leader.clone(),
            Node::Leader(n) => Some(n.id.clone()),
            _ => None,
        };
        let log = self.log();
        Status {
            id: self.id(),
            role: role.to_owned(),
            term: self.term(),
            leader,
            last_index: log.last_index,
            commit_index: log.commit_index,
            apply_index: log.apply_index,
        }
    }

    /// Processes an inbound message. A message carrying a newer term than
    /// ours preempts the current role: we adopt the term, clear our vote,
    /// and step down to follower before dispatching in the new role.
    pub fn step(mut self, msg: Message) -> Result<Self> {
        debug!("Stepping {:?}", msg);
        if let Some(term) = msg.event.term() {
            if term > self.term() && !matches!(self, Node::Initialise(_)) {
                self = match self {
                    Node::Initialise(_) => unreachable!(),
                    Node::Follower(n) => n.into_follower(term)?.into(),
                    Node::Candidate(n) => n.into_follower(term)?.into(),
                    Node::Leader(n) => n.into_follower(term)?.into(),
                };
            }
        }
        match self {
            Node::Initialise(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Candidate(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    /// Moves time forward by a tick
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Initialise(n) => Ok(n.into()),
            Node::Follower(n) => n.tick(),
            Node::Candidate(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }
}

impl From<RoleNode<Initialise>> for Node {
    fn from(rn: RoleNode<Initialise>) -> Self {
        Node::Initialise(rn)
    }
}

impl From<RoleNode<Follower>> for Node {
    fn from(rn: RoleNode<Follower>) -> Self {
        Node::Follower(rn)
    }
}

impl From<RoleNode<Candidate>> for Node {
    fn from(rn: RoleNode<Candidate>) -> Self {
        Node::Candidate(rn)
    }
}

impl From<RoleNode<Leader>> for Node {
    fn from(rn: RoleNode<Leader>) -> Self {
        Node::Leader(rn)
    }
}

/// A node that has not yet been handed its cluster membership
#[derive(Debug)]
pub struct Initialise {
    /// The vote recorded for the current term, restored from the log
    pub(super) voted_for: Option<NodeId>,
}

impl RoleNode<Initialise> {
    /// Processes a message. Only Init is answered; membership is fixed for
    /// the lifetime of the node, and everything else is dropped until it
    /// arrives.
    pub fn step(mut self, msg: Message) -> Result<Node> {
        match msg.event {
            Event::Init { nodes } => {
                self.peers = nodes.into_iter().filter(|n| n != &self.id).collect();
                info!(
                    "Initialised node {} with {} peers, following",
                    self.id,
                    self.peers.len()
                );
                let voted_for = self.role.voted_for.take();
                Ok(self.become_role(Follower::new(None, voted_for))?.into())
            }
            event => {
                debug!("Dropping {:?} while uninitialised", event);
                Ok(self.into())
            }
        }
    }
}

/// A Raft node with role R
pub struct RoleNode<R> {
    pub(super) id: NodeId,
    /// The other cluster members. Fixed at initialisation.
    pub(super) peers: Vec<NodeId>,
    pub(super) term: u64,
    pub(super) log: Log,
    pub(super) state: Box<dyn State>,
    pub(super) node_tx: mpsc::UnboundedSender<Message>,
    pub(super) role: R,
}

impl<R> RoleNode<R> {
    /// Transforms the node into another role
    fn become_role<T>(self, role: T) -> Result<RoleNode<T>> {
        Ok(RoleNode {
            id: self.id,
            peers: self.peers,
            term: self.term,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            role,
        })
    }

    /// Adopts a newer term, clearing our vote, and steps down to follower
    /// with an unknown leader
    fn into_follower(mut self, term: u64) -> Result<RoleNode<Follower>> {
        info!("Discovered new term {}, stepping down to follower", term);
        self.term = term;
        self.log.save_term(term, None)?;
        self.become_role(Follower::new(None, None))
    }

    /// Returns the quorum size of the cluster
    fn quorum(&self) -> u64 {
        (self.peers.len() as u64 + 1) / 2 + 1
    }

    /// Sends an event to another node
    fn send(&self, to: &str, event: Event) -> Result<()> {
        let msg = Message {
            from: self.id.clone(),
            to: to.to_owned(),
            event,
        };
        debug!("Sending {:?}", msg);
        Ok(self.node_tx.send(msg)?)
    }

    /// Sends the same event to every peer
    fn broadcast(&self, event: Event) -> Result<()> {
        for peer in &self.peers {
            self.send(peer, event.clone())?;
        }
        Ok(())
    }

    /// Forwards a message to another node, preserving the original sender
    fn forward(&self, to: &str, msg: Message) -> Result<()> {
        let msg = Message {
            from: msg.from,
            to: to.to_owned(),
            event: msg.event,
        };
        debug!("Forwarding {:?}", msg);
        Ok(self.node_tx.send(msg)?)
    }

    /// Applies all newly committed entries to the state machine, returning
    /// the callers of entries that requested a reply with their results
    fn apply_committed(&mut self) -> Result<Vec<(crate::raft::log::Caller, Result<Vec<u8>>)>> {
        let mut replies = Vec::new();
        while let Some((caller, result)) = self.log.apply(&mut *self.state)? {
            if let Some(caller) = caller {
                replies.push((caller, result));
            }
        }
        Ok(replies)
    }
}
