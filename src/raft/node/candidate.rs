use crate::error::Result;
use crate::raft::message::{Event, Message, NodeId};
use crate::raft::node::{
    Follower, Leader, Node, RoleNode, ELECTION_TIMEOUT_MAX, ELECTION_TIMEOUT_MIN,
};
use rand::Rng;
use std::collections::HashSet;
use tracing::{debug, info};

/// A candidate is campaigning to become a leader
#[derive(Debug)]
pub struct Candidate {
    /// Ticks elapsed since election start
    pub(super) election_ticks: u64,
    /// Election timeout, in ticks
    pub(super) election_timeout: u64,
    /// Votes received, by voter. We always start with a vote for ourselves.
    pub(super) votes: HashSet<NodeId>,
}

impl Candidate {
    pub fn new(id: NodeId) -> Self {
        let mut votes = HashSet::new();
        votes.insert(id);
        Self {
            election_ticks: 0,
            election_timeout: rand::thread_rng()
                .gen_range(ELECTION_TIMEOUT_MIN..ELECTION_TIMEOUT_MAX),
            votes,
        }
    }
}

impl RoleNode<Candidate> {
    /// Concedes the election to a leader elected for our term, keeping our
    /// own vote, and processes the message that revealed it as a follower
    fn become_follower(self, leader: &str, msg: Message) -> Result<Node> {
        info!("Discovered leader {} for term {}, following", leader, self.term);
        let voted_for = Some(self.id.clone());
        self.become_role(Follower::new(Some(leader.to_owned()), voted_for))?
            .step(msg)
    }

    /// Transforms the node into a leader after winning an election
    pub(super) fn become_leader(self) -> Result<RoleNode<Leader>> {
        info!("Won election for term {}, becoming leader", self.term);
        let peers = self.peers.clone();
        let last_index = self.log.last_index;
        let mut node = self.become_role(Leader::new(peers, last_index))?;
        node.heartbeat()?;
        Ok(node)
    }

    /// Processes a message
    pub fn step(mut self, msg: Message) -> Result<Node> {
        match msg.event {
            Event::GrantVote { term } => {
                if term < self.term {
                    debug!("Ignoring stale term {} vote from {}", term, msg.from);
                    return Ok(self.into());
                }
                debug!("Received term {} vote from {}", self.term, msg.from);
                self.role.votes.insert(msg.from);
                if self.role.votes.len() as u64 >= self.quorum() {
                    return Ok(self.become_leader()?.into());
                }
            }

            // A newer-term denial steps us down before dispatch; a denial
            // for our own term just means the voter is taken
            Event::DenyVote { term } => {
                debug!("Vote denied by {} at term {}", msg.from, term);
            }

            // The election is over; acknowledge the leader and process the
            // message as a follower would
            Event::AppendEntries { term, ref leader_id, .. } if term == self.term => {
                let leader = leader_id.clone();
                return self.become_follower(&leader, msg);
            }

            // A candidate knows no leader to forward to
            Event::ClientRequest { .. } => {
                debug!("Dropping client request while campaigning");
            }

            event => debug!("Dropping {:?} as candidate", event),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick. If the election times out, start a
    /// new one for the next term.
    pub fn tick(mut self) -> Result<Node> {
        self.role.election_ticks += 1;
        if self.role.election_ticks >= self.role.election_timeout {
            info!("Election timed out, starting new election for term {}", self.term + 1);
            self.term += 1;
            let id = self.id.clone();
            self.log.save_term(self.term, Some(&id))?;
            self.role = Candidate::new(id);
            self.broadcast(Event::RequestVote {
                term: self.term,
                candidate_id: self.id.clone(),
                last_log_index: self.log.last_index,
                last_log_term: self.log.last_term,
            })?;
        }
        Ok(self.into())
    }
}
