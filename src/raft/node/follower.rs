use crate::error::Result;
use crate::raft::message::{Event, Message, NodeId};
use crate::raft::node::{Candidate, Node, RoleNode, ELECTION_TIMEOUT_MAX, ELECTION_TIMEOUT_MIN};
use rand::Rng;
use tracing::{debug, info};

/// A follower replicates state from a leader
#[derive(Debug)]
pub struct Follower {
    /// The leader of the current term, or None if not yet discovered
    pub(super) leader: Option<NodeId>,
    /// Ticks since the last message from the leader, or since granting a vote
    pub(super) leader_seen_ticks: u64,
    /// The timeout before triggering an election, redrawn on every reset
    pub(super) leader_seen_timeout: u64,
    /// The candidate we voted for in the current term, if any
    pub(super) voted_for: Option<NodeId>,
}

impl Follower {
    pub fn new(leader: Option<NodeId>, voted_for: Option<NodeId>) -> Self {
        Self {
            leader,
            voted_for,
            leader_seen_ticks: 0,
            leader_seen_timeout: rand::thread_rng()
                .gen_range(ELECTION_TIMEOUT_MIN..ELECTION_TIMEOUT_MAX),
        }
    }
}

impl RoleNode<Follower> {
    /// Transforms the node into a candidate for the next term, voting for
    /// itself and soliciting votes from all peers. A node with no peers wins
    /// its election immediately.
    fn become_candidate(mut self) -> Result<Node> {
        info!("Starting election for term {}", self.term + 1);
        self.term += 1;
        let id = self.id.clone();
        self.log.save_term(self.term, Some(&id))?;
        let event = Event::RequestVote {
            term: self.term,
            candidate_id: id.clone(),
            last_log_index: self.log.last_index,
            last_log_term: self.log.last_term,
        };
        let node = self.become_role(Candidate::new(id))?;
        node.broadcast(event)?;
        if node.role.votes.len() as u64 >= node.quorum() {
            return Ok(node.become_leader()?.into());
        }
        Ok(node.into())
    }

    /// Processes a message
    pub fn step(mut self, msg: Message) -> Result<Node> {
        match msg.event {
            Event::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                if term < self.term {
                    self.send(&msg.from, Event::DenyVote { term: self.term })?;
                    return Ok(self.into());
                }
                if let Some(voted_for) = &self.role.voted_for {
                    if voted_for != &candidate_id {
                        self.send(&msg.from, Event::DenyVote { term: self.term })?;
                        return Ok(self.into());
                    }
                }
                // The candidate's log must be at least as up-to-date as ours
                if last_log_term < self.log.last_term
                    || (last_log_term == self.log.last_term
                        && last_log_index < self.log.last_index)
                {
                    self.send(&msg.from, Event::DenyVote { term: self.term })?;
                    return Ok(self.into());
                }
                info!("Voting for {} in term {} election", candidate_id, self.term);
                self.log.save_term(self.term, Some(&candidate_id))?;
                self.role.voted_for = Some(candidate_id);
                self.role.leader_seen_ticks = 0;
                self.send(&msg.from, Event::GrantVote { term: self.term })?;
            }

            Event::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                if term < self.term {
                    self.send(&msg.from, Event::AppendFailure { term: self.term })?;
                    return Ok(self.into());
                }
                if self.role.leader.is_none() {
                    info!("Discovered leader {} for term {}, following", leader_id, self.term);
                    self.role.leader = Some(leader_id);
                }
                self.role.leader_seen_ticks = 0;
                if prev_log_index > 0 && !self.log.has(prev_log_index, prev_log_term)? {
                    debug!("Rejecting entries at base {}", prev_log_index);
                    self.send(&msg.from, Event::AppendFailure { term: self.term })?;
                } else {
                    let last_index = self.log.splice(prev_log_index, entries)?;
                    self.log.commit(std::cmp::min(leader_commit, last_index))?;
                    self.apply_committed()?;
                    self.send(
                        &msg.from,
                        Event::AppendSuccess {
                            term: self.term,
                            index: last_index,
                        },
                    )?;
                }
            }

            Event::ClientRequest { .. } => {
                if let Some(leader) = self.role.leader.clone() {
                    self.forward(&leader, msg)?;
                } else {
                    debug!("Dropping client request with no known leader");
                }
            }

            event => debug!("Dropping {:?} as follower", event),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick
    pub fn tick(mut self) -> Result<Node> {
        self.role.leader_seen_ticks += 1;
        if self.role.leader_seen_ticks >= self.role.leader_seen_timeout {
            self.become_candidate()
        } else {
            Ok(self.into())
        }
    }
}
