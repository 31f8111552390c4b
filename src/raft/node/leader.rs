use crate::error::{Error, Result};
use crate::raft::log::{Caller, Entry};
use crate::raft::message::{Event, Message, NodeId};
use crate::raft::node::{Node, RoleNode, HEARTBEAT_INTERVAL_MAX, HEARTBEAT_INTERVAL_MIN};
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

/// A leader serves client requests and replicates the log to followers
#[derive(Debug)]
pub struct Leader {
    /// Ticks since the last heartbeat broadcast
    pub(super) heartbeat_ticks: u64,
    /// The heartbeat interval, in ticks, redrawn after every broadcast
    pub(super) heartbeat_timeout: u64,
    /// The next log index to replicate to each peer
    pub(super) next_index: HashMap<NodeId, u64>,
    /// The highest log index known to be replicated on each peer
    pub(super) match_index: HashMap<NodeId, u64>,
}

impl Leader {
    /// Creates a new leader role
    pub fn new(peers: Vec<NodeId>, last_index: u64) -> Self {
        let mut leader = Self {
            heartbeat_ticks: 0,
            heartbeat_timeout: rand::thread_rng()
                .gen_range(HEARTBEAT_INTERVAL_MIN..HEARTBEAT_INTERVAL_MAX),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        };
        for peer in peers {
            leader.next_index.insert(peer.clone(), last_index + 1);
            leader.match_index.insert(peer, 0);
        }
        leader
    }
}

impl RoleNode<Leader> {
    /// Broadcasts an AppendEntries to every peer and resets the heartbeat
    /// timer. Used both periodically and as the inaugural broadcast on
    /// election.
    pub(super) fn heartbeat(&mut self) -> Result<()> {
        for peer in self.peers.clone() {
            self.replicate(&peer)?;
        }
        self.role.heartbeat_ticks = 0;
        self.role.heartbeat_timeout = rand::thread_rng()
            .gen_range(HEARTBEAT_INTERVAL_MIN..HEARTBEAT_INTERVAL_MAX);
        Ok(())
    }

    /// Sends the log tail from the peer's next index, anchored at the
    /// preceding entry. With no tail this is a plain heartbeat.
    fn replicate(&self, peer: &str) -> Result<()> {
        let next = self
            .role
            .next_index
            .get(peer)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("Unknown peer {}", peer)))?;
        let prev_log_index = next - 1;
        let prev_log_term = match prev_log_index {
            0 => 0,
            i => self
                .log
                .get(i)?
                .map(|e| e.term)
                .ok_or_else(|| Error::Internal(format!("Missing entry {}", i)))?,
        };
        let entries = self.log.tail(next).collect::<Result<Vec<_>>>()?;
        debug!(
            "Replicating {} entries at base {} to {}",
            entries.len(),
            prev_log_index,
            peer
        );
        self.send(
            peer,
            Event::AppendEntries {
                term: self.term,
                leader_id: self.id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.log.commit_index,
            },
        )?;
        Ok(())
    }

    /// Appends a client command to the log and eagerly replicates it
    fn propose(&mut self, caller: Caller, command: Vec<u8>) -> Result<()> {
        self.log.append(Entry {
            term: self.term,
            command,
            caller: Some(caller),
        })?;
        for peer in self.peers.clone() {
            self.replicate(&peer)?;
        }
        self.maybe_commit()
    }

    /// Advances the commit index to the highest index replicated on a
    /// majority, applies newly committed entries, and responds to their
    /// callers. Entries from prior terms are never committed by counting
    /// replicas; they commit implicitly under the first current-term entry.
    fn maybe_commit(&mut self) -> Result<()> {
        let mut match_indexes = vec![self.log.last_index];
        match_indexes.extend(self.role.match_index.values());
        match_indexes.sort_unstable();
        match_indexes.reverse();
        let quorum_index = match_indexes[self.quorum() as usize - 1];

        if quorum_index > self.log.commit_index {
            if let Some(entry) = self.log.get(quorum_index)? {
                if entry.term == self.term {
                    self.log.commit(quorum_index)?;
                    for (caller, result) in self.apply_committed()? {
                        self.send(
                            &caller.origin,
                            Event::ClientResponse {
                                cid: caller.cid,
                                result,
                            },
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Processes a message
    pub fn step(mut self, msg: Message) -> Result<Node> {
        match msg.event {
            Event::AppendSuccess { index, .. } => {
                self.role.match_index.insert(msg.from.clone(), index);
                self.role.next_index.insert(msg.from, index + 1);
                self.maybe_commit()?;
            }

            // The follower's log diverges before next_index; back off by one
            // and let the next heartbeat retry
            Event::AppendFailure { .. } => {
                if let Some(next) = self.role.next_index.get_mut(&msg.from) {
                    if *next > 1 {
                        *next -= 1;
                    }
                }
            }

            Event::ClientRequest { cid, command } => {
                let caller = Caller {
                    origin: msg.from,
                    cid,
                };
                self.propose(caller, command)?;
            }

            // Stray votes from an election we already won
            Event::GrantVote { .. } | Event::DenyVote { .. } => {}

            event => debug!("Dropping {:?} as leader", event),
        }
        Ok(self.into())
    }

    /// Processes a logical clock tick
    pub fn tick(mut self) -> Result<Node> {
        if !self.peers.is_empty() {
            self.role.heartbeat_ticks += 1;
            if self.role.heartbeat_ticks >= self.role.heartbeat_timeout {
                self.heartbeat()?;
            }
        }
        Ok(self.into())
    }
}
