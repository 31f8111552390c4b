use crate::error::{Error, Result};
use crate::raft::message::{Event, Message, NodeId};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tracing::debug;

/// How long a client waits for a response before retrying
const RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// The retry backoff cap
const RETRY_MAX: Duration = Duration::from_secs(4);

/// A client for a local Raft cluster. Commands are submitted to a peer and
/// forwarded to the leader; the committing leader replies. A request that
/// goes unanswered (unknown leader, election in progress, dropped peer) is
/// retried against the next peer with backoff. Retries may apply a command
/// twice; callers that need exactly-once must deduplicate themselves.
pub struct Client {
    id: NodeId,
    nodes: Vec<NodeId>,
    hub_tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    next_cid: u64,
    next_node: usize,
}

impl Client {
    pub(crate) fn new(
        id: NodeId,
        nodes: Vec<NodeId>,
        hub_tx: mpsc::UnboundedSender<Message>,
        rx: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        Self {
            id,
            nodes,
            hub_tx,
            rx,
            next_cid: 0,
            next_node: 0,
        }
    }

    /// Executes a command against the replicated state machine, returning
    /// the state machine's result
    pub async fn execute(&mut self, command: Vec<u8>) -> Result<Vec<u8>> {
        self.next_cid += 1;
        let cid = self.next_cid;
        let mut backoff = RETRY_INTERVAL;
        loop {
            let to = self.nodes[self.next_node % self.nodes.len()].clone();
            self.hub_tx.send(Message {
                from: self.id.clone(),
                to,
                event: Event::ClientRequest {
                    cid,
                    command: command.clone(),
                },
            })?;
            match time::timeout(backoff, self.response(cid)).await {
                Ok(result) => return result,
                Err(_) => {
                    debug!("Request {} unanswered, retrying against next node", cid);
                    self.next_node += 1;
                    backoff = std::cmp::min(backoff * 2, RETRY_MAX);
                }
            }
        }
    }

    /// Waits for the response matching the request id, discarding stale
    /// responses from abandoned retries
    async fn response(&mut self, cid: u64) -> Result<Vec<u8>> {
        while let Some(msg) = self.rx.recv().await {
            if let Event::ClientResponse { cid: got, result } = msg.event {
                if got == cid {
                    return result;
                }
                debug!("Discarding stale response for request {}", got);
            }
        }
        Err(Error::Internal("Response channel closed".into()))
    }
}
