use crate::error::{Error, Result};
use crate::raft::log::Log;
use crate::raft::message::{Event, Message, NodeId};
use crate::raft::node::{Node, Status, TICK_INTERVAL};
use crate::raft::state::State;
use crate::raft::Client;
use crate::storage::log::Memory;
use dashmap::DashMap;
use futures::Future;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time;
use tracing::{debug, error, info};

/// The address the cluster bootstrap sends Init from
const HUB_ID: &str = "hub";

/// The mailbox registry of the in-process transport. Each sender delivers
/// to one node's inbox in FIFO order.
type Registry = Arc<DashMap<NodeId, mpsc::UnboundedSender<Message>>>;

/// A single Raft peer: the consensus node plus the event loop driving it.
/// The loop feeds the node inbound messages and clock ticks until shutdown;
/// the node's state is only ever touched from this loop, so it needs no
/// locks.
pub struct Server {
    id: NodeId,
    node: Node,
    node_rx: mpsc::UnboundedReceiver<Message>,
    status_tx: watch::Sender<Status>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Server {
    pub fn new(
        node: Node,
        node_rx: mpsc::UnboundedReceiver<Message>,
        status_tx: watch::Sender<Status>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id: node.id(),
            node,
            node_rx,
            status_tx,
            shutdown_rx,
        }
    }

    /// Runs the peer to completion. An error from the node is fatal and
    /// halts the peer rather than letting it keep replying.
    pub async fn run(mut self) -> Result<()> {
        let mut ticker = time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.node = self.node.tick()?;
                }
                msg = self.node_rx.recv() => match msg {
                    Some(msg) => {
                        self.node = self.node.step(msg)?;
                    }
                    None => return Ok(()),
                },
                // Fires on an explicit stop, and also when the cluster
                // handle (the only sender) is dropped
                _ = self.shutdown_rx.recv() => {
                    debug!("Peer {} shutting down", self.id);
                    return Ok(());
                }
            }
            let _ = self.status_tx.send(self.node.status());
        }
    }
}

/// A statically configured cluster of Raft peers wired through an
/// in-process router. Peers exchange messages through per-node mailboxes;
/// delivery is in-order per sender and best-effort (messages to stopped or
/// unknown nodes are dropped).
pub struct Cluster {
    nodes: Vec<NodeId>,
    registry: Registry,
    hub_tx: mpsc::UnboundedSender<Message>,
    statuses: Vec<watch::Receiver<Status>>,
    shutdowns: HashMap<NodeId, broadcast::Sender<()>>,
    next_client: u64,
}

impl Cluster {
    /// Creates and starts a cluster of the given size, one state machine
    /// per peer, and fixes its membership by sending each peer Init.
    pub fn new(states: Vec<Box<dyn State>>) -> Result<Cluster> {
        let nodes: Vec<NodeId> = (0..states.len())
            .map(|i| format!("raft-{}", i))
            .collect();
        if nodes.is_empty() {
            return Err(Error::Internal("Cannot start an empty cluster".into()));
        }
        info!("Starting cluster with nodes {:?}", nodes);

        let registry: Registry = Arc::new(DashMap::new());
        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        let mut statuses = Vec::new();
        let mut shutdowns = HashMap::new();

        for (id, state) in nodes.iter().zip(states) {
            let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
            registry.insert(id.clone(), inbox_tx);

            let log = Log::new(Box::new(Memory::new()))?;
            let node = Node::new(id, log, state, hub_tx.clone())?;
            let (status_tx, status_rx) = watch::channel(node.status());
            statuses.push(status_rx);

            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let server = Server::new(node, inbox_rx, status_tx, shutdown_rx);
            shutdowns.insert(id.clone(), shutdown_tx);

            let peer = id.clone();
            tokio::spawn(async move {
                if let Err(err) = server.run().await {
                    error!(cause = %err, "peer {} failed", peer);
                }
            });
        }

        let router_registry = registry.clone();
        tokio::spawn(route(router_registry, hub_rx));

        for id in &nodes {
            hub_tx.send(Message {
                from: HUB_ID.into(),
                to: id.clone(),
                event: Event::Init {
                    nodes: nodes.clone(),
                },
            })?;
        }

        Ok(Cluster {
            nodes,
            registry,
            hub_tx,
            statuses,
            shutdowns,
            next_client: 0,
        })
    }

    /// The cluster membership
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Returns the latest status snapshot of every live peer
    pub fn status(&self) -> Vec<Status> {
        self.statuses.iter().map(|rx| rx.borrow().clone()).collect()
    }

    /// Stops a single peer, dropping its mailbox. Used to exercise failover;
    /// the rest of the cluster keeps running.
    pub fn stop(&mut self, id: &str) {
        info!("Stopping peer {}", id);
        self.registry.remove(id);
        if let Some(i) = self.nodes.iter().position(|n| n == id) {
            self.statuses.remove(i);
            self.nodes.remove(i);
        }
        if let Some(shutdown_tx) = self.shutdowns.remove(id) {
            let _ = shutdown_tx.send(());
        }
    }

    /// Creates a client attached to the cluster
    pub fn client(&mut self) -> Client {
        self.next_client += 1;
        let id = format!("client-{}", self.next_client);
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.insert(id.clone(), tx);
        Client::new(id, self.nodes.clone(), self.hub_tx.clone(), rx)
    }

    /// Shuts the whole cluster down
    pub fn shutdown(mut self) {
        let ids: Vec<NodeId> = self.nodes.clone();
        for id in ids {
            self.stop(&id);
        }
    }

    /// Runs the cluster until the shutdown future completes, e.g.
    /// tokio::signal::ctrl_c()
    pub async fn serve(self, shutdown: impl Future) -> Result<()> {
        shutdown.await;
        info!("Shutting down cluster");
        self.shutdown();
        Ok(())
    }
}

/// Routes outbound messages to the recipient's mailbox. A single router
/// task preserves per-sender FIFO ordering.
async fn route(registry: Registry, mut hub_rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = hub_rx.recv().await {
        match registry.get(&msg.to) {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => debug!("Dropping message to unknown node {}", msg.to),
        }
    }
}
