mod client;
mod log;
mod message;
mod node;
mod server;
mod state;

pub use self::log::{Caller, Entry, Log};
pub use client::Client;
pub use message::{Event, Message, NodeId};
pub use node::{Node, Status, TICK_INTERVAL};
pub use server::{Cluster, Server};
pub use state::State;
