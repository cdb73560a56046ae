//! Peer side of the network: heartbeats and the node façade.

pub mod liveness;
pub mod node;

pub use liveness::{HeartbeatEmitter, HeartbeatHandle};
pub use node::PeerNode;
