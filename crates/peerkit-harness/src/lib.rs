//! PeerKit Harness
//!
//! An in-memory loopback network implementing the PeerKit transport
//! interface. Nodes joined to the same [`LoopbackNetwork`] discover each
//! other, exchange invitations, open links and move bytes and resources
//! without any radio, which makes multi-peer runtime scenarios testable in
//! a single process.

pub mod network;
pub mod transport;

pub use network::{LoopbackNetwork, NetworkStats, SentRecord};
pub use transport::LoopbackTransport;
