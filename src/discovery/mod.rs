//! Peer discovery and connection policy

mod orchestrator;
mod store;

pub use orchestrator::*;
pub use store::*;
