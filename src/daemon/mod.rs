//! Node process lifecycle: startup, signal handling and shutdown

pub mod lifecycle;

pub use lifecycle::{run_relay, ChatDaemon};
