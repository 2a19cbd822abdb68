//! Local web gateway: client sessions, topic bridge and HTTP surface

mod bridge;
mod registry;
mod routes;
mod server;

pub use bridge::*;
pub use registry::*;
pub use server::{FanoutGateway, GatewayState};
