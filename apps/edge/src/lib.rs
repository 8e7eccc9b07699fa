//! Culvert edge node
//!
//! The publicly reachable half of the tunnel system. Backends connect
//! outbound WebSockets here and claim a subdomain; public HTTP requests
//! and WebSocket upgrades addressed to that subdomain are multiplexed over
//! the backend's single tunnel connection as correlation-id frames.

pub mod exchange;
pub mod registry;
pub mod routing;
pub mod server;
pub mod tunnel;
