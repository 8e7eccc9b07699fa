//! Shared protocol and plumbing for the culvert tunnel system
//!
//! This crate defines the wire frames exchanged over a tunnel connection,
//! the table of in-flight exchanges keyed by correlation id, the ordered
//! outbound frame queue, and the proxied-WebSocket state machine used by
//! both the edge and the agent.

pub mod constants;
pub mod error;
pub mod exchange;
pub mod protocol;
pub mod socket;
pub mod tunnel;
pub mod utils;

// Re-export commonly used types for convenience
pub use error::{Result, TunnelError};
pub use exchange::{ExchangeHandle, ExchangeKind, ExchangeMsg, ExchangeTable, Registration};
pub use protocol::{BodyState, Frame, Headers, RequestFrame, ResponseFrame, SocketFrame, TargetUrl};
pub use socket::{RealSocket, run_socket_exchange};
pub use tunnel::TunnelSender;
pub use utils::{
    decode_chunk, encode_chunk, generate_backend_id, generate_exchange_id, headers_to_wire,
    wire_to_headers,
};
