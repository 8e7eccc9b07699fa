/// Time allowed between sending an open frame and the first response frame (30s).
/// Only time-to-first-byte is bounded; streaming after the head is unbounded.
pub const OPEN_TIMEOUT_SECS: u64 = 30;

/// Minimum delay for exponential backoff reconnection (1 second)
pub const RECONNECT_MIN_DELAY_MS: u64 = 1000;

/// Maximum delay for exponential backoff reconnection (60 seconds)
pub const RECONNECT_MAX_DELAY_MS: u64 = 60000;

/// Multiplier for exponential backoff reconnection
pub const RECONNECT_MULTIPLIER: f64 = 2.0;

/// Capacity of the per-exchange downstream body channel
pub const BODY_CHANNEL_CAPACITY: usize = 32;

/// Path on the edge that accepts backend tunnel connections
pub const DEFAULT_TUNNEL_PATH: &str = "/_tunnel";
