use tokio::sync::mpsc;

use crate::error::{Result, TunnelError};
use crate::protocol::Frame;

/// Ordered outbound frame queue of one tunnel connection.
///
/// Every exchange holds a clone; a single writer task drains the receiving
/// half onto the transport, so frames reach the wire in exactly the order
/// they were queued regardless of which task produced them. The queue is
/// unbounded: producers are never paused, so a slow tunnel buffers in
/// memory.
#[derive(Debug, Clone)]
pub struct TunnelSender {
    tx: mpsc::UnboundedSender<Frame>,
}

impl TunnelSender {
    /// Create the sender and the receiving half for the writer task.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a frame for the wire. Fails once the tunnel connection is gone.
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.tx.send(frame).map_err(|_| TunnelError::TunnelClosed)
    }

    /// True once the writer task has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
