//! Transport contract.
//!
//! A peer talks over a [`Connection`]: an ordered, bidirectional channel of
//! opaque byte frames. Framing, sockets and reconnect policy belong to the
//! hosting code, which pumps frames between a `Connection` and the wire and
//! attaches a fresh `Connection` after a reconnect. Closing the sending half
//! of the remote side ends the session.

use tokio::sync::mpsc;

/// One session's worth of frame channels.
#[derive(Debug)]
pub struct Connection {
    /// Frames to the remote peer.
    pub sender: mpsc::UnboundedSender<Vec<u8>>,
    /// Frames from the remote peer.
    pub receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Connection {
    /// Create a connection from its two halves.
    pub fn new(
        sender: mpsc::UnboundedSender<Vec<u8>>,
        receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self { sender, receiver }
    }
}

/// In-process connections.
pub mod memory {
    use super::*;

    /// Two connected ends: frames sent on one arrive at the other.
    pub fn pair() -> (Connection, Connection) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Connection::new(a_tx, a_rx), Connection::new(b_tx, b_rx))
    }
}
