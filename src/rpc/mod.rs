//! Replication of computed nodes across a process boundary.
//!
//! A client peer calls a method on a server peer. The server computes it through
//! its own runtime and replies with the value and the version tag of its node.
//! The client caches the reply as a local node bound to the call id. When the
//! server node is invalidated the server sends a payload-free
//! [`RpcMessage::Invalidate`] for that call id, and the client node flips; the
//! next read fetches the value again.

mod client;
mod message;
mod peer;
mod server;
pub mod transport;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use message::{ReplyPayload, RpcMessage};
pub use peer::{ConnectionState, PeerStats, RpcPeer, RpcPeerBuilder, RpcPeerOptions};
pub use server::ServiceRegistry;
pub use transport::Connection;

/// Identifier of one call on a peer.
///
/// Ids are allocated from a per-peer counter and never reused, including
/// across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
