use serde::{Deserialize, Serialize};

use crate::error::{Failure, RpcError};
use crate::key::ReceiverId;
use crate::node::VersionTag;
use crate::rpc::CallId;

/// A frame exchanged between two peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcMessage {
    /// Compute `method` on the receiving peer.
    Call {
        /// Id allocated by the caller.
        call_id: CallId,
        /// Method name.
        method: String,
        /// Receiver the method is invoked on.
        receiver: ReceiverId,
        /// Serialized method value.
        args: Vec<u8>,
        /// Tag of the server node the caller already holds the value of.
        known_tag: Option<VersionTag>,
    },
    /// Result of a call.
    Reply {
        /// Id of the call being answered.
        call_id: CallId,
        /// The result.
        result: ReplyPayload,
    },
    /// The server node behind `call_id` was invalidated. Carries no value.
    Invalidate {
        /// Id of the call whose result went stale.
        call_id: CallId,
    },
    /// The caller is no longer interested in `call_id`.
    Cancel {
        /// Id of the call to cancel.
        call_id: CallId,
    },
}

/// Result carried by [`RpcMessage::Reply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyPayload {
    /// A serialized value.
    Value {
        /// Tag of the server node.
        tag: VersionTag,
        /// Type name of the value.
        type_tag: String,
        /// bincode-encoded value.
        bytes: Vec<u8>,
    },
    /// The server node still has the tag the caller sent as `known_tag`.
    Unchanged {
        /// Tag of the server node.
        tag: VersionTag,
    },
    /// The method failed; the failure is cached on the server like a value.
    Failed {
        /// Tag of the server node.
        tag: VersionTag,
        /// The captured failure.
        failure: Failure,
    },
    /// The server could not run the call.
    Error(RpcError),
}

impl RpcMessage {
    /// Encode into a frame.
    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a frame.
    pub fn decode(frame: &[u8]) -> Result<Self, RpcError> {
        Ok(bincode::deserialize(frame)?)
    }

    /// The call id the message refers to.
    pub fn call_id(&self) -> CallId {
        match self {
            RpcMessage::Call { call_id, .. }
            | RpcMessage::Reply { call_id, .. }
            | RpcMessage::Invalidate { call_id }
            | RpcMessage::Cancel { call_id } => *call_id,
        }
    }
}
