//! RPC frames exchanged over a connection.
//!
//! A connection carries frames in both directions: either peer may send a
//! [`Frame::Request`] and must eventually receive a [`Frame::Reply`] with the
//! same `id`. Frames are MsgPack-encoded with `rmp_serde::to_vec_named()` and
//! length-delimited by the transport.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Transport-level error codes carried in [`ReplyBody::Error`].
///
/// Application protocols (see [`crate::config::error_code`]) use codes
/// above 100 000 so the two ranges never collide.
pub mod error_code {
    pub const NONE: u32 = 0;
    pub const GENERAL_ERROR: u32 = 100;
    pub const NO_SUCH_METHOD: u32 = 101;
    pub const WRONG_PARAMS: u32 = 102;
    pub const OVERLOAD: u32 = 103;
    pub const WRONG_RETURN: u32 = 104;
    pub const BAD_REPLY: u32 = 105;
    pub const METHOD_FAILED: u32 = 106;
    pub const ABORT: u32 = 200;
    pub const CONNECTION: u32 = 201;
    pub const TIMEOUT: u32 = 202;
}

/// Errors raised while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// A method invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

/// Outcome of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplyBody {
    Values(Vec<Value>),
    Error { code: u32, message: String },
}

/// Reply to the request with the same `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReply {
    pub id: u64,
    pub body: ReplyBody,
}

impl RpcReply {
    #[must_use]
    pub fn values(id: u64, values: Vec<Value>) -> Self {
        Self {
            id,
            body: ReplyBody::Values(values),
        }
    }

    #[must_use]
    pub fn error(id: u64, code: u32, message: impl Into<String>) -> Self {
        Self {
            id,
            body: ReplyBody::Error {
                code,
                message: message.into(),
            },
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.body, ReplyBody::Error { .. })
    }
}

/// A single frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Frame {
    Request(RpcRequest),
    Reply(RpcReply),
}

impl Frame {
    /// Serializes the frame to MsgPack with named fields.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }

    /// Deserializes a frame from MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Decode`] for malformed input.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
