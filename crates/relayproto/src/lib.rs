//! `relayproto`: the control channel between the connection broker and the world server.
//!
//! Every message travels in a length-prefixed frame:
//! - outer framing: `u32` big-endian byte length + body
//! - body: `u64` big-endian connection id, then a UTF-8 JSON object
//!
//! Connection id `0` is the control plane (broker handshakes, admission results,
//! broadcasts). Any other id routes to one player transport held by the broker.

pub mod frame;
pub mod ids;
pub mod msg;

pub use ids::{ConnId, PlayerId};

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("bad json payload: {0}")]
    Json(#[from] serde_json::Error),
}
