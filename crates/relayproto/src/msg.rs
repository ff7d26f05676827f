use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::frame::Envelope;
use crate::{ConnId, PlayerId, ProtoError};

/// A player transport the broker already authenticated and now hands over,
/// sent in bulk with `connect` after the broker (re)attaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumedConn {
    pub connid: ConnId,
    pub uid: PlayerId,
    pub email: String,
}

/// One entry of a player's portal list as shown to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlistEntry {
    pub portid: u64,
    pub world: String,
    pub scope: String,
    pub location: String,
}

/// Everything the world server sends toward the broker.
///
/// The first four variants travel on the control plane; the rest are addressed
/// to one player connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Outbound {
    Connectok,
    Playerok { connid: ConnId },
    Playernotok { connid: ConnId, text: String },
    Messageall { text: String },
    Event { text: String },
    Message { text: String },
    Error { text: String },
    Updateplist { plist: Vec<PlistEntry> },
    Refresh { facets: Vec<String> },
}

impl Outbound {
    pub fn encode(&self, conn: ConnId) -> Result<Envelope, ProtoError> {
        let body = serde_json::to_vec(self)?;
        Ok(Envelope::new(conn, Bytes::from(body)))
    }
}

/// Parse an inbound body into a JSON object, leaving per-command decoding to the caller.
pub fn parse_body(payload: &[u8]) -> Result<serde_json::Value, ProtoError> {
    let v: serde_json::Value = serde_json::from_slice(payload)?;
    if !v.is_object() {
        return Err(ProtoError::Malformed("payload must be a json object"));
    }
    Ok(v)
}

/// The `cmd` discriminator of an inbound body.
pub fn command_name(v: &serde_json::Value) -> Result<&str, ProtoError> {
    v.get("cmd")
        .and_then(|c| c.as_str())
        .ok_or(ProtoError::Malformed("payload has no cmd"))
}
