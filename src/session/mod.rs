//! Session layer: frame envelopes and the per-endpoint session peer.
//!
//! Several logical unicast sessions share one fanout topic; every frame
//! carries the session UUIDs it is addressed to and receivers discard
//! anything not tagged for their current session.

pub mod peer;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use peer::{PeerRole, PeerState, PeerStateChange, SessionPeer};

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unknown message descriptor `{0}`")]
    UnknownDescriptor(String),
    #[error("malformed `{descriptor}` payload: {detail}")]
    MalformedPayload { descriptor: String, detail: String },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("operation not permitted for a {role:?}-role peer")]
    RoleViolation { role: PeerRole },
    #[error("peer has no active session")]
    NoSession,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FrameKind {
    ConnectRequest,
    ConnectResponse,
    Disconnect,
    Data,
    Broadcast,
}

/// The session-layer envelope carried on the fanout topic.
///
/// `match_session_uuids` is the session-affinity filter: a receiving peer
/// ignores any frame whose list does not contain its own session UUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub from_device_name: String,
    pub match_session_uuids: Vec<Uuid>,
    pub content: Value,
}

impl Frame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|err| ProtocolError::MalformedFrame(err.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|err| ProtocolError::MalformedFrame(err.to_string()))
    }

    pub fn addressed_to(&self, session: Uuid) -> bool {
        self.match_session_uuids.contains(&session)
    }

    fn content_as<T: serde::de::DeserializeOwned>(&self, what: &str) -> Result<T, ProtocolError> {
        serde_json::from_value(self.content.clone()).map_err(|err| {
            ProtocolError::MalformedPayload {
                descriptor: what.to_string(),
                detail: err.to_string(),
            }
        })
    }

    pub fn connect_request(&self) -> Result<ConnectRequestContent, ProtocolError> {
        self.content_as("connectRequest")
    }

    pub fn connect_response(&self) -> Result<ConnectResponseContent, ProtocolError> {
        self.content_as("connectResponse")
    }

    pub fn disconnect(&self) -> Result<DisconnectContent, ProtocolError> {
        self.content_as("disconnect")
    }

    pub fn data(&self) -> Result<DataContent, ProtocolError> {
        self.content_as("data")
    }
}

/// Identity carried by a connect request; `session_uuid` tags every frame of
/// the connection attempt it opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequestContent {
    pub session_uuid: Uuid,
    pub player_uuid: Option<Uuid>,
    pub player_name: String,
    #[serde(default)]
    pub context: Value,
    pub reconnect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponseContent {
    pub accepted: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectContent {
    pub reason: String,
}

/// An application message riding a `Data` or `Broadcast` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataContent {
    pub descriptor: String,
    pub payload: Value,
}
