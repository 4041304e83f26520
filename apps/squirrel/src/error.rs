use std::time::Duration;

use thiserror::Error;

/// Failure to turn bytes from the wire into an [`crate::protocol::Envelope`]
/// or back.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(serde_json::Error),
    #[error("invalid {event} payload: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("frame is not valid utf-8")]
    NotUtf8,
    #[error("failed to encode envelope: {0}")]
    Encode(serde_json::Error),
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub is no longer running")]
    Closed,
}

/// Reason a read or write pump stopped.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("unsolicited data before handshake")]
    UnsolicitedData,
    #[error("peer not found: {0}")]
    PeerNotFound(String),
    #[error("broadcaster identity carried an empty id")]
    MissingBroadcasterId,
    #[error("id already owned by another connection: {0}")]
    IdConflict(String),
    #[error("connection is no longer registered with the hub")]
    Detached,
    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("keepalive failed: {0}")]
    Keepalive(String),
    #[error(transparent)]
    Hub(#[from] HubError),
}

impl ConnectionError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ConnectionError::Transport(_) => "transport",
            ConnectionError::Protocol(_) => "protocol",
            ConnectionError::UnsolicitedData => "unsolicited_data",
            ConnectionError::PeerNotFound(_) => "peer_not_found",
            ConnectionError::MissingBroadcasterId => "missing_broadcaster_id",
            ConnectionError::IdConflict(_) => "id_conflict",
            ConnectionError::Detached => "detached",
            ConnectionError::ReadTimeout(_) => "read_timeout",
            ConnectionError::WriteTimeout(_) => "write_timeout",
            ConnectionError::Keepalive(_) => "keepalive",
            ConnectionError::Hub(_) => "hub_closed",
        }
    }
}
