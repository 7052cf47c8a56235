use tokio::sync::oneshot;

/// Protocol and dispatch errors.
///
/// Decoding failures are fatal for the connection they occur on: the client
/// forwards them to every attached socket and closes the transport.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid packet type")]
    InvalidPacketType,

    #[error("invalid event name")]
    InvalidEventName,

    #[error("invalid ack id")]
    InvalidAckId,

    #[error("error serializing json packet: {0:?}")]
    Serialize(#[from] serde_json::Error),
}

/// Error raised when sending a packet to a single peer.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("error serializing json packet: {0:?}")]
    Serialize(#[from] serde_json::Error),

    #[error("socket is already disconnected")]
    SocketClosed,
}

/// Error raised while waiting for an acknowledgement.
#[derive(Debug, thiserror::Error)]
pub enum AckError {
    #[error("error deserializing ack response: {0:?}")]
    Serialize(#[from] serde_json::Error),

    #[error("socket closed before the acknowledgement arrived")]
    SocketClosed,

    #[error("acknowledgements are not supported when broadcasting")]
    BroadcastAck,

    #[error("reserved event names never reach the wire")]
    ReservedEvent,
}

impl From<oneshot::error::RecvError> for AckError {
    fn from(_: oneshot::error::RecvError) -> Self {
        AckError::SocketClosed
    }
}

impl From<SendError> for AckError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Serialize(e) => AckError::Serialize(e),
            SendError::SocketClosed => AckError::SocketClosed,
        }
    }
}

/// Error raised by an adapter broadcast.
///
/// Fan-out to individual sockets is best-effort and never fails; only packet
/// encoding and (for distributed adapters) the peer-node transport can.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("error serializing json packet: {0:?}")]
    Serialize(#[from] serde_json::Error),

    #[error("adapter error: {0}")]
    Adapter(Box<dyn std::error::Error + Send + Sync>),
}
