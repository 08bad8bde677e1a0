//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Amino crate error enum.
pub enum Error {
    /// The routing table has no reachable candidates for a query.
    #[error("No known peers to start the query from")]
    NoPeers,

    /// A lookup converged without finding the target.
    #[error("Not found")]
    NotFound,

    /// The per-query deadline elapsed before the lookup completed.
    #[error("Query timed out")]
    Timeout,

    /// Failed to serialize an outgoing message.
    #[error("Failed to serialize message: {0}")]
    MessageSerialize(String),

    /// Received a message with an unknown type tag.
    #[error("Unexpected message type: {0}")]
    UnexpectedMessageType(u8),

    /// A key (content id or peer id) was empty or malformed.
    #[error("Invalid key")]
    InvalidKey,

    /// The validator rejected a record.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// A stream failed mid-exchange.
    #[error("Transport error: {0}")]
    Transport(&'static str),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    Io(#[from] std::io::Error),

    /// Failed to parse incoming message bytes.
    #[error("Failed to parse message bytes: {0}")]
    MessageDecode(String),

    /// The node actor was shut down before the operation completed.
    #[error("Node is shutdown")]
    Shutdown,
}

impl From<serde_bencode::Error> for Error {
    fn from(error: serde_bencode::Error) -> Self {
        Error::MessageDecode(error.to_string())
    }
}

impl<T> From<flume::SendError<T>> for Error {
    fn from(_: flume::SendError<T>) -> Self {
        Error::Shutdown
    }
}

impl From<flume::RecvError> for Error {
    fn from(_: flume::RecvError) -> Self {
        Error::Shutdown
    }
}
