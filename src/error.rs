//! Common error type for the SDK.

/// Errors reported by the protocol engine and its transports.
///
/// Variants fall into a few classes with different handling policies:
/// validation errors ([`Error::EmptyArgument`], [`Error::NullPayload`]) fail
/// before any I/O; protocol errors ([`Error::InvalidCode`], [`Error::Protocol`],
/// [`Error::Json`]) are resolved locally by synthesizing a `BAD_REQUEST` reply;
/// transport errors drive the reconnect backoff; [`Error::SessionRejected`] is
/// fatal to a connection attempt and is surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required string argument was empty.
    #[error("{0} cannot be null/empty")]
    EmptyArgument(&'static str),
    /// A message that requires a payload was sent without one.
    #[error("empty payload")]
    NullPayload,
    /// A status/op byte outside the partitioned code space.
    #[error("invalid message code {0:#04x}")]
    InvalidCode(u8),
    /// The peer violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// An operation was attempted while not connected and reconnection was refused.
    #[error("connecting to server is refused")]
    NotConnected,
    /// The remote end refused the connection.
    #[error("connection refused")]
    ConnectionRefused,
    /// The connection was closed by the remote end.
    #[error("connection closed")]
    ConnectionClosed,
    /// A read operation on the underlying connection failed.
    #[error("read error")]
    Read,
    /// A write operation on the underlying connection failed.
    #[error("write error")]
    Write,
    /// The underlying connection timed out waiting for data.
    #[error("timeout")]
    Timeout,
    /// A non-success status arrived while the session was still being established.
    #[error("establishing server connection failed")]
    SessionRejected,
    /// The caller-supplied handler does not implement the invoked capability.
    #[error("not implemented")]
    NotImplemented,
    /// A caller-supplied handler capability failed.
    #[error("handler failed: {0}")]
    Handler(String),
    /// Process-wide trust anchors were already initialized.
    #[error("trust anchors already initialized")]
    AlreadyInitialized,
    /// Payload or wire envelope was not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fails with [`Error::EmptyArgument`] when `value` is empty.
pub(crate) fn check_empty(value: &str, name: &'static str) -> Result<(), Error> {
    if value.is_empty() {
        return Err(Error::EmptyArgument(name));
    }
    Ok(())
}
