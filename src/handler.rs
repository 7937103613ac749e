//! Caller-supplied handler capabilities.
//!
//! The embedding application supplies one of two capability sets: a plain
//! [`ReplyHandler`] that only consumes asynchronous reply payloads, or a full
//! [`OperationHandler`] that additionally answers platform-initiated
//! read/write/exec requests. The engine branches on the [`HandlerRef`]
//! discriminator, never on runtime type inspection.
//!
//! Handlers are invoked from the engine's delivery path, so implementations
//! must not block.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::error::Error;

/// Outcome of a write/update/delete/exec operation, reported back to the
/// platform as `{"status": ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    /// The operation completed.
    Success,
    /// The operation failed.
    Failed,
    /// The operation was accepted and is still in progress.
    Pending,
}

impl CompletionStatus {
    /// The wire name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::Success => "SUCCESS",
            CompletionStatus::Failed => "FAILED",
            CompletionStatus::Pending => "PENDING",
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consumes asynchronous replies from the platform.
///
/// Required for any outbound call expecting a reply.
pub trait ReplyHandler: Send + Sync {
    /// Handles a reply payload from the platform, ACK on success or an error
    /// status with its payload.
    fn ack(&self, payload: Option<&Value>) -> Result<(), Error>;

    /// Handles errors reported by the engine or raised while dispatching.
    fn on_exception(&self, err: &Error);

    /// Polled by [`Engine::run`](crate::engine::Engine::run) to decide whether
    /// the session should be torn down gracefully.
    fn shutdown(&self) -> bool {
        false
    }
}

/// Answers platform-initiated read/write/exec requests on attributes or
/// resources of the app/device.
///
/// Requests arrive as `{"n": "attribute-name", "op": op-code, ...}`; the `op`
/// byte distinguishes write (0x02), update (0x03) and delete (0x04) so one
/// [`write`](OperationHandler::write) implementation can treat them
/// differently. Capabilities that are not implemented fail with
/// [`Error::NotImplemented`] when invoked.
pub trait OperationHandler: ReplyHandler {
    /// Notified once the session with the platform is established. Runs on a
    /// dedicated thread so it may take its time, but the session is usable
    /// before it returns.
    fn connected(&self) {}

    /// Reads the requested attributes, returning `{"n": ..., "v": ...}` (or an
    /// array of such objects).
    fn read(&self, request: Option<&Value>) -> Result<Value, Error> {
        let _ = request;
        Err(Error::NotImplemented)
    }

    /// Writes, updates or deletes the given attributes; `op` carries the
    /// concrete op-code.
    fn write(&self, request: Option<&Value>, op: u8) -> Result<CompletionStatus, Error> {
        let _ = (request, op);
        Err(Error::NotImplemented)
    }

    /// Executes/triggers the named operation, e.g. an actuator or a service.
    fn exec(&self, request: Option<&Value>) -> Result<CompletionStatus, Error> {
        let _ = request;
        Err(Error::NotImplemented)
    }
}

/// Tagged reference to the caller's handler, carrying its capability set as
/// an explicit discriminator.
#[derive(Clone)]
pub enum HandlerRef {
    /// Reply consumption only.
    Ack(Arc<dyn ReplyHandler>),
    /// Full operation capability, including reply consumption.
    Operation(Arc<dyn OperationHandler>),
}

impl HandlerRef {
    /// The reply-consumption view, available for both capability sets.
    pub fn reply(&self) -> &dyn ReplyHandler {
        match self {
            HandlerRef::Ack(h) => h.as_ref(),
            HandlerRef::Operation(h) => h.as_ref(),
        }
    }

    /// The operation capability, when present.
    pub fn operation(&self) -> Option<&Arc<dyn OperationHandler>> {
        match self {
            HandlerRef::Ack(_) => None,
            HandlerRef::Operation(h) => Some(h),
        }
    }
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerRef::Ack(_) => f.write_str("HandlerRef::Ack"),
            HandlerRef::Operation(_) => f.write_str("HandlerRef::Operation"),
        }
    }
}
