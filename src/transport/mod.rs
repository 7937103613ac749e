//! The abstract transport contract and its byte-level seams.
//!
//! A [`Transport`] owns the lifecycle of one logical link to the platform:
//! `connect`, `disconnect`, `send` and inbound delivery through
//! [`recv`](Transport::recv). Three conforming variants are provided —
//! stateless HTTPS ([`http::HttpTransport`]), a persistent WebSocket
//! ([`ws::WsTransport`]) and MQTT publish/subscribe
//! ([`mqtt::MqttTransport`]).
//!
//! Transports never open sockets themselves: the embedding application
//! supplies a [`Connect`] implementation that produces ready-to-use
//! [`Connection`]s (typically TLS streams built from the process-wide
//! [`trust_anchors`]), keeping TLS and socket setup outside the SDK.

use std::sync::OnceLock;

use base64ct::{Base64, Encoding};

use crate::error::Error;
use crate::message::Message;

pub mod http;
pub mod mqtt;
pub mod ws;

// Core synchronous byte traits, implemented by caller-supplied sockets.

/// Reads bytes from a connection.
///
/// Implementations backed by sockets with a read timeout should map the
/// timeout onto [`Error::Timeout`]; transports treat it as "no data yet".
pub trait Read {
    /// Reads into `buf`, returning the number of bytes read (0 = closed).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
}

/// Writes bytes to a connection.
pub trait Write {
    /// Writes from `buf`, returning the number of bytes written.
    fn write(&mut self, buf: &[u8]) -> Result<usize, Error>;
    /// Flushes the write buffer.
    fn flush(&mut self) -> Result<(), Error>;
}

/// Closes a connection.
pub trait Close {
    /// Closes the connection, releasing its resources.
    fn close(self) -> Result<(), Error>;
}

/// A synchronous, bidirectional connection.
pub trait Connection: Read + Write + Close + Send {}

/// A synchronous connector producing fresh connections, e.g. a TLS stream
/// factory. `remote` is a `host:port` pair.
pub trait Connect: Send {
    /// The connection type produced.
    type Connection: Connection;
    /// Opens a connection to `remote`.
    fn connect(&mut self, remote: &str) -> Result<Self::Connection, Error>;
}

/// The abstract transport every wire protocol variant implements.
///
/// Implementations own a [`Backoff`](crate::backoff::Backoff) calculator:
/// reset on successful connect, advanced on every failed attempt, and never
/// permanently giving up (exceeding the configured retry count resets the
/// counter and attempts continue at minimum delay).
pub trait Transport: Send {
    /// Establishes the underlying connection. Safe to call repeatedly.
    ///
    /// `scope_id` optionally narrows the inbound subscription to one logical
    /// resource; `wants_ops` indicates whether the caller registered a
    /// handler, i.e. whether an inbound subscription is needed at all.
    fn connect(&mut self, scope_id: Option<&str>, wants_ops: bool) -> Result<(), Error>;

    /// Releases underlying resources. Best-effort and idempotent.
    fn disconnect(&mut self);

    /// Serializes and transmits one message.
    ///
    /// If not connected, attempts reconnection inline first; fails with
    /// [`Error::NotConnected`] when reconnection is refused.
    fn send(&mut self, msg: &Message) -> Result<(), Error>;

    /// Polls for one inbound message, parsed from wire data.
    ///
    /// Returns `Ok(None)` when no complete message is available. Malformed
    /// frames are converted into a locally synthesized `BAD_REQUEST`-class
    /// message rather than crashing the transport.
    fn recv(&mut self) -> Result<Option<Message>, Error>;

    /// Updates the app/device id used on the next send.
    fn set_app_id(&mut self, app_id: &str);

    /// Updates the credential token used on the next send.
    fn set_token(&mut self, token: &str);

    /// Whether this transport needs no session establishment round trip.
    fn stateless(&self) -> bool {
        false
    }
}

/// Per-transport credential state with its precomputed HTTP auth framing.
///
/// Tokens that look like a three-part signed token (JWT) are framed as
/// `Bearer <token>`; anything else as `Basic base64(":" + token)`. The
/// framing is recomputed whenever the token changes.
#[derive(Debug, Clone)]
pub struct Credentials {
    token: String,
    header: String,
}

impl Credentials {
    /// Creates credentials for `token`.
    pub fn new(token: &str) -> Self {
        let mut credentials = Self {
            token: String::new(),
            header: String::new(),
        };
        credentials.set_token(token);
        credentials
    }

    /// Replaces the token and recomputes the auth header framing.
    pub fn set_token(&mut self, token: &str) {
        self.header = if token.split('.').count() >= 3 {
            format!("Bearer {token}")
        } else {
            format!("Basic {}", Base64::encode_string(format!(":{token}").as_bytes()))
        };
        self.token = token.to_string();
    }

    /// The raw token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The `Authorization` header value.
    pub fn header(&self) -> &str {
        &self.header
    }
}

static TRUST_ANCHORS: OnceLock<Vec<u8>> = OnceLock::new();

/// Installs the process-wide trust-anchor material (PEM) consumed by caller
/// connectors when building TLS sockets.
///
/// First call wins; later calls fail with [`Error::AlreadyInitialized`].
pub fn init_trust_anchors(pem: Vec<u8>) -> Result<(), Error> {
    TRUST_ANCHORS.set(pem).map_err(|_| Error::AlreadyInitialized)
}

/// The installed trust-anchor material, if any.
pub fn trust_anchors() -> Option<&'static [u8]> {
    TRUST_ANCHORS.get().map(Vec::as_slice)
}

/// Appends the protocol default port when `host` does not carry one.
pub(crate) fn remote_addr(host: &str, default_port: u16) -> String {
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{default_port}")
    }
}

/// Reads exactly `buf.len()` bytes, failing on close or timeout mid-frame.
pub(crate) fn read_full<C: Read>(conn: &mut C, buf: &mut [u8]) -> Result<(), Error> {
    let mut total = 0;
    while total < buf.len() {
        match conn.read(&mut buf[total..]) {
            Ok(0) => return Err(Error::ConnectionClosed),
            Ok(n) => total += n,
            Err(Error::Timeout) => return Err(Error::Timeout),
            Err(_) => return Err(Error::Read),
        }
    }
    Ok(())
}

/// The locally synthesized reply for wire data this side could not parse.
pub(crate) fn bad_request(detail: &str) -> Message {
    let mut msg = Message::of(crate::message::Kind::Session);
    // set_code cannot fail for a constant in the client-error range
    let _ = msg.set_code(crate::message::code::BAD_REQUEST);
    msg.set_payload(serde_json::json!({ crate::message::KEY_ERR: detail }));
    msg
}
