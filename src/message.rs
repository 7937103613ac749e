//! The protocol message envelope and its status/op code taxonomy.
//!
//! One [`Message`] carries either a request op-code (when originated by the
//! platform) or a response status (when originated as a reply), a correlation
//! id, a transport-agnostic resource path and an opaque JSON payload. The
//! same envelope is used over HTTPS, WebSocket and MQTT.

use serde_json::Value;

use crate::error::Error;

/// Status/op byte constants and classification predicates.
///
/// The code space is shared by requests and responses and partitioned by
/// value range, with a 3-bit class and a 5-bit detail:
///
/// ```text
///  0 1 2 3 4 5 6 7
/// +-+-+-+-+-+-+-+-+
/// |major|  minor  |
/// +-+-+-+-+-+-+-+-+
/// ```
///
/// e.g. `0x41` -> `010 00001` -> 2.01 => [`CREATED`](code::CREATED),
/// `0x9D` -> `100 11101` -> 4.29 => [`TOO_MANY_REQUESTS`](code::TOO_MANY_REQUESTS).
///
/// Classification works purely off the numeric ranges so that
/// unknown-but-in-range values still classify correctly:
///
/// | Range | Meaning |
/// |---|---|
/// | `0x00..=0x1F` | request op-codes |
/// | `0x20..=0x3F` | provisional |
/// | `0x40..=0x5F` | success |
/// | `0x60..=0x7F` | redirect / no change |
/// | `0x80..=0x9F` | client error |
/// | `0xA0..=0xBF` | server error |
/// | `0xFF` | undefined |
pub mod code {
    /// No operation.
    pub const NOP: u8 = 0x00;
    /// Read a resource/attribute (0.01).
    pub const READ: u8 = 0x01;
    /// Write a resource/attribute (0.02).
    pub const WRITE: u8 = 0x02;
    /// Update a resource/attribute (0.03).
    pub const UPDATE: u8 = 0x03;
    /// Delete a resource/attribute (0.04).
    pub const DELETE: u8 = 0x04;
    /// Execute/trigger an operation (0.05).
    pub const EXEC: u8 = 0x05;
    /// Request for metadata (0.06).
    pub const INFO: u8 = 0x06;
    /// Establish a session (0.08).
    pub const SES: u8 = 0x08;

    /// Continue (1.00).
    pub const CONTINUE: u8 = 0x20;
    /// Async operation in progress (1.02).
    pub const PROCESSING: u8 = 0x22;

    /// Success (2.00).
    pub const ACK: u8 = 0x40;
    /// Created (2.01).
    pub const CREATED: u8 = 0x41;
    /// Request accepted for processing (2.02).
    pub const ACCEPTED: u8 = 0x42;
    /// Mutation succeeded, no body (2.04).
    pub const NO_CONTENT: u8 = 0x44;

    /// Found (3.02).
    pub const FOUND: u8 = 0x62;
    /// Update/delete made no change (3.04).
    pub const NOT_CHANGED: u8 = 0x64;

    /// Bad request (4.00).
    pub const BAD_REQUEST: u8 = 0x80;
    /// Unauthorized (4.01).
    pub const UNAUTHORIZED: u8 = 0x81;
    /// Forbidden (4.03).
    pub const FORBIDDEN: u8 = 0x83;
    /// Not found (4.04).
    pub const NOT_FOUND: u8 = 0x84;
    /// Not acceptable (4.06).
    pub const NOT_ACCEPTABLE: u8 = 0x86;
    /// Request timeout (4.08).
    pub const REQUEST_TIMEOUT: u8 = 0x88;
    /// Conflict (4.09).
    pub const CONFLICT: u8 = 0x89;
    /// Gone (4.10).
    pub const GONE: u8 = 0x8A;
    /// Content length required/invalid (4.11).
    pub const INVALID_CONTENT_SIZE: u8 = 0x8B;
    /// Precondition failed (4.12).
    pub const PRECONDITION_FAILED: u8 = 0x8C;
    /// Payload too large (4.13).
    pub const PAYLOAD_TOO_LARGE: u8 = 0x8D;
    /// Unsupported media type (4.15).
    pub const UNSUPPORTED_MEDIA_TYPE: u8 = 0x8F;
    /// Too many requests (4.29).
    pub const TOO_MANY_REQUESTS: u8 = 0x9D;

    /// Internal server error (5.00).
    pub const INTERNAL_ERROR: u8 = 0xA0;
    /// Bad gateway (5.02).
    pub const BAD_GATEWAY: u8 = 0xA2;
    /// Service unavailable (5.03).
    pub const SERVICE_UNAVAILABLE: u8 = 0xA3;
    /// Gateway timeout (5.04).
    pub const GATEWAY_TIMEOUT: u8 = 0xA4;
    /// Unsupported protocol version (5.05).
    pub const INVALID_VERSION: u8 = 0xA5;
    /// Unknown server-side failure (5.20).
    pub const UNKNOWN: u8 = 0xB4;

    /// Undefined.
    pub const UNDEFINED: u8 = 0xFF;

    /// Whether `code` is a request op-code (`0x00..=0x1F`).
    pub fn is_request_op(code: u8) -> bool {
        code <= 0x1F
    }

    /// Whether `code` is a provisional status (`0x20..=0x3F`).
    pub fn is_provisional(code: u8) -> bool {
        (0x20..=0x3F).contains(&code)
    }

    /// Whether `code` is a success status (`0x40..=0x5F`).
    pub fn is_success(code: u8) -> bool {
        (0x40..=0x5F).contains(&code)
    }

    /// Whether `code` is a redirect/no-change status (`0x60..=0x7F`).
    pub fn is_redirect(code: u8) -> bool {
        (0x60..=0x7F).contains(&code)
    }

    /// Whether `code` is a client error status (`0x80..=0x9F`).
    pub fn is_client_error(code: u8) -> bool {
        (0x80..=0x9F).contains(&code)
    }

    /// Whether `code` is a server error status (`0xA0..=0xBF`).
    pub fn is_server_error(code: u8) -> bool {
        (0xA0..=0xBF).contains(&code)
    }

    /// Whether `code` is a client or server error status.
    pub fn is_error(code: u8) -> bool {
        is_client_error(code) || is_server_error(code)
    }

    /// Whether `code` falls inside one of the partitioned ranges.
    pub fn is_valid(code: u8) -> bool {
        code <= 0xBF || code == UNDEFINED
    }

    /// Maps an inbound wire byte onto the code space.
    ///
    /// Bytes that no range can classify become [`UNKNOWN`] rather than being
    /// guessed at.
    pub fn classify(code: u8) -> u8 {
        if is_valid(code) { code } else { UNKNOWN }
    }

    /// A short name for a known code, for logs.
    pub fn name(code: u8) -> &'static str {
        match code {
            NOP => "NOP",
            READ => "READ",
            WRITE => "WRITE",
            UPDATE => "UPDATE",
            DELETE => "DELETE",
            EXEC => "EXEC",
            INFO => "INFO",
            SES => "SES",
            CONTINUE => "CONTINUE",
            PROCESSING => "PROCESSING",
            ACK => "ACK",
            CREATED => "CREATED",
            ACCEPTED => "ACCEPTED",
            NO_CONTENT => "NO_CONTENT",
            FOUND => "FOUND",
            NOT_CHANGED => "NOT_CHANGED",
            BAD_REQUEST => "BAD_REQUEST",
            UNAUTHORIZED => "UNAUTHORIZED",
            FORBIDDEN => "FORBIDDEN",
            NOT_FOUND => "NOT_FOUND",
            NOT_ACCEPTABLE => "NOT_ACCEPTABLE",
            REQUEST_TIMEOUT => "REQUEST_TIMEOUT",
            CONFLICT => "CONFLICT",
            GONE => "GONE",
            INVALID_CONTENT_SIZE => "INVALID_CONTENT_SIZE",
            PRECONDITION_FAILED => "PRECONDITION_FAILED",
            PAYLOAD_TOO_LARGE => "PAYLOAD_TOO_LARGE",
            UNSUPPORTED_MEDIA_TYPE => "UNSUPPORTED_MEDIA_TYPE",
            TOO_MANY_REQUESTS => "TOO_MANY_REQUESTS",
            INTERNAL_ERROR => "INTERNAL_ERROR",
            BAD_GATEWAY => "BAD_GATEWAY",
            SERVICE_UNAVAILABLE => "SERVICE_UNAVAILABLE",
            GATEWAY_TIMEOUT => "GATEWAY_TIMEOUT",
            INVALID_VERSION => "INVALID_VERSION",
            UNKNOWN => "UNKNOWN",
            UNDEFINED => "UNDEFINED",
            _ => "?",
        }
    }
}

/// JSON key carrying the status/op code in wire envelopes and replies.
pub const KEY_CODE: &str = "op";
/// JSON key carrying the correlation id in wire envelopes and replies.
pub const KEY_MID: &str = "mid";
/// JSON key carrying the resource path in wire envelopes.
pub const KEY_URI: &str = "uri";
/// JSON key carrying the payload in wire envelopes.
pub const KEY_MSG: &str = "msg";
/// JSON key carrying an error description in wire envelopes.
pub const KEY_ERR: &str = "err";

const EVENT_SUFFIX: &str = "event";
const UPLOAD_SUFFIX: &str = "upload";

/// The logical channel a message belongs to.
///
/// [`Kind::Event`] and [`Kind::Upload`] exist only as construction sugar:
/// [`Message::new`] rewrites them into [`Kind::Trigger`] with an `/event` or
/// `/upload` path suffix, so no other code ever observes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Application trigger (ICApp invocation).
    Trigger,
    /// Event/analytics report; normalized to [`Kind::Trigger`] at construction.
    Event,
    /// Binary upload; normalized to [`Kind::Trigger`] at construction.
    Upload,
    /// Attribute (shadow/config) exchange.
    Attribute,
    /// Generic platform API call routed through the API gateway.
    Api,
    /// Session control, used for transport-synthesized session messages.
    Session,
    /// Acknowledgement of a platform-initiated request.
    Ack,
}

impl Kind {
    /// The lowercase name used when deriving wire paths.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Kind::Trigger => "icapp",
            Kind::Event => EVENT_SUFFIX,
            Kind::Upload => UPLOAD_SUFFIX,
            Kind::Attribute => "att",
            Kind::Api => "agw",
            Kind::Session => "session",
            Kind::Ack => "ack",
        }
    }
}

/// The protocol envelope.
///
/// Immutable after construction apart from the engine-stamped fields: the
/// correlation id is assigned at most once ([`Message::set_mid`] is
/// idempotent) and the code is validated against the partitioned code space
/// on every set.
#[derive(Debug, Clone)]
pub struct Message {
    mid: Option<u32>,
    code: u8,
    kind: Kind,
    path: Option<String>,
    token: Option<String>,
    app_id: Option<String>,
    payload: Option<Value>,
    duplicate: bool,
}

impl Message {
    /// Creates a message, normalizing the sugar kinds.
    ///
    /// `Kind::Event` becomes a `Kind::Trigger` with `path + "/event"`;
    /// `Kind::Upload` becomes a `Kind::Trigger` with `path + "/upload"`.
    pub fn new(kind: Kind, path: Option<String>, payload: Option<Value>) -> Self {
        let (kind, path) = match kind {
            Kind::Event => (Kind::Trigger, Some(suffixed(path, EVENT_SUFFIX))),
            Kind::Upload => (Kind::Trigger, Some(suffixed(path, UPLOAD_SUFFIX))),
            other => (other, path),
        };

        Self {
            mid: None,
            code: code::NOP,
            kind,
            path,
            token: None,
            app_id: None,
            payload,
            duplicate: false,
        }
    }

    /// Creates an empty message of the given kind.
    pub fn of(kind: Kind) -> Self {
        Self::new(kind, None, None)
    }

    /// Creates an application-trigger message for a resource path.
    pub fn trigger(path: &str, payload: Value) -> Self {
        Self::new(Kind::Trigger, Some(path.to_string()), Some(payload))
    }

    /// Decodes the shared WebSocket/MQTT wire JSON envelope.
    ///
    /// Decoding rules: an explicit `"op"` key wins; an empty JSON object means
    /// [`code::ACK`]; a bare `"err"` key means [`code::UNKNOWN`] with an
    /// `{"err": ...}` payload. An empty text unit decodes to a [`code::NOP`]
    /// session message.
    pub fn from_wire(text: &str) -> Result<Self, Error> {
        let mut msg = Message::of(Kind::Session);
        if text.is_empty() {
            return Ok(msg);
        }

        let value: Value = serde_json::from_str(text)?;
        let obj = value
            .as_object()
            .ok_or(Error::Protocol("wire envelope is not a JSON object"))?;

        let err = obj.get(KEY_ERR).and_then(Value::as_str);
        if let Some(op) = obj.get(KEY_CODE).and_then(Value::as_u64) {
            // values too wide for the code space are as unclassifiable as
            // bytes in the reserved gap
            let byte = u8::try_from(op).map_or(code::UNKNOWN, code::classify);
            msg.set_code(byte)?;
        } else if obj.is_empty() {
            msg.set_code(code::ACK)?;
        } else if err.is_some() {
            msg.set_code(code::UNKNOWN)?;
        }

        if let Some(mid) = obj.get(KEY_MID).and_then(Value::as_u64) {
            msg.set_mid(mid as u32);
        }
        if let Some(uri) = obj.get(KEY_URI).and_then(Value::as_str) {
            msg.set_path(uri.to_string());
        }
        msg.payload = match err {
            Some(err) => Some(serde_json::json!({ KEY_ERR: err })),
            None => obj.get(KEY_MSG).cloned(),
        };

        Ok(msg)
    }

    /// The correlation id, if one has been assigned.
    pub fn mid(&self) -> Option<u32> {
        self.mid
    }

    /// Assigns the correlation id. Idempotent: the first assignment wins.
    pub fn set_mid(&mut self, mid: u32) {
        if self.mid.is_none() {
            self.mid = Some(mid);
        }
    }

    /// The status/op code.
    pub fn code(&self) -> u8 {
        self.code
    }

    /// Sets the status/op code, rejecting bytes outside the partitioned ranges.
    pub fn set_code(&mut self, code: u8) -> Result<(), Error> {
        if !code::is_valid(code) {
            return Err(Error::InvalidCode(code));
        }
        self.code = code;
        Ok(())
    }

    /// The logical channel of this message.
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// The transport-agnostic resource path.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Replaces the resource path.
    pub fn set_path(&mut self, path: String) {
        self.path = Some(path);
    }

    /// The per-message credential token, if stamped.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Stamps the credential token.
    pub fn set_token(&mut self, token: &str) {
        self.token = Some(token.to_string());
    }

    /// The app/device id, if stamped.
    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    /// Stamps the app/device id.
    pub fn set_app_id(&mut self, app_id: &str) {
        self.app_id = Some(app_id.to_string());
    }

    /// The opaque JSON payload.
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Replaces the payload.
    pub fn set_payload(&mut self, payload: Value) {
        self.payload = Some(payload);
    }

    /// Whether the transport flagged this message as a redelivery.
    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    /// Marks this message as a redelivery.
    pub fn set_duplicate(&mut self, duplicate: bool) {
        self.duplicate = duplicate;
    }
}

fn suffixed(path: Option<String>, suffix: &str) -> String {
    match path {
        Some(p) => format!("{p}/{suffix}"),
        None => suffix.to_string(),
    }
}
