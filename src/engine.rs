//! The protocol engine: session state, message dispatch and path derivation.
//!
//! One [`Engine`] sits between the caller and a single [`Transport`]. The
//! caller sends through [`Engine::outbound`] and receives through the
//! delivery loop ([`Engine::poll`] / [`Engine::run`]), which pulls inbound
//! messages off the transport and dispatches them to the registered
//! [`HandlerRef`] capabilities. All shared state uses interior mutability so
//! the caller thread and the delivery thread can work the same engine.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{Value, json};

use crate::error::{Error, check_empty};
use crate::handler::HandlerRef;
use crate::message::{KEY_ERR, KEY_MID, KEY_MSG, Kind, Message, code};
use crate::transport::Transport;

/// Root of per-device resource paths.
pub(crate) const DEVICE_PATH: &str = "/api/v1/mo/";
/// Root of application-trigger paths.
pub(crate) const TRIGGER_PATH: &str = "/api/v1/icapp/";
/// Root of API-gateway paths.
pub(crate) const GATEWAY_PATH: &str = "/api/v1/agw/";

const POLL_IDLE: Duration = Duration::from_millis(20);

/// Lifecycle of the logical session with the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Waiting for the first success-class message from the platform.
    Establishing,
    /// Session confirmed; success-class messages are ordinary replies.
    Ready,
}

/// The protocol engine over one transport.
pub struct Engine<T: Transport> {
    transport: Mutex<T>,
    seq: AtomicU32,
    state: Mutex<SessionState>,
    handler: RwLock<Option<HandlerRef>>,
    app_id: Mutex<String>,
    token: Mutex<String>,
}

/// Poisoned locks only mean another thread panicked mid-update of a small
/// scalar; the data is still usable.
fn relock<G>(guard: Result<G, PoisonError<G>>) -> G {
    guard.unwrap_or_else(PoisonError::into_inner)
}

impl<T: Transport> Engine<T> {
    /// Creates an engine over `transport`. Fails fast on empty credentials.
    ///
    /// Stateless transports need no establishment round trip, so the engine
    /// starts `Ready` for them.
    pub fn new(transport: T, app_id: &str, token: &str) -> Result<Self, Error> {
        check_empty(app_id, "App/Device ID")?;
        check_empty(token, "token")?;

        let state = if transport.stateless() {
            SessionState::Ready
        } else {
            SessionState::Establishing
        };
        Ok(Self {
            transport: Mutex::new(transport),
            seq: AtomicU32::new(1),
            state: Mutex::new(state),
            handler: RwLock::new(None),
            app_id: Mutex::new(app_id.to_string()),
            token: Mutex::new(token.to_string()),
        })
    }

    /// Registers (or replaces) the caller's handler.
    pub fn set_handler(&self, handler: HandlerRef) {
        *relock(self.handler.write()) = Some(handler);
    }

    fn handler(&self) -> Option<HandlerRef> {
        relock(self.handler.read()).clone()
    }

    /// Connects the transport. `scope_id` optionally narrows the inbound
    /// subscription to one logical resource.
    pub fn connect(&self, scope_id: Option<&str>) -> Result<(), Error> {
        let wants_ops = matches!(self.handler(), Some(HandlerRef::Operation(_)));
        relock(self.transport.lock()).connect(scope_id, wants_ops)
    }

    /// Tears the transport down. In-flight correlations are abandoned.
    pub fn disconnect(&self) {
        relock(self.transport.lock()).disconnect();
    }

    /// Replaces the credential token for subsequent sends.
    pub fn set_token(&self, token: &str) -> Result<(), Error> {
        check_empty(token, "token")?;
        *relock(self.token.lock()) = token.to_string();
        relock(self.transport.lock()).set_token(token);
        Ok(())
    }

    /// Replaces the app/device id for subsequent sends.
    pub fn set_app_id(&self, app_id: &str) -> Result<(), Error> {
        check_empty(app_id, "App/Device ID")?;
        *relock(self.app_id.lock()) = app_id.to_string();
        relock(self.transport.lock()).set_app_id(app_id);
        Ok(())
    }

    /// Stamps and transmits one message with the given op/status code.
    ///
    /// Assigns the next sequence id as the correlation id (first assignment
    /// wins), stamps token and app id, derives the wire path from the message
    /// kind and hands the message to the transport.
    pub fn outbound(&self, op: u8, msg: &mut Message) -> Result<(), Error> {
        msg.set_code(op)?;
        msg.set_mid(self.seq.fetch_add(1, Ordering::Relaxed));

        let app_id = relock(self.app_id.lock()).clone();
        let token = relock(self.token.lock()).clone();
        msg.set_token(&token);
        if msg.app_id().is_none() {
            msg.set_app_id(&app_id);
        }

        let path = match msg.path() {
            // already a full wire path, e.g. a rewritten reply
            Some(path) if path.starts_with("/api/v1/") => path.to_string(),
            _ => wire_path(msg, &app_id),
        };
        msg.set_path(path);

        debug!(
            "sending {} mid {:?} to {:?}",
            code::name(msg.code()),
            msg.mid(),
            msg.path()
        );
        relock(self.transport.lock()).send(msg)
    }

    /// Dispatches one inbound message.
    ///
    /// Handler failures are reported to `on_exception`; when the inbound
    /// message was a platform request, an INTERNAL_ERROR reply is sent
    /// best-effort so the platform is not left waiting. A non-success status
    /// while the session is still being established is fatal and propagates
    /// as [`Error::SessionRejected`].
    pub fn inbound(&self, msg: Message) -> Result<(), Error> {
        match self.dispatch(&msg) {
            Ok(()) => Ok(()),
            Err(Error::SessionRejected) => {
                if let Some(handler) = self.handler() {
                    handler.reply().on_exception(&Error::SessionRejected);
                }
                Err(Error::SessionRejected)
            }
            Err(err) => {
                warn!("dispatch failed: {err}");
                if let Some(handler) = self.handler() {
                    handler.reply().on_exception(&err);
                }
                if (code::READ..=code::EXEC).contains(&msg.code()) {
                    let payload = json!({ KEY_MSG: err.to_string() });
                    if let Err(reply_err) = self.reply(&msg, code::INTERNAL_ERROR, payload) {
                        warn!("failed to send error reply: {reply_err}");
                    }
                }
                Ok(())
            }
        }
    }

    fn dispatch(&self, msg: &Message) -> Result<(), Error> {
        let msg_code = msg.code();
        if msg_code == code::NOP {
            debug!("nop received");
            return Ok(());
        }

        let handler = self.handler();

        if (code::READ..=code::INFO).contains(&msg_code) {
            let Some(op_handler) = handler.as_ref().and_then(|h| h.operation().cloned()) else {
                let app_id = match msg.app_id() {
                    Some(id) => id.to_string(),
                    None => relock(self.app_id.lock()).clone(),
                };
                warn!("no operation handler registered for {app_id}");
                let payload =
                    json!({ KEY_ERR: format!("no operation handler registered for {app_id}") });
                return self.reply(msg, code::FORBIDDEN, payload);
            };
            return match msg_code {
                code::READ => {
                    let result = op_handler.read(msg.payload())?;
                    self.reply(msg, code::ACK, result)
                }
                code::WRITE | code::UPDATE | code::DELETE => {
                    let status = op_handler.write(msg.payload(), msg_code)?;
                    self.reply(msg, code::ACK, json!({ "status": status }))
                }
                code::EXEC => {
                    let status = op_handler.exec(msg.payload())?;
                    self.reply(msg, code::ACK, json!({ "status": status }))
                }
                other => {
                    debug!("ignoring request op {}", code::name(other));
                    Ok(())
                }
            };
        }
        if code::is_request_op(msg_code) {
            debug!("ignoring request op {}", code::name(msg_code));
            return Ok(());
        }

        if code::is_success(msg_code) {
            let became_ready = {
                let mut state = relock(self.state.lock());
                if *state == SessionState::Establishing {
                    *state = SessionState::Ready;
                    true
                } else {
                    false
                }
            };
            if became_ready {
                info!("session established");
                // never run caller code inline on the delivery path
                if let Some(op_handler) = handler.as_ref().and_then(|h| h.operation().cloned()) {
                    thread::spawn(move || op_handler.connected());
                }
                return Ok(());
            }
            return match handler {
                Some(handler) => handler.reply().ack(msg.payload()),
                None => {
                    debug!("dropping unhandled reply {}", code::name(msg_code));
                    Ok(())
                }
            };
        }

        if *relock(self.state.lock()) == SessionState::Establishing {
            return Err(Error::SessionRejected);
        }

        match handler {
            Some(handler) => handler.reply().ack(msg.payload()),
            None => {
                debug!("dropping unhandled status {}", code::name(msg_code));
                Ok(())
            }
        }
    }

    /// Synthesizes and sends the reply to a platform-initiated request.
    ///
    /// The reply payload carries the original correlation id. Requests that
    /// arrived on an application-trigger path with a `/svc/` segment are
    /// answered on the same path with `/svc/` rewritten to `/ack/`; everything
    /// else is answered as a plain [`Kind::Ack`] message.
    fn reply(&self, original: &Message, reply_code: u8, mut payload: Value) -> Result<(), Error> {
        if let (Some(mid), Some(obj)) = (original.mid(), payload.as_object_mut()) {
            obj.insert(KEY_MID.to_string(), mid.into());
        }

        let mut reply = match original.path() {
            Some(path) if path.starts_with(TRIGGER_PATH) => {
                let rel = &path[TRIGGER_PATH.len()..];
                match rel.find("/svc/") {
                    Some(idx) if idx > 0 => Message::new(
                        Kind::Trigger,
                        Some(rel.replacen("/svc/", "/ack/", 1)),
                        Some(payload),
                    ),
                    _ => Message::new(Kind::Ack, None, Some(payload)),
                }
            }
            _ => Message::new(Kind::Ack, None, Some(payload)),
        };
        if let Some(mid) = original.mid() {
            reply.set_mid(mid);
        }
        self.outbound(reply_code, &mut reply)
    }

    /// One delivery-loop turn. Returns whether a message was delivered.
    ///
    /// Transport receive failures feed the log and the next turn retries;
    /// dispatch failures follow the [`Engine::inbound`] policy.
    pub fn poll(&self) -> Result<bool, Error> {
        let received = match relock(self.transport.lock()).recv() {
            Ok(received) => received,
            Err(err) => {
                warn!("receive failed: {err}");
                None
            }
        };
        match received {
            Some(msg) => {
                self.inbound(msg)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Runs the delivery loop until the registered handler requests shutdown
    /// or a fatal dispatch error occurs. Disconnects on the way out.
    pub fn run(&self) -> Result<(), Error> {
        loop {
            if let Some(handler) = self.handler()
                && handler.reply().shutdown()
            {
                info!("shutdown requested");
                self.disconnect();
                return Ok(());
            }
            match self.poll() {
                Ok(true) => {}
                Ok(false) => thread::sleep(POLL_IDLE),
                Err(err) => {
                    self.disconnect();
                    return Err(err);
                }
            }
        }
    }
}

impl<T: Transport> fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &*relock(self.state.lock()))
            .field("seq", &self.seq.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Derives the wire path for an outbound message from its kind.
fn wire_path(msg: &Message, app_id: &str) -> String {
    match msg.kind() {
        Kind::Api => format!("{GATEWAY_PATH}{}", msg.path().unwrap_or("")),
        Kind::Trigger => match msg.path() {
            Some(path) => format!("{TRIGGER_PATH}{path}"),
            None => TRIGGER_PATH.trim_end_matches('/').to_string(),
        },
        kind => match msg.path() {
            Some(path) => format!("{DEVICE_PATH}{app_id}/{}/{path}", kind.wire_name()),
            None => format!("{DEVICE_PATH}{app_id}/{}", kind.wire_name()),
        },
    }
}
