//! Persistent WebSocket transport.
//!
//! One long-lived session per client: an HTTP upgrade handshake carrying the
//! raw token as a query parameter, then RFC 6455 text frames holding the JSON
//! wire envelope. The transport answers pings, emits its own keepalive ping
//! after a configurable idle window and reconnects with backoff when the
//! session drops.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use base64ct::{Base64, Encoding};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::backoff::Backoff;
use crate::config::Config;
use crate::error::{Error, check_empty};
use crate::message::{Kind, Message, code};
use crate::transport::{
    Close, Connect, Credentials, Read, Transport, Write, bad_request, read_full, remote_addr,
};

const DEFAULT_PORT: u16 = 443;
const SESSION_PATH: &str = "/w/api/v1/mo/";
const WS_VERSION: &str = "13";

const OP_TEXT: u8 = 0x1;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

const FIN: u8 = 0x80;
const MASK: u8 = 0x80;

/// Outbound wire envelope; absent fields are omitted entirely.
#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    mid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uri: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg: Option<&'a Value>,
}

/// WebSocket transport over a caller-supplied connector.
pub struct WsTransport<N: Connect> {
    connector: N,
    remote: String,
    host: String,
    app_id: String,
    credentials: Credentials,
    connection: Option<N::Connection>,
    backoff: Backoff,
    keepalive: Duration,
    last_activity: Instant,
    queued: VecDeque<Message>,
}

impl<N: Connect> WsTransport<N> {
    /// Creates the transport. Fails fast on empty credentials or host.
    pub fn new(connector: N, config: &Config, app_id: &str, token: &str) -> Result<Self, Error> {
        check_empty(app_id, "App/Device ID")?;
        check_empty(token, "token")?;
        check_empty(&config.host, "host")?;

        Ok(Self {
            connector,
            remote: remote_addr(&config.host, DEFAULT_PORT),
            host: config.host.clone(),
            app_id: app_id.to_string(),
            credentials: Credentials::new(token),
            connection: None,
            backoff: config.backoff(),
            keepalive: config.keepalive,
            last_activity: Instant::now(),
            queued: VecDeque::new(),
        })
    }

    /// Dials under backoff and performs the upgrade handshake.
    ///
    /// A refused upgrade is a session-level outcome, not a transport error:
    /// it queues a synthesized non-success session message for the engine to
    /// act on.
    fn establish(&mut self) -> Result<(), Error> {
        if self.connection.is_some() {
            return Ok(());
        }
        loop {
            match self.connector.connect(&self.remote) {
                Ok(conn) => {
                    self.connection = Some(conn);
                    break;
                }
                Err(err) => {
                    warn!("failed to connect to {}: {err}", self.remote);
                    if !self.backoff.should_retry() {
                        return Err(Error::NotConnected);
                    }
                }
            }
        }

        match self.handshake() {
            Ok(()) => {
                info!("websocket session established with {}", self.remote);
                self.backoff.reset();
                self.last_activity = Instant::now();
                self.queued.push_back(session_status(code::ACK));
                Ok(())
            }
            Err(err) => {
                warn!("websocket upgrade refused: {err}");
                if let Some(conn) = self.connection.take() {
                    let _ = conn.close();
                }
                self.queued.push_back(session_status(code::UNKNOWN));
                Ok(())
            }
        }
    }

    fn handshake(&mut self) -> Result<(), Error> {
        let key: [u8; 16] = rand::random();
        let key = Base64::encode_string(&key);
        let path = format!(
            "{SESSION_PATH}{}?token={}",
            self.app_id,
            self.credentials.token()
        );

        let request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: {WS_VERSION}\r\n\r\n",
            self.host
        );

        let conn = self.connection.as_mut().ok_or(Error::NotConnected)?;
        conn.write(request.as_bytes()).map_err(|_| Error::Write)?;
        conn.flush().map_err(|_| Error::Write)?;

        let mut head = Vec::with_capacity(256);
        while !head.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            read_full(conn, &mut byte)?;
            head.push(byte[0]);
        }
        let head = std::str::from_utf8(&head)
            .map_err(|_| Error::Protocol("handshake response is not UTF-8"))?;
        let status = head
            .lines()
            .next()
            .and_then(|line| line.splitn(3, ' ').nth(1))
            .ok_or(Error::Protocol("malformed handshake response"))?;
        if status != "101" {
            return Err(Error::ConnectionRefused);
        }
        Ok(())
    }

    fn write_frame(&mut self, opcode: u8, payload: &[u8]) -> Result<(), Error> {
        let conn = self.connection.as_mut().ok_or(Error::NotConnected)?;

        let mut frame = Vec::with_capacity(payload.len() + 14);
        frame.push(FIN | opcode);
        if payload.len() < 126 {
            frame.push(MASK | payload.len() as u8);
        } else if payload.len() <= u16::MAX as usize {
            frame.push(MASK | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            frame.push(MASK | 127);
            frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        // client frames must be masked
        let mask: [u8; 4] = rand::random();
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));

        if conn.write(&frame).is_err() || conn.flush().is_err() {
            self.drop_connection();
            return Err(Error::Write);
        }
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Reads one frame; `Ok(None)` when nothing is pending.
    fn read_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>, Error> {
        let mut header = [0u8; 2];
        let peek = match self.connection.as_mut() {
            Some(conn) => conn.read(&mut header[..1]),
            None => return Ok(None),
        };
        match peek {
            Ok(0) => {
                self.drop_connection();
                return Ok(None);
            }
            Ok(_) => {}
            Err(Error::Timeout) => return Ok(None),
            Err(_) => {
                self.drop_connection();
                return Err(Error::Read);
            }
        }

        match self.read_frame_rest(&mut header) {
            Ok(frame) => {
                self.last_activity = Instant::now();
                Ok(Some(frame))
            }
            Err(err) => {
                self.drop_connection();
                Err(err)
            }
        }
    }

    fn read_frame_rest(&mut self, header: &mut [u8; 2]) -> Result<(u8, Vec<u8>), Error> {
        let conn = self.connection.as_mut().ok_or(Error::NotConnected)?;
        read_full(conn, &mut header[1..])?;

        let opcode = header[0] & 0x0F;
        // server frames are never masked per RFC 6455
        if header[1] & MASK != 0 {
            return Err(Error::Protocol("masked server frame"));
        }
        let len = match header[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                read_full(conn, &mut ext)?;
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                read_full(conn, &mut ext)?;
                u64::from_be_bytes(ext) as usize
            }
            n => n as usize,
        };

        let mut payload = vec![0u8; len];
        read_full(conn, &mut payload)?;
        Ok((opcode, payload))
    }

    fn drop_connection(&mut self) {
        if let Some(conn) = self.connection.take() {
            let _ = conn.close();
        }
    }
}

impl<N: Connect> Transport for WsTransport<N> {
    fn connect(&mut self, _scope_id: Option<&str>, _wants_ops: bool) -> Result<(), Error> {
        self.establish()
    }

    fn disconnect(&mut self) {
        if self.connection.is_some() {
            let _ = self.write_frame(OP_CLOSE, &[]);
        }
        self.drop_connection();
    }

    fn send(&mut self, msg: &Message) -> Result<(), Error> {
        if self.connection.is_none() {
            info!("attempting to connect ...");
            self.establish()?;
            if self.connection.is_none() {
                return Err(Error::NotConnected);
            }
        }

        let envelope = Envelope {
            mid: msg.mid(),
            uri: msg.path(),
            msg: msg.payload(),
        };
        let text = serde_json::to_string(&envelope)?;
        debug!("sending json to: {:?}, msg: {text}", msg.path());
        self.write_frame(OP_TEXT, text.as_bytes())
    }

    fn recv(&mut self) -> Result<Option<Message>, Error> {
        if let Some(msg) = self.queued.pop_front() {
            return Ok(Some(msg));
        }
        if self.connection.is_none() {
            self.establish()?;
            return Ok(self.queued.pop_front());
        }

        if self.last_activity.elapsed() >= self.keepalive {
            debug!("idle for {}s, sending ping", self.keepalive.as_secs());
            self.write_frame(OP_PING, &[])?;
        }

        loop {
            let Some((opcode, payload)) = self.read_frame()? else {
                return Ok(None);
            };
            match opcode {
                OP_TEXT => {
                    let text = match std::str::from_utf8(&payload) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("non-UTF-8 text frame");
                            return Ok(Some(bad_request("non-UTF-8 text frame")));
                        }
                    };
                    return match Message::from_wire(text) {
                        Ok(msg) => Ok(Some(msg)),
                        Err(err) => {
                            warn!("malformed wire envelope: {err}");
                            Ok(Some(bad_request("malformed wire envelope")))
                        }
                    };
                }
                OP_PING => self.write_frame(OP_PONG, &payload)?,
                OP_PONG => debug!("pong received"),
                OP_CLOSE => {
                    info!("close frame received, session dropped");
                    self.drop_connection();
                    return Ok(None);
                }
                other => {
                    warn!("unsupported frame opcode {other:#03x}");
                    return Ok(Some(bad_request("unsupported frame opcode")));
                }
            }
        }
    }

    fn set_app_id(&mut self, app_id: &str) {
        self.app_id = app_id.to_string();
    }

    fn set_token(&mut self, token: &str) {
        self.credentials.set_token(token);
    }
}

impl<N: Connect> fmt::Debug for WsTransport<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsTransport")
            .field("remote", &self.remote)
            .field("connected", &self.connection.is_some())
            .finish_non_exhaustive()
    }
}

fn session_status(status: u8) -> Message {
    let mut msg = Message::of(Kind::Session);
    // status constants are always inside the partitioned ranges
    let _ = msg.set_code(status);
    msg
}
