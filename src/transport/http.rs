//! Stateless HTTPS request/response transport.
//!
//! One round trip per send, no persistent session: `send` writes one
//! HTTP/1.1 request and returns once the wire write completes; the response
//! is consumed asynchronously by [`recv`](crate::transport::Transport::recv)
//! and delivered as an inbound [`Message`] with the HTTP status mapped onto
//! the shared code space.

use std::fmt;

use log::{debug, info, warn};
use serde_json::Value;

use crate::backoff::Backoff;
use crate::config::Config;
use crate::error::{Error, check_empty};
use crate::message::{Kind, Message, code};
use crate::transport::{
    Close, Connect, Credentials, Read, Transport, Write, bad_request, read_full, remote_addr,
};

const DEFAULT_PORT: u16 = 443;
const MEDIA_TYPE_JSON: &str = "application/json";

/// HTTPS transport over a caller-supplied connector.
pub struct HttpTransport<N: Connect> {
    connector: N,
    remote: String,
    host: String,
    credentials: Credentials,
    connection: Option<N::Connection>,
    backoff: Backoff,
}

impl<N: Connect> HttpTransport<N> {
    /// Creates the transport. Fails fast on empty credentials or host.
    pub fn new(connector: N, config: &Config, app_id: &str, token: &str) -> Result<Self, Error> {
        check_empty(app_id, "App/Device ID")?;
        check_empty(token, "token")?;
        check_empty(&config.host, "host")?;

        Ok(Self {
            connector,
            remote: remote_addr(&config.host, DEFAULT_PORT),
            host: config.host.clone(),
            credentials: Credentials::new(token),
            connection: None,
            backoff: config.backoff(),
        })
    }

    fn ensure_connected(&mut self) -> Result<(), Error> {
        if self.connection.is_some() {
            return Ok(());
        }
        loop {
            match self.connector.connect(&self.remote) {
                Ok(conn) => {
                    debug!("successfully connected to {}", self.remote);
                    self.connection = Some(conn);
                    self.backoff.reset();
                    return Ok(());
                }
                Err(err) => {
                    warn!("failed to connect to {}: {err}", self.remote);
                    if !self.backoff.should_retry() {
                        return Err(Error::NotConnected);
                    }
                }
            }
        }
    }

    fn write_request(&mut self, msg: &Message) -> Result<(), Error> {
        let method = method_for(msg.code())?;
        let path = msg.path().unwrap_or("/");
        let body = msg.payload().map(Value::to_string);

        let mut request = Vec::with_capacity(256);
        request.extend_from_slice(method.as_bytes());
        request.push(b' ');
        request.extend_from_slice(path.as_bytes());
        request.extend_from_slice(b" HTTP/1.1\r\n");
        push_header(&mut request, "Host", &self.host);
        push_header(&mut request, "Connection", "keep-alive");
        push_header(&mut request, "Content-Type", MEDIA_TYPE_JSON);
        push_header(&mut request, "Authorization", self.credentials.header());
        match &body {
            Some(body) => {
                push_header(&mut request, "Content-Length", &body.len().to_string());
                request.extend_from_slice(b"\r\n");
                request.extend_from_slice(body.as_bytes());
            }
            None => request.extend_from_slice(b"\r\n"),
        }

        debug!("sending json to: {path}, msg: {body:?}");
        let conn = self.connection.as_mut().ok_or(Error::NotConnected)?;
        conn.write(&request).map_err(|_| Error::Write)?;
        conn.flush().map_err(|_| Error::Write)
    }

    fn read_response(&mut self) -> Result<Option<Message>, Error> {
        // Peek one byte: nothing pending is the common case.
        let mut first = [0u8; 1];
        let peek = match self.connection.as_mut() {
            Some(conn) => conn.read(&mut first),
            None => return Ok(None),
        };
        match peek {
            Ok(0) => {
                // keep-alive connection expired; the next send reconnects
                self.connection = None;
                return Ok(None);
            }
            Ok(_) => {}
            Err(Error::Timeout) => return Ok(None),
            Err(_) => {
                self.connection = None;
                return Err(Error::Read);
            }
        }

        let conn = self.connection.as_mut().ok_or(Error::NotConnected)?;
        let mut head = vec![first[0]];
        while !head.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            read_full(conn, &mut byte)?;
            head.push(byte[0]);
        }

        let head_str = std::str::from_utf8(&head[..head.len() - 4])
            .map_err(|_| Error::Protocol("response head is not UTF-8"))?;
        let mut lines = head_str.lines();

        let status_line = lines.next().ok_or(Error::Protocol("missing status line"))?;
        let status = status_line
            .splitn(3, ' ')
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or(Error::Protocol("malformed status line"))?;

        let mut content_length = 0usize;
        let mut content_type = String::new();
        let mut close = false;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = value.parse().unwrap_or(0);
            } else if name.eq_ignore_ascii_case("Content-Type") {
                content_type = value.to_string();
            } else if name.eq_ignore_ascii_case("Connection") {
                close = value.eq_ignore_ascii_case("close");
            }
        }

        let mut body = vec![0u8; content_length];
        read_full(conn, &mut body)?;
        if close {
            self.connection = None;
        }

        let msg_code = status_to_code(status);
        let mut msg = Message::of(Kind::Session);
        msg.set_code(msg_code)?;

        if !body.is_empty() {
            if !content_type.starts_with(MEDIA_TYPE_JSON) {
                warn!("invalid response media type: {content_type}");
                return Ok(Some(bad_request("invalid response media type")));
            }
            match serde_json::from_slice::<Value>(&body) {
                Ok(payload) => msg.set_payload(payload),
                Err(err) => {
                    warn!("malformed response body: {err}");
                    return Ok(Some(bad_request("malformed response body")));
                }
            }
        }

        debug!("received msg code: {}", code::name(msg_code));
        Ok(Some(msg))
    }
}

impl<N: Connect> Transport for HttpTransport<N> {
    fn connect(&mut self, _scope_id: Option<&str>, _wants_ops: bool) -> Result<(), Error> {
        self.ensure_connected()
    }

    fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            let _ = conn.close();
        }
    }

    fn send(&mut self, msg: &Message) -> Result<(), Error> {
        // codes with no HTTP method fail before any I/O
        method_for(msg.code())?;

        if self.connection.is_none() {
            info!("attempting to connect ...");
            self.ensure_connected()?;
        }
        match self.write_request(msg) {
            Ok(()) => Ok(()),
            Err(Error::Write) => {
                // a stale keep-alive connection fails on write; one fresh retry
                self.connection = None;
                self.ensure_connected()?;
                match self.write_request(msg) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        self.connection = None;
                        Err(err)
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    fn recv(&mut self) -> Result<Option<Message>, Error> {
        self.read_response()
    }

    fn set_app_id(&mut self, _app_id: &str) {
        // request paths carry the id, stamped by the engine
    }

    fn set_token(&mut self, token: &str) {
        self.credentials.set_token(token);
    }

    fn stateless(&self) -> bool {
        true
    }
}

impl<N: Connect> fmt::Debug for HttpTransport<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("remote", &self.remote)
            .field("connected", &self.connection.is_some())
            .finish_non_exhaustive()
    }
}

fn push_header(buf: &mut Vec<u8>, name: &str, value: &str) {
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

/// HTTP method for an outbound op/status code.
fn method_for(msg_code: u8) -> Result<&'static str, Error> {
    match msg_code {
        code::READ => Ok("GET"),
        code::WRITE | code::EXEC | code::ACK => Ok("POST"),
        code::UPDATE => Ok("PUT"),
        code::DELETE => Ok("DELETE"),
        other => Err(Error::InvalidCode(other)),
    }
}

/// Maps an HTTP status onto the shared code space.
pub(crate) fn status_to_code(status: u16) -> u8 {
    match status {
        100 => code::CONTINUE,
        102 => code::PROCESSING,

        200 => code::ACK,
        201 => code::CREATED,
        202 => code::ACCEPTED,
        204 => code::NO_CONTENT,
        205 | 206 => code::ACK,

        300..=305 | 307 => code::NOT_CHANGED,

        400 | 406 | 428 => code::BAD_REQUEST,
        401 => code::UNAUTHORIZED,
        403 | 405 | 501 => code::FORBIDDEN,
        404 => code::NOT_FOUND,
        408 => code::REQUEST_TIMEOUT,
        409 => code::CONFLICT,
        410 => code::GONE,
        411 => code::INVALID_CONTENT_SIZE,
        412 => code::PRECONDITION_FAILED,
        413 | 431 => code::PAYLOAD_TOO_LARGE,
        415 => code::UNSUPPORTED_MEDIA_TYPE,
        429 => code::TOO_MANY_REQUESTS,

        500 | 502 | 503 | 505 => code::SERVICE_UNAVAILABLE,
        504 => code::GATEWAY_TIMEOUT,

        _ => code::UNKNOWN,
    }
}
