//! # cloudlink - Rust cloud connectivity SDK
//!
//! A Rust SDK that lets applications and IoT devices exchange structured
//! messages with a cloud platform over one of three interchangeable
//! transports: stateless HTTPS request/response, a persistent WebSocket
//! session, or MQTT publish/subscribe.
//!
//! ## Design
//!
//! - One [`Message`] envelope, one status/op code space and one resource-path
//!   scheme shared by all transports; switching the wire protocol is a
//!   configuration change, not a code change.
//! - The caller owns the sockets: transports are generic over a
//!   [`transport::Connect`] factory producing ready-to-use connections
//!   (typically TLS streams), so TLS and socket setup stay outside the SDK.
//! - The [`Engine`] drives a pull-based delivery loop, dispatches
//!   platform-initiated requests to the registered handler capabilities and
//!   tracks session establishment; reconnects run under an exponential
//!   [`Backoff`] that never permanently gives up.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cloudlink::transport::http::HttpTransport;
//! use cloudlink::{Config, Engine, Message, TransportKind};
//! # use cloudlink::transport::{Close, Connect, Connection, Read, Write};
//! # use cloudlink::Error;
//! # struct MockConnection;
//! # impl Connection for MockConnection {}
//! # impl Read for MockConnection {
//! #     fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Error> { Err(Error::Timeout) }
//! # }
//! # impl Write for MockConnection {
//! #     fn write(&mut self, buf: &[u8]) -> Result<usize, Error> { Ok(buf.len()) }
//! #     fn flush(&mut self) -> Result<(), Error> { Ok(()) }
//! # }
//! # impl Close for MockConnection {
//! #     fn close(self) -> Result<(), Error> { Ok(()) }
//! # }
//! # struct TlsConnector;
//! # impl Connect for TlsConnector {
//! #     type Connection = MockConnection;
//! #     fn connect(&mut self, _remote: &str) -> Result<MockConnection, Error> { Ok(MockConnection) }
//! # }
//!
//! # fn main() -> Result<(), cloudlink::Error> {
//! let config = Config::for_host(TransportKind::Https, "platform.example.com");
//! let transport = HttpTransport::new(TlsConnector, &config, "my-app-id", "my-token")?;
//! let engine = Engine::new(transport, "my-app-id", "my-token")?;
//!
//! let mut msg = Message::trigger("my-icapp-id", serde_json::json!({ "temp": 23.5 }));
//! engine.outbound(cloudlink::message::code::EXEC, &mut msg)?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod message;
pub mod transport;

pub use backoff::{Backoff, Strategy};
pub use config::{Config, TransportKind};
pub use engine::Engine;
pub use error::Error;
pub use handler::{CompletionStatus, HandlerRef, OperationHandler, ReplyHandler};
pub use message::{Kind, Message};
