//! Shared mocks for the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use cloudlink::transport::{Close, Connect, Connection, Read, Transport, Write};
use cloudlink::{Error, Message};

/// A scripted connection: reads serve pre-loaded chunks in order, writes are
/// captured for later inspection. An exhausted read script behaves like a
/// socket read timeout.
pub struct MockConnection {
    reads: VecDeque<Vec<u8>>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl MockConnection {
    pub fn new(reads: Vec<Vec<u8>>) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let conn = Self {
            reads: reads.into(),
            written: written.clone(),
        };
        (conn, written)
    }
}

impl Read for MockConnection {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let Some(chunk) = self.reads.front_mut() else {
            return Err(Error::Timeout);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            self.reads.pop_front();
        }
        Ok(n)
    }
}

impl Write for MockConnection {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl Close for MockConnection {
    fn close(self) -> Result<(), Error> {
        Ok(())
    }
}

impl Connection for MockConnection {}

/// Hands out pre-built connections in order; refuses once exhausted.
pub struct MockConnector {
    connections: VecDeque<MockConnection>,
}

impl MockConnector {
    pub fn new(connections: Vec<MockConnection>) -> Self {
        Self {
            connections: connections.into(),
        }
    }

    pub fn single(connection: MockConnection) -> Self {
        Self::new(vec![connection])
    }
}

impl Connect for MockConnector {
    type Connection = MockConnection;

    fn connect(&mut self, _remote: &str) -> Result<Self::Connection, Error> {
        self.connections.pop_front().ok_or(Error::ConnectionRefused)
    }
}

/// An in-memory transport for engine tests: records every sent message and
/// replays a scripted inbound sequence.
pub struct MockTransport {
    sent: Arc<Mutex<Vec<Message>>>,
    inbound: VecDeque<Message>,
    stateless: bool,
}

impl MockTransport {
    pub fn new(stateless: bool) -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            inbound: VecDeque::new(),
            stateless,
        }
    }

    pub fn sent(&self) -> Arc<Mutex<Vec<Message>>> {
        self.sent.clone()
    }

    pub fn push_inbound(&mut self, msg: Message) {
        self.inbound.push_back(msg);
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, _scope_id: Option<&str>, _wants_ops: bool) -> Result<(), Error> {
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn send(&mut self, msg: &Message) -> Result<(), Error> {
        self.sent.lock().unwrap().push(msg.clone());
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<Message>, Error> {
        Ok(self.inbound.pop_front())
    }

    fn set_app_id(&mut self, _app_id: &str) {}

    fn set_token(&mut self, _token: &str) {}

    fn stateless(&self) -> bool {
        self.stateless
    }
}
