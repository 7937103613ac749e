//! MQTT 3.1.1 publish/subscribe transport.
//!
//! Two broker sessions per client, one for publishing and one for the inbound
//! subscription, so a slow consumer never blocks outbound traffic. Messages
//! are published at QoS 0 to the message path as the topic; the subscription
//! covers the whole app/device scope with a multi-level wildcard.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::Config;
use crate::engine::{DEVICE_PATH, TRIGGER_PATH};
use crate::error::{Error, check_empty};
use crate::message::{Kind, Message, code};
use crate::transport::{
    Connect, Connection, Credentials, Transport, Write, bad_request, read_full, remote_addr,
};

const DEFAULT_PORT: u16 = 8883;

// MQTT 3.1.1 control packet types
const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const PUBACK: u8 = 0x40;
const SUBSCRIBE: u8 = 0x82;
const SUBACK: u8 = 0x90;
const PINGREQ: u8 = 0xC0;
const PINGRESP: u8 = 0xD0;
const DISCONNECT: u8 = 0xE0;

const PROTOCOL_NAME: &[u8] = b"MQTT";
const PROTOCOL_LEVEL: u8 = 4; // MQTT 3.1.1

// CONNECT flags
const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_USERNAME: u8 = 0x80;

// PUBLISH fixed-header flags
const FLAG_DUP: u8 = 0x08;

/// An inbound PUBLISH, parsed off the subscriber session.
struct InboundPublish {
    topic: String,
    packet_id: Option<u16>,
    dup: bool,
    payload: Vec<u8>,
}

/// One authenticated broker session over a single connection.
struct Session<C: Connection> {
    connection: C,
    last_activity: Instant,
}

impl<C: Connection> Session<C> {
    /// Performs the CONNECT/CONNACK handshake with username/password auth.
    fn connect(
        mut connection: C,
        client_id: &str,
        username: &str,
        password: &str,
        keep_alive_secs: u16,
    ) -> Result<Self, Error> {
        let mut vh = Vec::with_capacity(10);
        vh.extend_from_slice(&(PROTOCOL_NAME.len() as u16).to_be_bytes());
        vh.extend_from_slice(PROTOCOL_NAME);
        vh.push(PROTOCOL_LEVEL);
        vh.push(FLAG_CLEAN_SESSION | FLAG_USERNAME | FLAG_PASSWORD);
        vh.extend_from_slice(&keep_alive_secs.to_be_bytes());

        let mut payload = Vec::with_capacity(64);
        for field in [client_id.as_bytes(), username.as_bytes(), password.as_bytes()] {
            payload.extend_from_slice(&(field.len() as u16).to_be_bytes());
            payload.extend_from_slice(field);
        }

        let mut fixed_header = Vec::with_capacity(5);
        fixed_header.push(CONNECT);
        encode_remaining_length(&mut fixed_header, vh.len() + payload.len());

        connection.write(&fixed_header).map_err(|_| Error::Write)?;
        connection.write(&vh).map_err(|_| Error::Write)?;
        connection.write(&payload).map_err(|_| Error::Write)?;
        connection.flush().map_err(|_| Error::Write)?;

        let mut connack = [0u8; 4];
        read_full(&mut connection, &mut connack)?;
        if connack[0] != CONNACK || connack[1] != 2 {
            return Err(Error::Protocol("invalid CONNACK packet"));
        }
        match connack[3] {
            0 => Ok(Self {
                connection,
                last_activity: Instant::now(),
            }),
            1..=5 => Err(Error::ConnectionRefused),
            _ => Err(Error::Protocol("invalid CONNACK return code")),
        }
    }

    /// Publishes at QoS 0.
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), Error> {
        let topic_bytes = topic.as_bytes();
        let mut packet = Vec::with_capacity(2 + topic_bytes.len() + payload.len());
        packet.extend_from_slice(&(topic_bytes.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic_bytes);
        packet.extend_from_slice(payload);

        let mut fixed_header = Vec::with_capacity(5);
        fixed_header.push(PUBLISH);
        encode_remaining_length(&mut fixed_header, packet.len());

        self.connection.write(&fixed_header).map_err(|_| Error::Write)?;
        self.connection.write(&packet).map_err(|_| Error::Write)?;
        self.connection.flush().map_err(|_| Error::Write)?;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Subscribes to a topic filter and waits for the SUBACK.
    fn subscribe(&mut self, topic: &str) -> Result<(), Error> {
        let packet_id: u16 = 1;
        let topic_bytes = topic.as_bytes();

        let mut packet = Vec::with_capacity(5 + topic_bytes.len());
        packet.extend_from_slice(&packet_id.to_be_bytes());
        packet.extend_from_slice(&(topic_bytes.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic_bytes);
        packet.push(0); // requested QoS

        let mut fixed_header = Vec::with_capacity(5);
        fixed_header.push(SUBSCRIBE);
        encode_remaining_length(&mut fixed_header, packet.len());

        self.connection.write(&fixed_header).map_err(|_| Error::Write)?;
        self.connection.write(&packet).map_err(|_| Error::Write)?;
        self.connection.flush().map_err(|_| Error::Write)?;

        let mut suback = [0u8; 5];
        read_full(&mut self.connection, &mut suback)?;
        if suback[0] != SUBACK || u16::from_be_bytes([suback[2], suback[3]]) != packet_id {
            return Err(Error::Protocol("invalid SUBACK packet"));
        }
        if suback[4] == 0x80 {
            return Err(Error::Protocol("subscription rejected"));
        }
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Polls for one inbound PUBLISH; `Ok(None)` when nothing is pending.
    ///
    /// PINGRESP and other non-PUBLISH packets are consumed silently. QoS 1
    /// deliveries are acknowledged with a PUBACK before being returned.
    fn poll(&mut self) -> Result<Option<InboundPublish>, Error> {
        let mut header = [0u8; 1];
        match self.connection.read(&mut header) {
            Ok(0) => return Err(Error::ConnectionClosed),
            Ok(_) => {}
            Err(Error::Timeout) => return Ok(None),
            Err(_) => return Err(Error::Read),
        }

        let remaining_len = self.read_remaining_length()?;
        let mut body = vec![0u8; remaining_len];
        read_full(&mut self.connection, &mut body)?;
        self.last_activity = Instant::now();

        if header[0] & 0xF0 != PUBLISH {
            if header[0] == PINGRESP {
                debug!("pingresp received");
            }
            return Ok(None);
        }

        let dup = header[0] & FLAG_DUP != 0;
        let qos = (header[0] >> 1) & 0x03;

        if body.len() < 2 {
            return Err(Error::Protocol("truncated PUBLISH packet"));
        }
        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let mut offset = 2 + topic_len;
        if body.len() < offset {
            return Err(Error::Protocol("truncated PUBLISH packet"));
        }
        let topic = std::str::from_utf8(&body[2..offset])
            .map_err(|_| Error::Protocol("PUBLISH topic is not UTF-8"))?
            .to_string();

        let mut packet_id = None;
        if qos > 0 {
            if body.len() < offset + 2 {
                return Err(Error::Protocol("truncated PUBLISH packet"));
            }
            let id = u16::from_be_bytes([body[offset], body[offset + 1]]);
            packet_id = Some(id);
            offset += 2;
            self.connection
                .write(&[PUBACK, 2, body[offset - 2], body[offset - 1]])
                .map_err(|_| Error::Write)?;
            self.connection.flush().map_err(|_| Error::Write)?;
        }

        Ok(Some(InboundPublish {
            topic,
            packet_id,
            dup,
            payload: body.split_off(offset),
        }))
    }

    fn read_remaining_length(&mut self) -> Result<usize, Error> {
        let mut len = 0usize;
        let mut multiplier = 1usize;
        for _ in 0..4 {
            let mut byte = [0u8; 1];
            read_full(&mut self.connection, &mut byte)?;
            len += (byte[0] as usize & 0x7F) * multiplier;
            multiplier *= 128;
            if byte[0] & 0x80 == 0 {
                return Ok(len);
            }
        }
        Err(Error::Protocol("remaining length exceeds 4 bytes"))
    }

    fn ping(&mut self) -> Result<(), Error> {
        self.connection.write(&[PINGREQ, 0]).map_err(|_| Error::Write)?;
        self.connection.flush().map_err(|_| Error::Write)?;
        self.last_activity = Instant::now();
        Ok(())
    }

    fn close(mut self) {
        let _ = self.connection.write(&[DISCONNECT, 0]);
        let _ = self.connection.flush();
        let _ = self.connection.close();
    }
}

/// MQTT transport over a caller-supplied connector.
pub struct MqttTransport<N: Connect> {
    connector: N,
    remote: String,
    app_id: String,
    credentials: Credentials,
    keep_alive: Duration,
    keep_alive_secs: u16,
    publisher: Option<Session<N::Connection>>,
    subscriber: Option<Session<N::Connection>>,
    backoff: Backoff,
    scope: Option<String>,
    wants_ops: bool,
    queued: VecDeque<Message>,
}

impl<N: Connect> MqttTransport<N> {
    /// Creates the transport. Fails fast on empty credentials or host.
    pub fn new(connector: N, config: &Config, app_id: &str, token: &str) -> Result<Self, Error> {
        check_empty(app_id, "App/Device ID")?;
        check_empty(token, "token")?;
        check_empty(&config.host, "host")?;

        Ok(Self {
            connector,
            remote: remote_addr(&config.host, DEFAULT_PORT),
            app_id: app_id.to_string(),
            credentials: Credentials::new(token),
            keep_alive: Duration::from_secs(config.mqtt_keep_alive_secs as u64),
            keep_alive_secs: config.mqtt_keep_alive_secs,
            publisher: None,
            subscriber: None,
            backoff: config.backoff(),
            scope: None,
            wants_ops: false,
            queued: VecDeque::new(),
        })
    }

    fn dial(&mut self) -> Result<N::Connection, Error> {
        loop {
            match self.connector.connect(&self.remote) {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    warn!("failed to connect to {}: {err}", self.remote);
                    if !self.backoff.should_retry() {
                        return Err(Error::NotConnected);
                    }
                }
            }
        }
    }

    /// The inbound topic filter: the narrowed scope when one was given,
    /// otherwise the whole app/device subtree.
    fn subscription_topic(&self) -> String {
        match &self.scope {
            Some(scope) => format!("{TRIGGER_PATH}{scope}/#"),
            None => format!("{DEVICE_PATH}{}/#", self.app_id),
        }
    }

    /// Brings up the missing sessions and queues the session outcome.
    fn establish(&mut self) -> Result<(), Error> {
        if self.publisher.is_some() && (!self.wants_ops || self.subscriber.is_some()) {
            return Ok(());
        }

        if self.publisher.is_none() {
            let conn = self.dial()?;
            let client_id = format!("{}-pub", self.app_id);
            let session = Session::connect(
                conn,
                &client_id,
                &self.app_id,
                self.credentials.token(),
                self.keep_alive_secs,
            )?;
            info!("publisher session established with {}", self.remote);
            self.publisher = Some(session);
            self.backoff.reset();
        }

        if self.wants_ops && self.subscriber.is_none() {
            let conn = self.dial()?;
            let client_id = format!("{}-sub", self.app_id);
            let mut session = Session::connect(
                conn,
                &client_id,
                &self.app_id,
                self.credentials.token(),
                self.keep_alive_secs,
            )?;
            let topic = self.subscription_topic();
            match session.subscribe(&topic) {
                Ok(()) => {
                    info!("subscribed to {topic}");
                    self.subscriber = Some(session);
                }
                Err(err) => {
                    warn!("failed to subscribe to {topic}: {err}");
                    session.close();
                    self.queued.push_back(session_status(code::UNKNOWN));
                    return Ok(());
                }
            }
        }

        self.queued.push_back(session_status(code::ACK));
        Ok(())
    }

    fn message_from(&self, publish: InboundPublish) -> Message {
        let text = match std::str::from_utf8(&publish.payload) {
            Ok(text) => text,
            Err(_) => {
                warn!("non-UTF-8 publish payload on {}", publish.topic);
                return bad_request("non-UTF-8 publish payload");
            }
        };
        let mut msg = match Message::from_wire(text) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("malformed wire envelope on {}: {err}", publish.topic);
                return bad_request("malformed wire envelope");
            }
        };

        msg.set_path(publish.topic.clone());
        msg.set_duplicate(publish.dup);
        // packet id correlates the delivery when the envelope carried no mid
        if let Some(id) = publish.packet_id {
            msg.set_mid(id as u32);
        }
        if let Some(app_id) = publish.topic.split('/').nth(4)
            && !app_id.is_empty()
        {
            msg.set_app_id(app_id);
        }
        msg
    }
}

impl<N: Connect> Transport for MqttTransport<N> {
    fn connect(&mut self, scope_id: Option<&str>, wants_ops: bool) -> Result<(), Error> {
        self.scope = scope_id.map(str::to_string);
        self.wants_ops = wants_ops;
        self.establish()
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.publisher.take() {
            session.close();
        }
        if let Some(session) = self.subscriber.take() {
            session.close();
        }
    }

    fn send(&mut self, msg: &Message) -> Result<(), Error> {
        let payload = msg.payload().ok_or(Error::NullPayload)?;
        let topic = msg.path().ok_or(Error::Protocol("message has no path"))?;

        if self.publisher.is_none() {
            info!("attempting to connect ...");
            self.establish()?;
        }
        let Some(publisher) = self.publisher.as_mut() else {
            return Err(Error::NotConnected);
        };

        let text = payload.to_string();
        debug!("publishing to {topic}: {text}");
        if let Err(err) = publisher.publish(topic, text.as_bytes()) {
            self.publisher = None;
            return Err(err);
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<Message>, Error> {
        if let Some(msg) = self.queued.pop_front() {
            return Ok(Some(msg));
        }

        if self.wants_ops && self.subscriber.is_none() {
            self.establish()?;
            if let Some(msg) = self.queued.pop_front() {
                return Ok(Some(msg));
            }
        }

        if let Some(publisher) = self.publisher.as_mut()
            && publisher.last_activity.elapsed() >= self.keep_alive
            && publisher.ping().is_err()
        {
            self.publisher = None;
        }

        let Some(subscriber) = self.subscriber.as_mut() else {
            return Ok(None);
        };
        if subscriber.last_activity.elapsed() >= self.keep_alive
            && subscriber.ping().is_err()
        {
            self.subscriber = None;
            return Ok(None);
        }

        let Some(subscriber) = self.subscriber.as_mut() else {
            return Ok(None);
        };
        match subscriber.poll() {
            Ok(Some(publish)) => Ok(Some(self.message_from(publish))),
            Ok(None) => Ok(None),
            Err(Error::ConnectionClosed) => {
                warn!("subscriber session dropped");
                self.subscriber = None;
                Ok(None)
            }
            Err(err) => {
                self.subscriber = None;
                Err(err)
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

impl<N: Connect> fmt::Debug for MqttTransport<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttTransport")
            .field("remote", &self.remote)
            .field("publisher", &self.publisher.is_some())
            .field("subscriber", &self.subscriber.is_some())
            .finish_non_exhaustive()
    }
}

fn session_status(status: u8) -> Message {
    let mut msg = Message::of(Kind::Session);
    // status constants are always inside the partitioned ranges
    let _ = msg.set_code(status);
    msg
}

/// Encodes the variable-length remaining-length field.
fn encode_remaining_length(buf: &mut Vec<u8>, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if len == 0 {
            break;
        }
    }
}
