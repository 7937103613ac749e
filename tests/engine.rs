//! Engine dispatch, session state and path derivation tests.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use cloudlink::message::{Kind, Message, code};
use cloudlink::{CompletionStatus, Engine, Error, HandlerRef, OperationHandler, ReplyHandler};
use common::MockTransport;
use serde_json::{Value, json};

/// Records every capability invocation; `fail_ops` makes the operation
/// capabilities fail so the error path can be exercised.
#[derive(Default)]
struct RecordingHandler {
    acks: Mutex<Vec<Option<Value>>>,
    errors: Mutex<Vec<String>>,
    ops: Mutex<Vec<u8>>,
    connected: AtomicUsize,
    stop: AtomicBool,
    fail_ops: bool,
}

impl ReplyHandler for RecordingHandler {
    fn ack(&self, payload: Option<&Value>) -> Result<(), Error> {
        self.acks.lock().unwrap().push(payload.cloned());
        Ok(())
    }

    fn on_exception(&self, err: &Error) {
        self.errors.lock().unwrap().push(err.to_string());
    }

    fn shutdown(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

impl OperationHandler for RecordingHandler {
    fn connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn read(&self, _request: Option<&Value>) -> Result<Value, Error> {
        if self.fail_ops {
            return Err(Error::Handler("boom".into()));
        }
        Ok(json!({"n": "temp", "v": 23.5}))
    }

    fn write(&self, _request: Option<&Value>, op: u8) -> Result<CompletionStatus, Error> {
        if self.fail_ops {
            return Err(Error::Handler("boom".into()));
        }
        self.ops.lock().unwrap().push(op);
        Ok(CompletionStatus::Success)
    }

    fn exec(&self, _request: Option<&Value>) -> Result<CompletionStatus, Error> {
        if self.fail_ops {
            return Err(Error::Handler("boom".into()));
        }
        Ok(CompletionStatus::Success)
    }
}

fn request(op: u8, mid: u32, path: &str) -> Message {
    let mut msg = Message::new(Kind::Session, Some(path.to_string()), Some(json!({"n": "x"})));
    msg.set_code(op).unwrap();
    msg.set_mid(mid);
    msg
}

fn status(status_code: u8) -> Message {
    let mut msg = Message::of(Kind::Session);
    msg.set_code(status_code).unwrap();
    msg
}

#[test]
fn request_without_handler_gets_forbidden_reply() {
    let _ = env_logger::builder().is_test(true).try_init();

    let transport = MockTransport::new(true);
    let sent = transport.sent();
    let engine = Engine::new(transport, "dev-1", "tok").unwrap();

    engine
        .inbound(request(code::READ, 7, "/api/v1/mo/dev-1/att"))
        .unwrap();

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let reply = &sent[0];
    assert_eq!(reply.code(), code::FORBIDDEN);
    assert_eq!(reply.mid(), Some(7));
    assert_eq!(reply.path(), Some("/api/v1/mo/dev-1/ack"));
    let payload = reply.payload().unwrap();
    assert_eq!(payload["mid"], json!(7));
    assert!(payload["err"].as_str().unwrap().contains("dev-1"));
}

#[test]
fn read_request_invokes_handler_and_replies() {
    let transport = MockTransport::new(true);
    let sent = transport.sent();
    let engine = Engine::new(transport, "dev-1", "tok").unwrap();
    engine.set_handler(HandlerRef::Operation(Arc::new(RecordingHandler::default())));

    engine
        .inbound(request(code::READ, 3, "/api/v1/mo/dev-1/att"))
        .unwrap();

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].code(), code::ACK);
    let payload = sent[0].payload().unwrap();
    assert_eq!(payload["n"], json!("temp"));
    assert_eq!(payload["mid"], json!(3));
}

#[test]
fn write_family_reports_completion_and_op_byte() {
    let transport = MockTransport::new(true);
    let sent = transport.sent();
    let engine = Engine::new(transport, "dev-1", "tok").unwrap();
    let handler = Arc::new(RecordingHandler::default());
    engine.set_handler(HandlerRef::Operation(handler.clone()));

    engine
        .inbound(request(code::UPDATE, 4, "/api/v1/mo/dev-1/att"))
        .unwrap();

    assert_eq!(*handler.ops.lock().unwrap(), vec![code::UPDATE]);
    let sent = sent.lock().unwrap();
    let payload = sent[0].payload().unwrap();
    assert_eq!(payload["status"], json!("SUCCESS"));
    assert_eq!(payload["mid"], json!(4));
}

#[test]
fn trigger_svc_request_is_answered_on_the_ack_path() {
    let transport = MockTransport::new(true);
    let sent = transport.sent();
    let engine = Engine::new(transport, "dev-1", "tok").unwrap();
    engine.set_handler(HandlerRef::Operation(Arc::new(RecordingHandler::default())));

    engine
        .inbound(request(code::EXEC, 9, "/api/v1/icapp/app42/svc/button"))
        .unwrap();

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind(), Kind::Trigger);
    assert_eq!(sent[0].path(), Some("/api/v1/icapp/app42/ack/button"));
    assert_eq!(sent[0].mid(), Some(9));
    assert_eq!(sent[0].payload().unwrap()["status"], json!("SUCCESS"));
}

#[test]
fn session_establishes_once_and_notifies_connected() {
    let transport = MockTransport::new(false);
    let engine = Engine::new(transport, "dev-1", "tok").unwrap();
    let handler = Arc::new(RecordingHandler::default());
    engine.set_handler(HandlerRef::Operation(handler.clone()));

    // first success-class message flips Establishing -> Ready
    engine.inbound(status(code::ACK)).unwrap();
    // the second is an ordinary reply
    let mut reply = status(code::ACK);
    reply.set_payload(json!({"ok": true}));
    engine.inbound(reply).unwrap();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(handler.connected.load(Ordering::SeqCst), 1);
    assert_eq!(handler.acks.lock().unwrap().len(), 1);
}

#[test]
fn non_success_while_establishing_is_fatal() {
    let transport = MockTransport::new(false);
    let engine = Engine::new(transport, "dev-1", "tok").unwrap();
    let handler = Arc::new(RecordingHandler::default());
    engine.set_handler(HandlerRef::Ack(handler.clone()));

    let result = engine.inbound(status(code::FORBIDDEN));
    assert!(matches!(result, Err(Error::SessionRejected)));
    assert_eq!(handler.errors.lock().unwrap().len(), 1);
}

#[test]
fn handler_failure_sends_internal_error_reply() {
    let transport = MockTransport::new(true);
    let sent = transport.sent();
    let engine = Engine::new(transport, "dev-1", "tok").unwrap();
    let handler = Arc::new(RecordingHandler {
        fail_ops: true,
        ..RecordingHandler::default()
    });
    engine.set_handler(HandlerRef::Operation(handler.clone()));

    engine
        .inbound(request(code::EXEC, 5, "/api/v1/mo/dev-1/att"))
        .unwrap();

    assert!(!handler.errors.lock().unwrap().is_empty());
    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].code(), code::INTERNAL_ERROR);
    let payload = sent[0].payload().unwrap();
    assert!(payload["msg"].as_str().unwrap().contains("boom"));
    assert_eq!(payload["mid"], json!(5));
}

#[test]
fn outbound_stamps_sequence_token_and_paths() {
    let transport = MockTransport::new(true);
    let sent = transport.sent();
    let engine = Engine::new(transport, "dev-1", "tok").unwrap();

    let mut trigger = Message::trigger("abc", json!({"a": 1}));
    engine.outbound(code::EXEC, &mut trigger).unwrap();

    let mut attr = Message::new(Kind::Attribute, Some("cfg".into()), Some(json!({})));
    engine.outbound(code::WRITE, &mut attr).unwrap();

    let mut api = Message::new(Kind::Api, Some("users/list".into()), None);
    engine.outbound(code::READ, &mut api).unwrap();

    let sent = sent.lock().unwrap();
    assert_eq!(sent[0].mid(), Some(1));
    assert_eq!(sent[0].code(), code::EXEC);
    assert_eq!(sent[0].path(), Some("/api/v1/icapp/abc"));
    assert_eq!(sent[0].token(), Some("tok"));
    assert_eq!(sent[0].app_id(), Some("dev-1"));

    assert_eq!(sent[1].mid(), Some(2));
    assert_eq!(sent[1].path(), Some("/api/v1/mo/dev-1/att/cfg"));

    assert_eq!(sent[2].mid(), Some(3));
    assert_eq!(sent[2].path(), Some("/api/v1/agw/users/list"));
}

#[test]
fn outbound_rejects_invalid_codes() {
    let transport = MockTransport::new(true);
    let engine = Engine::new(transport, "dev-1", "tok").unwrap();
    let mut msg = Message::trigger("abc", json!({}));
    assert!(matches!(
        engine.outbound(0xC1, &mut msg),
        Err(Error::InvalidCode(0xC1))
    ));
}

#[test]
fn poll_delivers_scripted_inbound() {
    let mut transport = MockTransport::new(true);
    let sent = transport.sent();
    transport.push_inbound(request(code::READ, 1, "/api/v1/mo/dev-1/att"));
    let engine = Engine::new(transport, "dev-1", "tok").unwrap();

    assert!(engine.poll().unwrap());
    assert!(!engine.poll().unwrap());
    // the scripted request was answered (FORBIDDEN, no handler)
    assert_eq!(sent.lock().unwrap().len(), 1);
}

#[test]
fn run_stops_when_handler_requests_shutdown() {
    let transport = MockTransport::new(true);
    let engine = Engine::new(transport, "dev-1", "tok").unwrap();
    let handler = Arc::new(RecordingHandler::default());
    handler.stop.store(true, Ordering::Relaxed);
    engine.set_handler(HandlerRef::Ack(handler));

    engine.run().unwrap();
}

#[test]
fn constructor_and_setters_validate_arguments() {
    assert!(matches!(
        Engine::new(MockTransport::new(true), "", "tok"),
        Err(Error::EmptyArgument(_))
    ));
    assert!(matches!(
        Engine::new(MockTransport::new(true), "dev-1", ""),
        Err(Error::EmptyArgument(_))
    ));

    let engine = Engine::new(MockTransport::new(true), "dev-1", "tok").unwrap();
    assert!(matches!(engine.set_token(""), Err(Error::EmptyArgument(_))));
    assert!(matches!(engine.set_app_id(""), Err(Error::EmptyArgument(_))));
    engine.set_token("tok2").unwrap();
    engine.set_app_id("dev-2").unwrap();
}
