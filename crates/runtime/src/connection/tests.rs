use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::io::{DuplexStream, duplex};

use super::*;
use crate::codec::{self, JsValue};
use crate::remote_object::TypeRegistry;
use crate::transport::{PipeTransport, PipeTransportReceiver, PipeTransportSender};

/// Driver side of the pipes.
struct FakeDriver {
    tx: PipeTransportSender<DuplexStream>,
    rx: PipeTransportReceiver<DuplexStream>,
}

impl FakeDriver {
    async fn recv_raw(&mut self) -> Vec<u8> {
        self.rx.next_frame().await.unwrap().to_vec()
    }

    async fn recv(&mut self) -> Value {
        serde_json::from_slice(&self.recv_raw().await).unwrap()
    }

    async fn send(&mut self, message: Value) {
        self.send_raw(&serde_json::to_vec(&message).unwrap()).await;
    }

    async fn send_raw(&mut self, payload: &[u8]) {
        self.tx.send(payload).await.unwrap();
    }
}

fn create_test_connection_with(
    factory: TypeRegistry,
    options: ConnectionOptions,
) -> (Arc<Connection>, FakeDriver) {
    let (stdin_read, stdin_write) = duplex(64 * 1024);
    let (stdout_read, stdout_write) = duplex(64 * 1024);

    let parts = PipeTransport::new(stdin_write, stdout_read).into_transport_parts();
    let connection = Connection::with_options(parts, Arc::new(factory), options);

    let (tx, rx) = PipeTransport::new(stdout_write, stdin_read).into_parts();
    (connection, FakeDriver { tx, rx })
}

fn create_test_connection() -> (Arc<Connection>, FakeDriver) {
    create_test_connection_with(TypeRegistry::new(), ConnectionOptions::default())
}

fn create_message(parent: &str, type_name: &str, guid: &str) -> Value {
    json!({
        "guid": parent,
        "method": "__create__",
        "params": {"type": type_name, "guid": guid, "initializer": {"url": "about:blank"}},
    })
}

fn dispatch_json(connection: &Connection, message: Value) -> Result<()> {
    connection.dispatch(serde_json::from_value(message).unwrap())
}

/// Root -> Browser "browser@1" -> Page "page@1".
fn seed_objects(connection: &Connection) {
    dispatch_json(connection, create_message("", "Browser", "browser@1")).unwrap();
    dispatch_json(connection, create_message("browser@1", "Page", "page@1")).unwrap();
}

#[tokio::test]
async fn test_request_ids_start_at_one_and_increase() {
    let (connection, mut driver) = create_test_connection();

    let conn = Arc::clone(&connection);
    let client = tokio::spawn(async move {
        for _ in 0..3 {
            conn.send_message("", "ping", Value::Null).await.unwrap();
        }
    });

    for expected in 1..=3u32 {
        let request = driver.recv().await;
        assert_eq!(request["id"], expected);
        assert_eq!(request["params"], json!({}));
        driver.send(json!({"id": expected, "result": {}})).await;
    }

    client.await.unwrap();
    assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test]
async fn test_call_frame_shape() {
    let (connection, mut driver) = create_test_connection();
    connection.last_id.store(6, Ordering::SeqCst);

    let conn = Arc::clone(&connection);
    let call = tokio::spawn(async move {
        conn.send_message("page@1", "click", json!({"selector": "text=Go"}))
            .await
    });

    let frame = driver.recv_raw().await;
    assert_eq!(
        String::from_utf8(frame).unwrap(),
        r#"{"id":7,"guid":"page@1","method":"click","params":{"selector":"text=Go"}}"#
    );
    driver.send_raw(br#"{"id":7,"result":{}}"#).await;

    assert_eq!(call.await.unwrap().unwrap(), json!({}));
}

#[tokio::test]
async fn test_metadata_attached_when_enabled() {
    let (connection, mut driver) = create_test_connection_with(
        TypeRegistry::new(),
        ConnectionOptions {
            attach_metadata: true,
        },
    );

    let conn = Arc::clone(&connection);
    let call = tokio::spawn(async move { conn.send_message("", "ping", json!({})).await });

    let request = driver.recv().await;
    assert!(request["metadata"]["wallTime"].is_i64());
    driver.send(json!({"id": request["id"], "result": {"pong": true}})).await;

    assert_eq!(call.await.unwrap().unwrap()["pong"], true);
}

#[tokio::test]
async fn test_out_of_order_replies_reach_their_callers() {
    let (connection, mut driver) = create_test_connection();

    let calls: Vec<_> = (0..5)
        .map(|n| {
            let conn = Arc::clone(&connection);
            tokio::spawn(async move { conn.send_message("", "echo", json!({"n": n})).await })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..5 {
        requests.push(driver.recv().await);
    }
    for request in requests.iter().rev() {
        driver
            .send(json!({"id": request["id"], "result": {"n": request["params"]["n"]}}))
            .await;
    }

    for (n, call) in calls.into_iter().enumerate() {
        let result = call.await.unwrap().unwrap();
        assert_eq!(result["n"], n);
    }
    assert_eq!(connection.pending_calls(), 0);
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn test_remote_error_is_local_to_the_call() {
    let (connection, mut driver) = create_test_connection();

    let conn = Arc::clone(&connection);
    let call = tokio::spawn(async move { conn.send_message("", "waitForSelector", json!({})).await });

    let request = driver.recv().await;
    driver
        .send(json!({
            "id": request["id"],
            "error": {"error": {
                "message": "Timeout 30000ms exceeded",
                "name": "TimeoutError",
                "stack": "TimeoutError: Timeout 30000ms exceeded\n    at frames.ts:1"
            }}
        }))
        .await;

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.error_name(), Some("TimeoutError"));
    match err {
        Error::Remote { message, stack, .. } => {
            assert_eq!(message, "Timeout 30000ms exceeded");
            assert!(stack.unwrap().contains("frames.ts"));
        }
        other => panic!("Expected Remote error, got {other:?}"),
    }

    // The connection survives a remote error.
    let conn = Arc::clone(&connection);
    let call = tokio::spawn(async move { conn.send_message("", "ping", json!({})).await });
    let request = driver.recv().await;
    driver.send(json!({"id": request["id"]})).await;
    assert_eq!(call.await.unwrap().unwrap(), Value::Null);
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn test_flat_remote_error_leaves_other_calls_alone() {
    let (connection, mut driver) = create_test_connection();

    let conn = Arc::clone(&connection);
    let failing = tokio::spawn(async move { conn.send_message("", "boom", json!({})).await });
    let first = driver.recv().await;

    let conn = Arc::clone(&connection);
    let pending = tokio::spawn(async move { conn.send_message("", "ok", json!({})).await });
    let second = driver.recv().await;

    driver
        .send(json!({"id": first["id"], "error": {"message": "boom"}}))
        .await;
    driver
        .send(json!({"id": second["id"], "result": {"ok": true}}))
        .await;

    match failing.await.unwrap() {
        Err(Error::Remote { name, message, stack }) => {
            assert_eq!(name, "Error");
            assert_eq!(message, "boom");
            assert!(stack.is_none());
        }
        other => panic!("Expected Remote error, got {other:?}"),
    }
    assert_eq!(pending.await.unwrap().unwrap()["ok"], true);
    assert!(!connection.is_closed());
    assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test]
async fn test_request_ids_never_wrap() {
    let (connection, mut driver) = create_test_connection();
    connection.last_id.store(u32::MAX - 1, Ordering::SeqCst);

    let conn = Arc::clone(&connection);
    let last = tokio::spawn(async move { conn.send_message("", "ping", json!({})).await });
    let request = driver.recv().await;
    assert_eq!(request["id"], u32::MAX);
    driver.send(json!({"id": request["id"], "result": {}})).await;
    last.await.unwrap().unwrap();

    let err = connection
        .send_message("", "ping", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProtocolError(msg) if msg.contains("exhausted")));
    assert!(connection.is_closed());
    assert_eq!(connection.last_id.load(Ordering::SeqCst), u32::MAX);
}

#[tokio::test]
async fn test_reply_to_unknown_id_terminates() {
    let (connection, mut driver) = create_test_connection();

    let conn = Arc::clone(&connection);
    let call = tokio::spawn(async move { conn.send_message("", "ping", json!({})).await });

    driver.recv().await;
    driver.send(json!({"id": 99, "result": {}})).await;

    match call.await.unwrap() {
        Err(Error::ConnectionClosed(reason)) => {
            assert!(reason.contains("Cannot find request to respond"));
        }
        other => panic!("Expected ConnectionClosed, got {other:?}"),
    }
    assert!(connection.is_closed());
    assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test]
async fn test_create_and_dispose_lifecycle() {
    let (connection, _driver) = create_test_connection();
    assert_eq!(connection.object_count(), 1);

    seed_objects(&connection);
    assert_eq!(connection.object_count(), 3);

    let browser = connection.get_existing_object("browser@1").unwrap();
    let page = connection.get_existing_object("page@1").unwrap();
    assert_eq!(page.type_name(), "Page");
    assert_eq!(page.initializer()["url"], "about:blank");
    assert_eq!(page.parent().unwrap().guid(), "browser@1");
    assert_eq!(browser.parent().unwrap().guid(), ROOT_GUID);
    assert_eq!(browser.children().len(), 1);
    assert_eq!(connection.root().unwrap().children().len(), 1);

    dispatch_json(
        &connection,
        json!({"guid": "browser@1", "method": "__dispose__", "params": {}}),
    )
    .unwrap();

    assert_eq!(connection.object_count(), 1);
    assert!(browser.is_disposed());
    assert!(page.is_disposed());
    assert!(!page.was_collected());
    assert!(connection.root().unwrap().children().is_empty());
    assert!(matches!(
        connection.get_existing_object("page@1"),
        Err(Error::ObjectNotFound { .. })
    ));
}

#[tokio::test]
async fn test_duplicate_create_is_protocol_error() {
    let (connection, _driver) = create_test_connection();
    seed_objects(&connection);

    let result = dispatch_json(&connection, create_message("", "Browser", "browser@1"));
    assert!(matches!(result, Err(Error::ProtocolError(msg)) if msg.contains("already exists")));
}

#[tokio::test]
async fn test_create_under_unknown_parent_is_protocol_error() {
    let (connection, _driver) = create_test_connection();

    let result = dispatch_json(&connection, create_message("browser@9", "Page", "page@1"));
    assert!(matches!(result, Err(Error::ProtocolError(_))));
    assert_eq!(connection.object_count(), 1);
}

#[tokio::test]
async fn test_event_for_unknown_guid_is_protocol_error() {
    let (connection, _driver) = create_test_connection();

    let result = dispatch_json(
        &connection,
        json!({"guid": "page@404", "method": "console", "params": {}}),
    );
    assert!(matches!(result, Err(Error::ProtocolError(_))));
}

#[tokio::test]
async fn test_inbound_call_is_protocol_error() {
    let (connection, _driver) = create_test_connection();

    let result = dispatch_json(
        &connection,
        json!({"id": 1, "guid": "", "method": "initialize", "params": {}}),
    );
    assert!(matches!(result, Err(Error::ProtocolError(_))));
}

#[tokio::test]
async fn test_strict_registry_rejects_unknown_type() {
    let (connection, _driver) =
        create_test_connection_with(TypeRegistry::strict(), ConnectionOptions::default());

    let result = dispatch_json(&connection, create_message("", "Browser", "browser@1"));
    assert!(
        matches!(result, Err(Error::ProtocolError(msg)) if msg.contains("Unknown protocol object type"))
    );
}

#[tokio::test]
async fn test_registered_constructor_is_used() {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);
    let registry = TypeRegistry::new().register("Page", move |parent, type_name, guid, init| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(RemoteObject::new(parent, type_name, guid, init)) as Arc<dyn ChannelOwner>)
    });
    let (connection, _driver) = create_test_connection_with(registry, ConnectionOptions::default());

    seed_objects(&connection);
    assert_eq!(created.load(Ordering::SeqCst), 1);

    let page = connection.get_existing_object("page@1").unwrap();
    assert!(page.downcast_arc::<RemoteObject>().is_ok());
}

#[tokio::test]
async fn test_dispose_fails_waiters() {
    let (connection, _driver) = create_test_connection();
    seed_objects(&connection);

    let page = connection.get_existing_object("page@1").unwrap();
    let waiter = page.wait_for_event("close");

    dispatch_json(
        &connection,
        json!({"guid": "page@1", "method": "__dispose__", "params": {"reason": "gc"}}),
    )
    .unwrap();

    assert!(matches!(waiter.get().await, Err(Error::Disposed { guid }) if guid == "page@1"));
    assert!(page.was_collected());

    let late = page.wait_for_event("close");
    assert!(matches!(late.get().await, Err(Error::Disposed { .. })));
}

#[tokio::test]
async fn test_event_waiters_fan_out() {
    let (connection, mut driver) = create_test_connection();
    seed_objects(&connection);
    let page = connection.get_existing_object("page@1").unwrap();

    let first = page.wait_for_event("popup");
    let second = page.wait_for_event("popup");

    driver
        .send(json!({"guid": "page@1", "method": "popup", "params": {"page": {"guid": "page@2"}}}))
        .await;

    let a = first.get().await.unwrap();
    let b = second.get().await.unwrap();
    assert_eq!(a, b);
    assert_eq!(a["page"]["guid"], "page@2");

    // A waiter registered after the event waits for the next occurrence.
    let third = page.wait_for_event("popup");
    driver
        .send(json!({"guid": "page@1", "method": "popup", "params": {"page": {"guid": "page@3"}}}))
        .await;
    assert_eq!(third.get().await.unwrap()["page"]["guid"], "page@3");
}

#[tokio::test]
async fn test_event_dispatched_while_call_pending() {
    let (connection, mut driver) = create_test_connection();
    seed_objects(&connection);
    let page = connection.get_existing_object("page@1").unwrap();
    let popup = page.wait_for_event("popup");

    let channel = page.channel().clone();
    let call = tokio::spawn(async move { channel.call("click", json!({"selector": "a"})).await });

    let request = driver.recv().await;
    assert_eq!(request["guid"], "page@1");
    driver
        .send(json!({"guid": "page@1", "method": "__create__",
            "params": {"type": "Page", "guid": "page@2", "initializer": {}}}))
        .await;
    driver
        .send(json!({"guid": "page@1", "method": "popup", "params": {"page": {"guid": "page@2"}}}))
        .await;
    driver.send(json!({"id": request["id"], "result": {}})).await;

    call.await.unwrap().unwrap();

    // Both frames were dispatched by the call's pump, in order.
    let params = popup.get().await.unwrap();
    let guid = params["page"]["guid"].as_str().unwrap();
    let popup_page = connection.get_existing_object(guid).unwrap();
    assert_eq!(popup_page.parent().unwrap().guid(), "page@1");
}

#[tokio::test]
async fn test_waiter_timeout() {
    let (connection, _driver) = create_test_connection();
    seed_objects(&connection);
    let page = connection.get_existing_object("page@1").unwrap();

    let err = page
        .wait_for_event("download")
        .get_timeout(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn test_transport_eof_fails_everything_once() {
    let (connection, mut driver) = create_test_connection();
    seed_objects(&connection);
    let page = connection.get_existing_object("page@1").unwrap();
    let waiter = page.wait_for_event("close");

    let conn = Arc::clone(&connection);
    let call = tokio::spawn(async move { conn.send_message("page@1", "goto", json!({})).await });

    driver.recv().await;
    drop(driver);

    assert!(matches!(call.await.unwrap(), Err(Error::ConnectionClosed(_))));
    assert!(matches!(waiter.get().await, Err(Error::ConnectionClosed(_))));
    assert!(connection.is_closed());
    assert_eq!(connection.object_count(), 0);
    assert!(page.is_disposed());

    assert!(matches!(
        connection.send_message("", "ping", json!({})).await,
        Err(Error::ConnectionClosed(_))
    ));
    // New waits report the closed connection, not a disposed object.
    assert!(matches!(
        page.wait_for_event("close").get().await,
        Err(Error::ConnectionClosed(_))
    ));
}

#[tokio::test]
async fn test_abandoned_call_reply_is_consumed() {
    let (connection, mut driver) = create_test_connection();

    let conn = Arc::clone(&connection);
    let abandoned = tokio::spawn(async move { conn.send_message("", "slow", json!({})).await });
    let first = driver.recv().await;
    abandoned.abort();
    assert!(abandoned.await.unwrap_err().is_cancelled());

    driver.send(json!({"id": first["id"], "result": {}})).await;

    let conn = Arc::clone(&connection);
    let call = tokio::spawn(async move { conn.send_message("", "fast", json!({})).await });
    let second = driver.recv().await;
    driver.send(json!({"id": second["id"], "result": {"ok": true}})).await;

    assert_eq!(call.await.unwrap().unwrap()["ok"], true);
    assert!(!connection.is_closed());
    assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test]
async fn test_wait_for_object() {
    let (connection, mut driver) = create_test_connection();

    driver
        .send(json!({"guid": "", "method": "__create__",
            "params": {"type": "Playwright", "guid": "Playwright", "initializer": {}}}))
        .await;

    let playwright = connection.wait_for_object("Playwright").await.unwrap();
    assert_eq!(playwright.type_name(), "Playwright");
}

#[tokio::test]
async fn test_malformed_frame_terminates() {
    let (connection, mut driver) = create_test_connection();

    driver.send_raw(b"not json").await;

    assert!(matches!(connection.run().await, Err(Error::ProtocolError(_))));
    assert!(connection.is_closed());
}

#[tokio::test]
async fn test_close_from_client() {
    let (connection, _driver) = create_test_connection();
    seed_objects(&connection);
    let page = connection.get_existing_object("page@1").unwrap();
    let waiter = page.wait_for_event("close");

    connection.close().await.unwrap();

    assert!(connection.run().await.is_ok());
    assert!(matches!(waiter.get().await, Err(Error::ConnectionClosed(_))));
    assert!(matches!(
        connection.send_message("", "ping", json!({})).await,
        Err(Error::ConnectionClosed(_))
    ));
    match page.wait_for_event("load").get().await {
        Err(Error::ConnectionClosed(reason)) => assert!(reason.contains("closed by client")),
        other => panic!("Expected ConnectionClosed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handle_round_trip_through_registry() {
    let (connection, _driver) = create_test_connection();
    seed_objects(&connection);
    let page = connection.get_existing_object("page@1").unwrap();

    let value = JsValue::Object(vec![
        ("target".into(), JsValue::Handle(Arc::clone(&page))),
        ("n".into(), JsValue::Number(-0.0)),
    ]);
    let arg = codec::encode(&value).unwrap();
    assert_eq!(arg.handles.len(), 1);
    assert_eq!(arg.handles[0].guid, "page@1");
    assert_eq!(
        serde_json::to_value(&arg).unwrap()["value"],
        json!({"o": [{"k": "target", "v": {"h": 0}}, {"k": "n", "v": {"v": "-0"}}]})
    );

    let decoded = codec::decode(&arg, &*connection).unwrap();
    assert_eq!(decoded, value);
    assert_eq!(decoded.get("target").unwrap().as_handle().unwrap().guid(), "page@1");

    dispatch_json(
        &connection,
        json!({"guid": "page@1", "method": "__dispose__"}),
    )
    .unwrap();
    assert!(matches!(
        codec::decode(&arg, &*connection),
        Err(Error::ObjectNotFound { .. })
    ));
    assert!(matches!(
        codec::encode(&value),
        Err(Error::UnsupportedValue(_))
    ));
}
