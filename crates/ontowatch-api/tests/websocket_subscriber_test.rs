#![allow(clippy::unwrap_used)]
// Integration tests for the multiplexed `WebSocketSubscriber` against a
// local tokio-tungstenite server.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use common::{Event, assert_quiet, context, fast_reconnect, next_event, recorder};
use ontowatch_api::{
    ErrorCause, FeedOptions, ObjectSetSubscriber, ObjectTypeRef, PrimaryKey, ReconnectConfig,
    StreamTransport, SubscribeSpec, WebSocketSubscriber,
};

// ── Fake server ─────────────────────────────────────────────────────

/// One accepted client connection.
struct Connection {
    protocol: String,
    incoming: mpsc::UnboundedReceiver<Value>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl Connection {
    async fn next_request(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.incoming.recv())
            .await
            .expect("timed out waiting for subscribe message")
            .expect("client disconnected")
    }

    fn send(&self, message: &Value) {
        self.outgoing.send(Message::text(message.to_string())).unwrap();
    }

    fn respond(&self, request: &Value, responses: &[Value]) {
        self.send(&json!({
            "type": "subscribeResponses",
            "id": request["id"],
            "responses": responses,
        }));
    }

    fn close(&self) {
        self.outgoing.send(Message::Close(None)).unwrap();
    }

    /// Waits until the client closes the socket.
    async fn closed(&mut self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.incoming.recv().await.is_some() {}
        })
        .await
        .expect("client kept the socket open");
    }
}

async fn spawn_server() -> (String, mpsc::UnboundedReceiver<Connection>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let conn_tx = conn_tx.clone();
            tokio::spawn(async move {
                let seen = Arc::new(Mutex::new(String::new()));
                let record = Arc::clone(&seen);
                let callback = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                    if let Some(protocol) = req.headers().get("sec-websocket-protocol") {
                        *record.lock().unwrap() = protocol.to_str().unwrap().to_owned();
                        resp.headers_mut()
                            .insert("sec-websocket-protocol", protocol.clone());
                    }
                    Ok(resp)
                };
                let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                    .await
                    .unwrap();
                let (mut write, mut read) = ws.split();
                let (in_tx, in_rx) = mpsc::unbounded_channel();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
                let protocol = seen.lock().unwrap().clone();
                let _ = conn_tx.send(Connection {
                    protocol,
                    incoming: in_rx,
                    outgoing: out_tx,
                });

                loop {
                    tokio::select! {
                        frame = read.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                let _ = in_tx.send(serde_json::from_str::<Value>(&text).unwrap());
                            }
                            Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                        out = out_rx.recv() => match out {
                            Some(message) => {
                                let closing = matches!(message, Message::Close(_));
                                if write.send(message).await.is_err() || closing {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
        }
    });

    (format!("http://{addr}/"), conn_rx)
}

async fn next_connection(rx: &mut mpsc::UnboundedReceiver<Connection>) -> Connection {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for connection")
        .unwrap()
}

fn subscriber(base: &str) -> WebSocketSubscriber {
    let options = FeedOptions {
        transport: StreamTransport::WebSocket,
        reconnect: fast_reconnect(),
        teardown_grace: Duration::from_millis(100),
        ..FeedOptions::default()
    };
    WebSocketSubscriber::spawn(context(base), &options)
}

fn todo_spec() -> SubscribeSpec {
    SubscribeSpec::base(ObjectTypeRef::object("Todo"))
}

fn filtered_spec(body: &str) -> SubscribeSpec {
    todo_spec().with_object_set(json!({
        "type": "filter",
        "objectSet": {"type": "base", "objectType": "Todo"},
        "where": {"type": "eq", "field": "body", "value": body}
    }))
}

fn success(id: &str) -> Value {
    json!({"type": "success", "id": id})
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn multiplexes_subscriptions_over_one_socket() {
    let (base, mut conns) = spawn_server().await;
    let feed = subscriber(&base);

    let (listener_a, mut events_a) = recorder();
    let handle_a = feed.subscribe(todo_spec(), listener_a).await.unwrap();

    let mut conn = next_connection(&mut conns).await;
    assert_eq!(conn.protocol, "Bearer-secret-token");
    let first = conn.next_request().await;
    assert_eq!(first["requests"].as_array().unwrap().len(), 1);
    conn.respond(&first, &[success("s-a")]);
    assert_eq!(next_event(&mut events_a).await, Event::Subscribed);

    let (listener_b, mut events_b) = recorder();
    let handle_b = feed.subscribe(filtered_spec("x"), listener_b).await.unwrap();

    // Every subscribe message lists every live subscription.
    let second = conn.next_request().await;
    assert_eq!(second["requests"].as_array().unwrap().len(), 2);
    assert_eq!(second["requests"][1]["objectSet"]["type"], "filter");
    conn.respond(&second, &[success("s-a"), success("s-b")]);
    assert_eq!(next_event(&mut events_b).await, Event::Subscribed);

    conn.send(&json!({
        "type": "objectSetChanged",
        "id": "s-b",
        "updates": [{
            "type": "object",
            "state": "ADDED_OR_UPDATED",
            "object": {"__apiName": "Todo", "__primaryKey": 1, "id": 1, "body": "x"}
        }]
    }));
    assert_eq!(
        next_event(&mut events_b).await,
        Event::Change {
            pk: PrimaryKey::Integer(1),
            body: Some(json!("x")),
            removed: false,
        }
    );
    // A already subscribed: the second success is silent, and B's change is not A's.
    assert_quiet(&mut events_a).await;

    handle_a.unsubscribe();
    handle_b.unsubscribe();
    feed.shutdown();
}

#[tokio::test]
async fn superseded_responses_are_ignored() {
    let (base, mut conns) = spawn_server().await;
    let feed = subscriber(&base);

    let (listener_a, mut events_a) = recorder();
    let _a = feed.subscribe(todo_spec(), listener_a).await.unwrap();
    let mut conn = next_connection(&mut conns).await;
    let first = conn.next_request().await;

    let (listener_b, mut events_b) = recorder();
    let _b = feed.subscribe(filtered_spec("y"), listener_b).await.unwrap();
    let second = conn.next_request().await;

    // The stale response for the first request must not be routed.
    conn.respond(&first, &[success("s-old")]);
    assert_quiet(&mut events_a).await;

    conn.respond(&second, &[success("s-a"), success("s-b")]);
    assert_eq!(next_event(&mut events_a).await, Event::Subscribed);
    assert_eq!(next_event(&mut events_b).await, Event::Subscribed);

    conn.send(&json!({"type": "refreshObjectSet", "id": "s-old", "objectType": "Todo"}));
    assert_quiet(&mut events_a).await;

    feed.shutdown();
}

#[tokio::test]
async fn reconnect_resubscribes_and_reports_out_of_date() {
    let (base, mut conns) = spawn_server().await;
    let feed = subscriber(&base);

    let (listener, mut events) = recorder();
    let _handle = feed.subscribe(todo_spec(), listener).await.unwrap();

    let conn = {
        let mut conn = next_connection(&mut conns).await;
        let request = conn.next_request().await;
        conn.respond(&request, &[success("s-1")]);
        conn
    };
    assert_eq!(next_event(&mut events).await, Event::Subscribed);

    conn.close();

    let mut conn = next_connection(&mut conns).await;
    let request = conn.next_request().await;
    assert_eq!(request["requests"].as_array().unwrap().len(), 1);
    conn.respond(&request, &[success("s-2")]);
    assert_eq!(next_event(&mut events).await, Event::OutOfDate);

    // Messages for the new server id reach the same listener.
    conn.send(&json!({"type": "refreshObjectSet", "id": "s-2", "objectType": "Todo"}));
    assert_eq!(next_event(&mut events).await, Event::OutOfDate);

    feed.shutdown();
}

#[tokio::test]
async fn qos_cycles_the_socket() {
    let (base, mut conns) = spawn_server().await;
    let feed = subscriber(&base);

    let (listener_a, mut events_a) = recorder();
    let _a = feed.subscribe(todo_spec(), listener_a).await.unwrap();
    let mut conn = next_connection(&mut conns).await;
    let first = conn.next_request().await;
    conn.respond(&first, &[success("s-a")]);
    assert_eq!(next_event(&mut events_a).await, Event::Subscribed);

    let (listener_b, mut events_b) = recorder();
    let _b = feed.subscribe(filtered_spec("z"), listener_b).await.unwrap();
    let second = conn.next_request().await;
    conn.respond(&second, &[success("s-a"), json!({"type": "qos"})]);
    conn.closed().await;

    let mut conn = next_connection(&mut conns).await;
    let third = conn.next_request().await;
    assert_eq!(third["requests"].as_array().unwrap().len(), 2);
    conn.respond(&third, &[success("s-a2"), success("s-b2")]);

    assert_eq!(next_event(&mut events_a).await, Event::OutOfDate);
    assert_eq!(next_event(&mut events_b).await, Event::Subscribed);
    // QoS is never surfaced as an error.
    assert_quiet(&mut events_a).await;

    feed.shutdown();
}

#[tokio::test]
async fn subscription_closed_is_terminal_and_socket_idles_out() {
    let (base, mut conns) = spawn_server().await;
    let feed = subscriber(&base);

    let (listener, mut events) = recorder();
    let handle = feed.subscribe(todo_spec(), listener).await.unwrap();
    let mut conn = next_connection(&mut conns).await;
    let request = conn.next_request().await;
    conn.respond(&request, &[success("s-1")]);
    assert_eq!(next_event(&mut events).await, Event::Subscribed);

    conn.send(&json!({
        "type": "subscriptionClosed",
        "id": "s-1",
        "cause": {"reason": "SERVER_SHUTDOWN"}
    }));
    assert_eq!(
        next_event(&mut events).await,
        Event::Error {
            closed: true,
            cause: ErrorCause::Server(json!({"reason": "SERVER_SHUTDOWN"})),
        }
    );

    // The remaining (empty) set is resent, then the idle socket is closed.
    let resent = conn.next_request().await;
    assert_eq!(resent["requests"], json!([]));
    handle.unsubscribe();
    conn.closed().await;
    assert_quiet(&mut events).await;

    feed.shutdown();
}

#[tokio::test]
async fn unsubscribe_resends_remaining_set() {
    let (base, mut conns) = spawn_server().await;
    let feed = subscriber(&base);

    let (listener_a, mut events_a) = recorder();
    let handle_a = feed.subscribe(todo_spec(), listener_a).await.unwrap();
    let (listener_b, _events_b) = recorder();
    let _b = feed.subscribe(filtered_spec("q"), listener_b).await.unwrap();

    let mut conn = next_connection(&mut conns).await;
    let mut request = conn.next_request().await;
    // Both subscriptions may land in one message or two; wait for the full set.
    while request["requests"].as_array().unwrap().len() < 2 {
        request = conn.next_request().await;
    }
    conn.respond(&request, &[success("s-a"), success("s-b")]);
    assert_eq!(next_event(&mut events_a).await, Event::Subscribed);

    handle_a.unsubscribe();
    let remaining = conn.next_request().await;
    assert_eq!(remaining["requests"].as_array().unwrap().len(), 1);
    assert_eq!(remaining["requests"][0]["objectSet"]["type"], "filter");

    // No more deliveries to the unsubscribed listener.
    conn.send(&json!({"type": "refreshObjectSet", "id": "s-a", "objectType": "Todo"}));
    assert_quiet(&mut events_a).await;

    feed.shutdown();
}

#[tokio::test]
async fn subscribe_while_waiting_to_reconnect_joins_the_next_socket() {
    let (base, mut conns) = spawn_server().await;
    let options = FeedOptions {
        transport: StreamTransport::WebSocket,
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(300),
            max_retries: None,
        },
        teardown_grace: Duration::from_millis(100),
        ..FeedOptions::default()
    };
    let feed = WebSocketSubscriber::spawn(context(&base), &options);

    let (listener_a, mut events_a) = recorder();
    let _a = feed.subscribe(todo_spec(), listener_a).await.unwrap();
    let mut conn = next_connection(&mut conns).await;
    let request = conn.next_request().await;
    conn.respond(&request, &[success("s-a")]);
    assert_eq!(next_event(&mut events_a).await, Event::Subscribed);
    conn.close();

    // The actor is now sleeping before its next connect attempt.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (listener_b, mut events_b) = recorder();
    let _b = feed.subscribe(filtered_spec("late"), listener_b).await.unwrap();

    let mut conn = next_connection(&mut conns).await;
    let request = conn.next_request().await;
    assert_eq!(request["requests"].as_array().unwrap().len(), 2);
    conn.respond(&request, &[success("s-a2"), success("s-b")]);

    assert_eq!(next_event(&mut events_a).await, Event::OutOfDate);
    assert_eq!(next_event(&mut events_b).await, Event::Subscribed);

    feed.shutdown();
}
