//! Multiplexed change feed over a single WebSocket.
//!
//! One background task owns the socket and every subscription on it.
//! Callers talk to it through an unbounded command channel, so `subscribe`
//! and `unsubscribe` never block on the network.
//!
//! Every subscribe message carries the complete set of live subscriptions
//! under a fresh request id. Responses are matched back through `pending`,
//! and a subscription only honours the response to the newest request it
//! was part of. Responses from a dropped connection are discarded.
//!
//! ```no_run
//! # async fn demo(ctx: ontowatch_api::FeedContext, listener: std::sync::Arc<dyn ontowatch_api::ObjectSetListener>) -> Result<(), ontowatch_api::Error> {
//! use ontowatch_api::{FeedOptions, ObjectSetSubscriber, ObjectTypeRef, SubscribeSpec, WebSocketSubscriber};
//!
//! let feed = WebSocketSubscriber::spawn(ctx, &FeedOptions::default());
//! let handle = feed
//!     .subscribe(SubscribeSpec::base(ObjectTypeRef::object("Todo")), listener)
//!     .await?;
//! handle.unsubscribe();
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use strum::{AsRefStr, Display};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::backoff::ExponentialBackoff;
use crate::error::Error;
use crate::listener::{Delivery, ErrorCause, ListenerSlot, ObjectSetListener};
use crate::subscriber::{
    FeedContext, FeedOptions, ObjectSetSubscriber, ResolvedSubscription, SubscribeSpec,
    SubscriptionHandle,
};
use crate::transport::websocket_url;
use crate::wire::{StreamMessage, SubscribeRequests, SubscribeResponse, SubscribeResponses};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;

/// Lifecycle of one logical subscription on the shared socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Sent, never acknowledged.
    Preparing,
    Subscribed,
    /// Was subscribed; the connection was cycled deliberately or closed cleanly.
    Reconnecting,
    /// Was subscribed; the connection failed, so the server-side subscription is gone.
    Expired,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct LocalId(u64);

enum Command {
    Subscribe {
        id: LocalId,
        resolved: Box<ResolvedSubscription>,
        slot: Arc<ListenerSlot>,
    },
    Unsubscribe(LocalId),
}

// ── Public handle ────────────────────────────────────────────────────

pub struct WebSocketSubscriber {
    ctx: FeedContext,
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl WebSocketSubscriber {
    /// Spawn the connection task. The socket is opened lazily on the first
    /// subscription and closed after `teardown_grace` once the last one leaves.
    pub fn spawn(ctx: FeedContext, options: &FeedOptions) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let actor = Actor {
            ctx: ctx.clone(),
            backoff: ExponentialBackoff::new(options.reconnect.clone()),
            teardown_grace: options.teardown_grace,
            commands: rx,
            cancel: cancel.clone(),
            subs: HashMap::new(),
            server_ids: HashMap::new(),
            pending: HashMap::new(),
        };
        tokio::spawn(actor.run());

        Self {
            ctx,
            commands,
            next_id: AtomicU64::new(1),
            cancel,
        }
    }

    /// Close the socket and stop the background task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WebSocketSubscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl ObjectSetSubscriber for WebSocketSubscriber {
    fn subscribe(
        &self,
        spec: SubscribeSpec,
        listener: Arc<dyn ObjectSetListener>,
    ) -> BoxFuture<'_, Result<SubscriptionHandle, Error>> {
        Box::pin(async move {
            let resolved = ResolvedSubscription::resolve(&self.ctx, &spec).await?;
            let id = LocalId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let slot = ListenerSlot::new(listener);

            self.commands
                .send(Command::Subscribe {
                    id,
                    resolved: Box::new(resolved),
                    slot: Arc::clone(&slot),
                })
                .map_err(|_| Error::SubscriberClosed)?;

            let commands = self.commands.clone();
            Ok(SubscriptionHandle::new(move || {
                slot.close();
                let _ = commands.send(Command::Unsubscribe(id));
            }))
        })
    }
}

// ── Connection task ──────────────────────────────────────────────────

struct SubEntry {
    resolved: Box<ResolvedSubscription>,
    slot: Arc<ListenerSlot>,
    status: SubscriptionStatus,
    server_id: Option<String>,
    /// Newest subscribe request this subscription was part of.
    last_request: Option<String>,
}

/// How a connected session ended.
enum SessionEnd {
    Shutdown,
    /// No subscriptions left after the grace window.
    Idle,
    /// Server asked for a reconnect.
    Qos,
    Dropped(Option<Error>),
}

/// Follow-up required after handling one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Nothing,
    /// The subscription set changed; tell the server.
    Resubscribe,
    Cycle,
}

/// What woke a waiting loop.
enum Wake {
    Shutdown,
    Elapsed,
    Command(Command),
    Frame(Option<Result<Message, tungstenite::Error>>),
}

/// What woke the reconnect wait. There is no socket to read from here.
enum Pause {
    Shutdown,
    Elapsed,
    Command(Command),
}

struct Actor {
    ctx: FeedContext,
    backoff: ExponentialBackoff,
    teardown_grace: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    subs: HashMap<LocalId, SubEntry>,
    server_ids: HashMap<String, LocalId>,
    pending: HashMap<String, Vec<LocalId>>,
}

impl Actor {
    async fn run(mut self) {
        'outer: loop {
            if self.subs.is_empty() {
                let cmd = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => None,
                    cmd = self.commands.recv() => cmd,
                };
                match cmd {
                    Some(cmd) => self.apply_offline(cmd),
                    None => break,
                }
                continue;
            }

            let connected = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                result = connect(&self.ctx) => result,
            };

            match connected {
                Ok(ws) => match self.session(ws).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Idle => continue,
                    SessionEnd::Qos => {
                        tracing::info!("WebSocket qos, cycling connection");
                        self.mark_disconnected(SubscriptionStatus::Reconnecting);
                        continue;
                    }
                    SessionEnd::Dropped(None) => {
                        tracing::info!("WebSocket disconnected cleanly, reconnecting");
                        self.mark_disconnected(SubscriptionStatus::Reconnecting);
                    }
                    SessionEnd::Dropped(Some(e)) => {
                        tracing::warn!(error = %e, "WebSocket connection lost");
                        self.mark_disconnected(SubscriptionStatus::Expired);
                        self.notify_transport_error(&e);
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, attempt = self.backoff.attempt(), "WebSocket connect failed");
                    self.notify_transport_error(&e);
                }
            }

            if self.backoff.exhausted() {
                tracing::error!("WebSocket reconnection limit reached, closing subscriptions");
                let ids: Vec<LocalId> = self.subs.keys().copied().collect();
                for id in ids {
                    if let Some(entry) = self.remove(id, SubscriptionStatus::Error) {
                        let _ = entry.slot.error(
                            true,
                            ErrorCause::Transport("reconnection limit reached".into()),
                        );
                    }
                }
                self.backoff.reset();
                continue;
            }

            let delay = self.backoff.next_delay();
            tracing::info!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt = self.backoff.attempt(),
                "Waiting before reconnect"
            );
            let deadline = Instant::now() + delay;
            loop {
                let woke = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => Pause::Shutdown,
                    () = tokio::time::sleep_until(deadline) => Pause::Elapsed,
                    cmd = self.commands.recv() => cmd.map_or(Pause::Shutdown, Pause::Command),
                };
                match woke {
                    Pause::Shutdown => break 'outer,
                    Pause::Elapsed => break,
                    Pause::Command(cmd) => {
                        self.apply_offline(cmd);
                        if self.subs.is_empty() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!("WebSocket task exiting");
    }

    /// Apply a command while no socket is open.
    fn apply_offline(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { id, resolved, slot } => self.insert(id, resolved, slot),
            Command::Unsubscribe(id) => {
                self.remove(id, SubscriptionStatus::Done);
            }
        }
    }

    fn insert(&mut self, id: LocalId, resolved: Box<ResolvedSubscription>, slot: Arc<ListenerSlot>) {
        if slot.is_closed() {
            return;
        }
        self.subs.insert(
            id,
            SubEntry {
                resolved,
                slot,
                status: SubscriptionStatus::Preparing,
                server_id: None,
                last_request: None,
            },
        );
    }

    fn remove(&mut self, id: LocalId, status: SubscriptionStatus) -> Option<SubEntry> {
        let mut entry = self.subs.remove(&id)?;
        if let Some(server_id) = &entry.server_id {
            self.server_ids.remove(server_id);
        }
        entry.status = status;
        entry.slot.close();
        tracing::debug!(subscription = id.0, %status, "subscription removed");
        Some(entry)
    }

    fn mark_disconnected(&mut self, status: SubscriptionStatus) {
        self.pending.clear();
        self.server_ids.clear();
        for entry in self.subs.values_mut() {
            entry.server_id = None;
            entry.last_request = None;
            if matches!(
                entry.status,
                SubscriptionStatus::Subscribed | SubscriptionStatus::Reconnecting
            ) {
                entry.status = status;
            }
        }
    }

    fn notify_transport_error(&mut self, error: &Error) {
        let closed: Vec<LocalId> = self
            .subs
            .iter()
            .filter(|(_, entry)| {
                entry.slot.error(false, ErrorCause::Transport(error.to_string())) == Delivery::Close
            })
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            self.remove(id, SubscriptionStatus::Error);
        }
    }

    // ── Connected session ────────────────────────────────────────────

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        tracing::info!("WebSocket connected");
        let (mut write, mut read) = ws.split();

        if let Err(e) = self.send_subscribe(&mut write).await {
            return SessionEnd::Dropped(Some(e));
        }

        let mut teardown: Option<Instant> = None;
        loop {
            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Wake::Shutdown,
                cmd = self.commands.recv() => cmd.map_or(Wake::Shutdown, Wake::Command),
                () = tokio::time::sleep_until(teardown.unwrap_or_else(Instant::now)), if teardown.is_some() => Wake::Elapsed,
                frame = read.next() => Wake::Frame(frame),
            };

            let action = match event {
                Wake::Shutdown => {
                    close(&mut write).await;
                    return SessionEnd::Shutdown;
                }
                Wake::Command(Command::Subscribe { id, resolved, slot }) => {
                    teardown = None;
                    self.insert(id, resolved, slot);
                    Action::Resubscribe
                }
                Wake::Command(Command::Unsubscribe(id)) => {
                    if self.remove(id, SubscriptionStatus::Done).is_some() {
                        Action::Resubscribe
                    } else {
                        Action::Nothing
                    }
                }
                Wake::Elapsed => {
                    teardown = None;
                    if self.subs.is_empty() {
                        tracing::info!("No subscriptions left, closing WebSocket");
                        close(&mut write).await;
                        return SessionEnd::Idle;
                    }
                    Action::Nothing
                }
                Wake::Frame(frame) => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Ping(_))) => {
                        tracing::trace!("WebSocket ping");
                        Action::Nothing
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(cf) = frame {
                            tracing::info!(code = %cf.code, reason = %cf.reason, "WebSocket close frame received");
                        }
                        return SessionEnd::Dropped(None);
                    }
                    Some(Ok(_)) => Action::Nothing,
                    Some(Err(e)) => {
                        return SessionEnd::Dropped(Some(Error::WebSocketConnect(e.to_string())));
                    }
                    None => return SessionEnd::Dropped(None),
                },
            };

            match action {
                Action::Nothing => {}
                Action::Cycle => {
                    close(&mut write).await;
                    return SessionEnd::Qos;
                }
                Action::Resubscribe => {
                    // An unsubscribe resets the grace window.
                    if self.subs.is_empty() {
                        teardown = Some(Instant::now() + self.teardown_grace);
                    }
                    if let Err(e) = self.send_subscribe(&mut write).await {
                        return SessionEnd::Dropped(Some(e));
                    }
                }
            }
        }
    }

    async fn send_subscribe(&mut self, write: &mut WsWrite) -> Result<(), Error> {
        let mut ready: Vec<LocalId> = self.subs.keys().copied().collect();
        ready.sort_unstable();

        let request_id = uuid::Uuid::new_v4().to_string();
        let mut requests = Vec::with_capacity(ready.len());
        for id in &ready {
            if let Some(entry) = self.subs.get_mut(id) {
                entry.last_request = Some(request_id.clone());
                requests.push(entry.resolved.request.clone());
            }
        }

        let message = SubscribeRequests {
            id: request_id.clone(),
            requests,
        };
        let payload = serde_json::to_string(&message).map_err(|e| Error::decode(&e, ""))?;
        self.pending.insert(request_id, ready);

        tracing::debug!(subscriptions = message.requests.len(), "sending subscribe message");
        write
            .send(Message::text(payload))
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))
    }

    fn handle_text(&mut self, text: &str) -> Action {
        let message: StreamMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(error = %Error::decode(&e, text), "Failed to parse WebSocket message");
                return Action::Nothing;
            }
        };
        self.backoff.reset();

        if let StreamMessage::SubscribeResponses(msg) = message {
            return self.handle_subscribe_responses(msg);
        }

        let Some(server_id) = message.subscription_id() else {
            tracing::debug!("ignoring unknown WebSocket message type");
            return Action::Nothing;
        };
        let Some(local) = self.server_ids.get(server_id).copied() else {
            tracing::debug!(subscription_id = server_id, "message for unknown subscription");
            return Action::Nothing;
        };
        let Some(entry) = self.subs.get(&local) else {
            return Action::Nothing;
        };

        let delivery = match message {
            StreamMessage::ObjectSetChanged(msg) => {
                let updates = entry
                    .resolved
                    .decode_updates(self.ctx.objects.as_ref(), msg.updates);
                let mut delivery = Delivery::Continue;
                for update in updates {
                    delivery = entry.slot.change(update);
                    if delivery == Delivery::Close {
                        break;
                    }
                }
                delivery
            }
            StreamMessage::RefreshObjectSet(_) => entry.slot.out_of_date(),
            StreamMessage::InitialLoadCompleted(_) => entry.slot.initial_load_complete(),
            StreamMessage::SubscriptionClosed(msg) => {
                tracing::info!(subscription_id = %msg.id, "subscription closed by server");
                let _ = entry.slot.error(true, ErrorCause::Server(msg.cause));
                Delivery::Close
            }
            StreamMessage::SubscribeResponses(_) | StreamMessage::Unknown => Delivery::Continue,
        };

        if delivery == Delivery::Close {
            self.remove(local, SubscriptionStatus::Error);
            Action::Resubscribe
        } else {
            Action::Nothing
        }
    }

    fn handle_subscribe_responses(&mut self, msg: SubscribeResponses) -> Action {
        let Some(locals) = self.pending.remove(&msg.id) else {
            tracing::debug!(request_id = %msg.id, "discarding stale subscribe response");
            return Action::Nothing;
        };
        if locals.len() != msg.responses.len() {
            tracing::warn!(
                expected = locals.len(),
                received = msg.responses.len(),
                "subscribe response count mismatch"
            );
        }

        let mut cycle = false;
        let mut closed = Vec::new();
        for (local, response) in locals.into_iter().zip(msg.responses) {
            let Some(entry) = self.subs.get_mut(&local) else {
                continue;
            };
            if entry.last_request.as_deref() != Some(msg.id.as_str()) {
                // Superseded by a newer subscribe message.
                continue;
            }

            match response {
                SubscribeResponse::Success { id } => {
                    if let Some(old) = entry.server_id.replace(id.clone()) {
                        if old != id {
                            self.server_ids.remove(&old);
                        }
                    }
                    self.server_ids.insert(id, local);

                    let previous = std::mem::replace(&mut entry.status, SubscriptionStatus::Subscribed);
                    let delivery = match previous {
                        SubscriptionStatus::Preparing => entry.slot.successful_subscription(),
                        SubscriptionStatus::Reconnecting | SubscriptionStatus::Expired => {
                            entry.slot.out_of_date()
                        }
                        _ => Delivery::Continue,
                    };
                    if delivery == Delivery::Close {
                        closed.push(local);
                    }
                }
                SubscribeResponse::Error { errors } => {
                    let _ = entry
                        .slot
                        .error(true, ErrorCause::Server(serde_json::Value::Array(errors)));
                    closed.push(local);
                }
                SubscribeResponse::Qos => cycle = true,
                SubscribeResponse::Unknown => {
                    tracing::warn!(subscription = local.0, "unknown subscribe response type");
                }
            }
        }

        let resubscribe = !closed.is_empty();
        for local in closed {
            self.remove(local, SubscriptionStatus::Error);
        }

        if cycle {
            Action::Cycle
        } else if resubscribe {
            Action::Resubscribe
        } else {
            Action::Nothing
        }
    }
}

async fn connect(ctx: &FeedContext) -> Result<WsStream, Error> {
    let url = websocket_url(&ctx.base_url, &ctx.ontology_rid)?;
    let token = ctx.tokens.token().await?;

    tracing::info!(url = %url, "Connecting to WebSocket");
    let uri: tungstenite::http::Uri = url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;
    let request = ClientRequestBuilder::new(uri)
        .with_sub_protocol(format!("Bearer-{}", token.expose_secret()));

    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| Error::WebSocketConnect(e.to_string()))?;
    Ok(ws)
}

async fn close(write: &mut WsWrite) {
    if let Err(e) = write.send(Message::Close(None)).await {
        tracing::debug!(error = %e, "error sending close frame");
    }
}
