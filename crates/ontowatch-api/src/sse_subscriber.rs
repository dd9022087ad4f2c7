//! Per-subscription change feed over Server-Sent Events.
//!
//! Each `subscribe()` call spawns its own reconnect loop: POST the subscribe
//! request, read the event stream until it ends, back off, repeat.
//! The loop stops on unsubscribe, on a terminal server response, or when a
//! listener escalates a failure to terminal.

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::backoff::{ExponentialBackoff, ReconnectConfig};
use crate::error::Error;
use crate::listener::{Delivery, ErrorCause, ListenerSlot, ObjectSetListener};
use crate::sse::sse_events;
use crate::subscriber::{
    FeedContext, ObjectSetSubscriber, ResolvedSubscription, SubscribeSpec, SubscriptionHandle,
};
use crate::transport::sse_url;
use crate::wire::{StreamMessage, SubscribeRequests, SubscribeResponse};

pub struct SseSubscriber {
    ctx: FeedContext,
    http: reqwest::Client,
    reconnect: ReconnectConfig,
}

impl SseSubscriber {
    pub fn new(ctx: FeedContext, http: reqwest::Client, reconnect: ReconnectConfig) -> Self {
        Self {
            ctx,
            http,
            reconnect,
        }
    }
}

impl ObjectSetSubscriber for SseSubscriber {
    fn subscribe(
        &self,
        spec: SubscribeSpec,
        listener: Arc<dyn ObjectSetListener>,
    ) -> BoxFuture<'_, Result<SubscriptionHandle, Error>> {
        Box::pin(async move {
            let resolved = ResolvedSubscription::resolve(&self.ctx, &spec).await?;
            let url = sse_url(
                &self.ctx.base_url,
                &self.ctx.ontology_rid,
                spec.include_initial_state,
            )?;
            let body = SubscribeRequests {
                id: uuid::Uuid::new_v4().to_string(),
                requests: vec![resolved.request.clone()],
            };

            let slot = ListenerSlot::new(listener);
            let cancel = CancellationToken::new();
            let stream = SseStream {
                ctx: self.ctx.clone(),
                http: self.http.clone(),
                url,
                body,
                resolved,
                slot: Arc::clone(&slot),
            };
            tokio::spawn(sse_loop(stream, self.reconnect.clone(), cancel.clone()));

            Ok(SubscriptionHandle::new(move || {
                slot.close();
                cancel.cancel();
            }))
        })
    }
}

// ── Reconnect loop ───────────────────────────────────────────────────

struct SseStream {
    ctx: FeedContext,
    http: reqwest::Client,
    url: Url,
    body: SubscribeRequests,
    resolved: ResolvedSubscription,
    slot: Arc<ListenerSlot>,
}

/// How one connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// The server ended the stream; updates may have been missed.
    Ended,
    /// QoS asked us to reconnect right away.
    Reconnect,
    /// The subscription is over.
    Closed,
}

/// Per-connection mutable state shared with the message handler.
struct Session<'a> {
    backoff: &'a mut ExponentialBackoff,
    /// Set by the first `success` response; later ones mean a resubscribe.
    has_subscribed: &'a mut bool,
}

async fn sse_loop(stream: SseStream, reconnect: ReconnectConfig, cancel: CancellationToken) {
    let mut backoff = ExponentialBackoff::new(reconnect);
    let mut has_subscribed = false;

    loop {
        let mut session = Session {
            backoff: &mut backoff,
            has_subscribed: &mut has_subscribed,
        };
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = stream.connect_and_read(&mut session, &cancel) => result,
        };
        if cancel.is_cancelled() || stream.slot.is_closed() {
            break;
        }

        match result {
            Ok(StreamEnd::Closed) => break,
            Ok(StreamEnd::Reconnect) => {
                tracing::debug!("SSE qos, reconnecting immediately");
                continue;
            }
            Ok(StreamEnd::Ended) => {
                tracing::debug!("SSE stream ended, will reconnect");
                if has_subscribed && stream.slot.out_of_date() == Delivery::Close {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = backoff.attempt(), "SSE connection error");
                if stream.slot.error(false, ErrorCause::Transport(e.to_string())) == Delivery::Close {
                    break;
                }
            }
        }

        if backoff.exhausted() {
            tracing::error!("SSE reconnection limit reached, giving up");
            let _ = stream.slot.error(
                true,
                ErrorCause::Transport("reconnection limit reached".into()),
            );
            break;
        }

        let delay = backoff.next_delay();
        tracing::debug!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt = backoff.attempt(),
            "Waiting before SSE reconnect"
        );
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!("SSE loop exiting");
}

impl SseStream {
    async fn connect_and_read(
        &self,
        session: &mut Session<'_>,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, Error> {
        let token = self.ctx.tokens.token().await?;

        tracing::debug!(url = %self.url, "Opening SSE connection");
        let response = self
            .http
            .post(self.url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", token.expose_secret()))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream")
            .json(&self.body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let events = sse_events(response.bytes_stream());
        let mut events = std::pin::pin!(events);
        while let Some(event) = events.next().await {
            if cancel.is_cancelled() {
                return Ok(StreamEnd::Closed);
            }
            let event = event?;
            let message: StreamMessage = match serde_json::from_str(&event.data) {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!(error = %Error::decode(&e, &event.data), "Failed to parse SSE event data");
                    continue;
                }
            };
            session.backoff.reset();

            if let Some(end) = self.handle_message(message, session.has_subscribed) {
                return Ok(end);
            }
        }

        Ok(StreamEnd::Ended)
    }

    /// Returns `Some` when the connection should stop.
    fn handle_message(&self, message: StreamMessage, has_subscribed: &mut bool) -> Option<StreamEnd> {
        let delivery = match message {
            StreamMessage::SubscribeResponses(msg) => {
                let Some(response) = msg.responses.into_iter().next() else {
                    tracing::warn!("SSE subscribe response without entries");
                    return None;
                };
                match response {
                    SubscribeResponse::Success { id } => {
                        tracing::debug!(subscription_id = %id, "SSE subscription established");
                        if *has_subscribed {
                            self.slot.out_of_date()
                        } else {
                            *has_subscribed = true;
                            self.slot.successful_subscription()
                        }
                    }
                    SubscribeResponse::Error { errors } => {
                        let _ = self
                            .slot
                            .error(true, ErrorCause::Server(serde_json::Value::Array(errors)));
                        return Some(StreamEnd::Closed);
                    }
                    SubscribeResponse::Qos => return Some(StreamEnd::Reconnect),
                    SubscribeResponse::Unknown => {
                        tracing::warn!("SSE unknown subscribe response type");
                        Delivery::Continue
                    }
                }
            }
            StreamMessage::ObjectSetChanged(msg) => {
                let updates = self
                    .resolved
                    .decode_updates(self.ctx.objects.as_ref(), msg.updates);
                let mut delivery = Delivery::Continue;
                for update in updates {
                    delivery = self.slot.change(update);
                    if delivery == Delivery::Close {
                        break;
                    }
                }
                delivery
            }
            StreamMessage::RefreshObjectSet(_) => self.slot.out_of_date(),
            StreamMessage::SubscriptionClosed(msg) => {
                tracing::info!(subscription_id = %msg.id, "SSE subscription closed by server");
                let _ = self.slot.error(true, ErrorCause::Server(msg.cause));
                return Some(StreamEnd::Closed);
            }
            StreamMessage::InitialLoadCompleted(_) => self.slot.initial_load_complete(),
            StreamMessage::Unknown => {
                tracing::debug!("ignoring unknown SSE message type");
                Delivery::Continue
            }
        };

        (delivery == Delivery::Close).then_some(StreamEnd::Closed)
    }
}
