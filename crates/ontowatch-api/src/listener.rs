// ── Listener fan-out ──
//
// Callbacks are user code. A panicking callback must never take down the
// transport loop or starve other subscriptions, so every call goes through
// `ListenerSlot`, which catches unwinds and escalates them into errors.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use thiserror::Error;

use crate::object::ObjectInstance;
use crate::wire::ObjectState;

/// One decoded change to an object in a subscribed set.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectUpdate {
    pub object: Arc<ObjectInstance>,
    pub state: ObjectState,
}

/// Why a subscription reported an error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorCause {
    /// Network-level failure; the transport keeps retrying.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The server rejected or closed the subscription.
    #[error("server closed subscription: {0}")]
    Server(Value),
    /// A listener callback panicked.
    #[error("listener callback panicked: {0}")]
    Listener(String),
}

/// Error delivered to `ObjectSetListener::on_error`.
///
/// When `subscription_closed` is `true` no further callbacks follow.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionError {
    pub subscription_closed: bool,
    pub cause: ErrorCause,
}

/// Receives change-feed events for one subscription. Every method defaults
/// to a no-op, so implementors override only what they need.
pub trait ObjectSetListener: Send + Sync {
    fn on_change(&self, _update: ObjectUpdate) {}

    /// First successful subscribe. Nothing was missed.
    fn on_successful_subscription(&self) {}

    /// Updates may have been missed (reconnect, server refresh); re-fetch.
    fn on_out_of_date(&self) {}

    fn on_error(&self, _error: SubscriptionError) {}

    /// The server finished streaming the initial state of the set.
    fn on_initial_load_complete(&self) {}
}

/// What the transport must do after a callback returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub(crate) enum Delivery {
    Continue,
    /// The listener is closed; tear the subscription down.
    Close,
}

/// Guarded handle to a listener.
///
/// Once closed (terminal error or unsubscribe) every call becomes a no-op.
pub(crate) struct ListenerSlot {
    listener: Arc<dyn ObjectSetListener>,
    closed: AtomicBool,
}

impl ListenerSlot {
    pub(crate) fn new(listener: Arc<dyn ObjectSetListener>) -> Arc<Self> {
        Arc::new(Self {
            listener,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop delivery. Returns `true` if this call closed the slot.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn change(&self, update: ObjectUpdate) -> Delivery {
        self.deliver("on_change", |l| l.on_change(update))
    }

    pub(crate) fn successful_subscription(&self) -> Delivery {
        self.deliver("on_successful_subscription", |l| {
            l.on_successful_subscription();
        })
    }

    pub(crate) fn out_of_date(&self) -> Delivery {
        self.deliver("on_out_of_date", |l| l.on_out_of_date())
    }

    pub(crate) fn initial_load_complete(&self) -> Delivery {
        self.deliver("on_initial_load_complete", |l| l.on_initial_load_complete())
    }

    /// Report an error. A terminal error closes the slot after delivery.
    ///
    /// A panic while handling a non-terminal error escalates: the slot is
    /// closed and the listener receives one final terminal error.
    pub(crate) fn error(&self, subscription_closed: bool, cause: ErrorCause) -> Delivery {
        if self.is_closed() {
            return Delivery::Close;
        }
        if subscription_closed {
            self.close();
        }
        let error = SubscriptionError {
            subscription_closed,
            cause,
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| self.listener.on_error(error)));
        match outcome {
            Ok(()) if subscription_closed => Delivery::Close,
            Ok(()) => Delivery::Continue,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(callback = "on_error", %message, "listener callback panicked");
                if !subscription_closed {
                    self.close();
                    let terminal = SubscriptionError {
                        subscription_closed: true,
                        cause: ErrorCause::Listener(message),
                    };
                    if catch_unwind(AssertUnwindSafe(|| self.listener.on_error(terminal))).is_err() {
                        tracing::error!(callback = "on_error", "listener panicked on terminal error");
                    }
                }
                Delivery::Close
            }
        }
    }

    fn deliver(&self, callback: &'static str, f: impl FnOnce(&dyn ObjectSetListener)) -> Delivery {
        if self.is_closed() {
            return Delivery::Close;
        }
        match catch_unwind(AssertUnwindSafe(|| f(self.listener.as_ref()))) {
            Ok(()) => Delivery::Continue,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(callback, %message, "listener callback panicked");
                self.error(false, ErrorCause::Listener(message))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        panic_on_change: bool,
        panic_on_error: bool,
    }

    impl ObjectSetListener for Recorder {
        fn on_change(&self, update: ObjectUpdate) {
            assert!(!self.panic_on_change, "boom");
            self.events
                .lock()
                .unwrap()
                .push(format!("change:{}", update.object.primary_key()));
        }

        fn on_error(&self, error: SubscriptionError) {
            self.events
                .lock()
                .unwrap()
                .push(format!("error:{}", error.subscription_closed));
            assert!(!(self.panic_on_error && !error.subscription_closed), "bad handler");
        }

        fn on_out_of_date(&self) {
            self.events.lock().unwrap().push("out_of_date".into());
        }
    }

    fn update() -> ObjectUpdate {
        ObjectUpdate {
            object: Arc::new(ObjectInstance::new("Todo", 1)),
            state: ObjectState::AddedOrUpdated,
        }
    }

    #[test]
    fn delivers_until_closed() {
        let rec = Arc::new(Recorder::default());
        let slot = ListenerSlot::new(rec.clone());

        assert_eq!(slot.change(update()), Delivery::Continue);
        assert!(slot.close());
        assert!(!slot.close());
        assert_eq!(slot.out_of_date(), Delivery::Close);

        assert_eq!(*rec.events.lock().unwrap(), vec!["change:1".to_owned()]);
    }

    #[test]
    fn panicking_callback_becomes_non_terminal_error() {
        let rec = Arc::new(Recorder {
            panic_on_change: true,
            ..Recorder::default()
        });
        let slot = ListenerSlot::new(rec.clone());

        assert_eq!(slot.change(update()), Delivery::Continue);
        assert!(!slot.is_closed());
        assert_eq!(*rec.events.lock().unwrap(), vec!["error:false".to_owned()]);
    }

    #[test]
    fn panicking_error_handler_escalates_to_terminal() {
        let rec = Arc::new(Recorder {
            panic_on_error: true,
            ..Recorder::default()
        });
        let slot = ListenerSlot::new(rec.clone());

        let outcome = slot.error(false, ErrorCause::Transport("reset".into()));
        assert_eq!(outcome, Delivery::Close);
        assert!(slot.is_closed());
        assert_eq!(
            *rec.events.lock().unwrap(),
            vec!["error:false".to_owned(), "error:true".to_owned()]
        );
    }

    #[test]
    fn terminal_error_is_delivered_once() {
        let rec = Arc::new(Recorder::default());
        let slot = ListenerSlot::new(rec.clone());

        assert_eq!(
            slot.error(true, ErrorCause::Server(Value::from("SERVER_SHUTDOWN"))),
            Delivery::Close
        );
        assert_eq!(
            slot.error(true, ErrorCause::Server(Value::Null)),
            Delivery::Close
        );
        assert_eq!(*rec.events.lock().unwrap(), vec!["error:true".to_owned()]);
    }
}
