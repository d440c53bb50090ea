/// Typed event routing
///
/// Controllers publish `LinkEvent`s on an unbounded channel. `EventRouter`
/// consumes that channel and hands each event to the handlers registered for
/// it: per-endpoint message handlers, a fallback message handler, error
/// handlers and catch-all event handlers.

use crate::transport::abstraction::{EndpointId, LinkError, LinkEvent};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

type MessageHandler<M> = Box<dyn FnMut(EndpointId, M) + Send>;
type ErrorHandler = Box<dyn FnMut(&LinkError) + Send>;
type EventHandler<M> = Box<dyn FnMut(&LinkEvent<M>) + Send>;

pub struct EventRouter<M> {
    message_handlers: HashMap<EndpointId, MessageHandler<M>>,
    fallback: Option<MessageHandler<M>>,
    error_handlers: Vec<ErrorHandler>,
    event_handlers: Vec<EventHandler<M>>,
}

impl<M: Clone + Send + 'static> EventRouter<M> {
    pub fn new() -> Self {
        Self {
            message_handlers: HashMap::new(),
            fallback: None,
            error_handlers: Vec::new(),
            event_handlers: Vec::new(),
        }
    }

    /// Handle complete messages from `endpoint`; replaces any earlier handler
    pub fn on_message<F>(&mut self, endpoint: EndpointId, handler: F) -> &mut Self
    where
        F: FnMut(EndpointId, M) + Send + 'static,
    {
        self.message_handlers.insert(endpoint, Box::new(handler));
        self
    }

    /// Handle messages from endpoints without a dedicated handler
    pub fn on_any_message<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(EndpointId, M) + Send + 'static,
    {
        self.fallback = Some(Box::new(handler));
        self
    }

    pub fn on_error<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&LinkError) + Send + 'static,
    {
        self.error_handlers.push(Box::new(handler));
        self
    }

    /// Observe every event, including the ones routed elsewhere
    pub fn on_event<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&LinkEvent<M>) + Send + 'static,
    {
        self.event_handlers.push(Box::new(handler));
        self
    }

    /// Route one event
    pub fn dispatch(&mut self, event: LinkEvent<M>) {
        for handler in self.event_handlers.iter_mut() {
            handler(&event);
        }

        match event {
            LinkEvent::Message { endpoint, message } => {
                if let Some(handler) = self.message_handlers.get_mut(&endpoint) {
                    handler(endpoint, message);
                } else if let Some(handler) = self.fallback.as_mut() {
                    handler(endpoint, message);
                } else {
                    debug!("No handler for message on {}", endpoint);
                }
            }
            LinkEvent::Error(error) => {
                if self.error_handlers.is_empty() {
                    warn!("Unhandled link error: {}", error);
                }
                for handler in self.error_handlers.iter_mut() {
                    handler(&error);
                }
            }
            _ => {}
        }
    }

    /// Route events until every sender is dropped
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<LinkEvent<M>>) {
        while let Some(event) = events.recv().await {
            self.dispatch(event);
        }
        debug!("Event channel closed");
    }
}

impl<M: Clone + Send + 'static> Default for EventRouter<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn test_routes_by_endpoint() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let on_a = Arc::new(Mutex::new(Vec::new()));
        let other = Arc::new(Mutex::new(Vec::new()));

        let mut router = EventRouter::<String>::new();
        let sink = on_a.clone();
        router.on_message(a, move |_, m| sink.lock().push(m));
        let sink = other.clone();
        router.on_any_message(move |e, m| sink.lock().push((e, m)));

        router.dispatch(LinkEvent::Message {
            endpoint: a,
            message: "first".to_string(),
        });
        router.dispatch(LinkEvent::Message {
            endpoint: b,
            message: "second".to_string(),
        });

        assert_eq!(*on_a.lock(), vec!["first".to_string()]);
        assert_eq!(*other.lock(), vec![(b, "second".to_string())]);
    }

    #[test]
    fn test_error_and_event_handlers() {
        let errors = Arc::new(Mutex::new(0));
        let events = Arc::new(Mutex::new(0));

        let mut router = EventRouter::<String>::new();
        let count = errors.clone();
        router.on_error(move |_| *count.lock() += 1);
        let count = events.clone();
        router.on_event(move |_| *count.lock() += 1);

        router.dispatch(LinkEvent::Error(LinkError::ConnectionLost));
        router.dispatch(LinkEvent::AdvertisingStarted);

        assert_eq!(*errors.lock(), 1);
        assert_eq!(*events.lock(), 2);
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let (tx, rx) = mpsc::unbounded_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut router = EventRouter::<u32>::new();
        let sink = seen.clone();
        router.on_any_message(move |_, m| sink.lock().push(m));

        for n in 0..3 {
            tx.send(LinkEvent::Message {
                endpoint: Uuid::nil(),
                message: n,
            })
            .unwrap();
        }
        drop(tx);

        router.run(rx).await;
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }
}
