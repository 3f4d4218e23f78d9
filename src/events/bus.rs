//! In-process publish/subscribe.
//!
//! Subscriptions live in a registration table keyed by [`Topic`]. Publishing
//! hands the event to every handler registered for its topic; each handler
//! runs on its own tokio task so a slow or failing subscriber never holds up
//! the publisher.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use super::types::{ContentEvent, Topic};

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: ContentEvent) -> Result<()>;
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait EventBus: Send + Sync {
    fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>);

    async fn publish(&self, event: ContentEvent) -> Result<()>;
}

type HandlerTable = HashMap<Topic, Vec<Arc<dyn EventHandler>>>;

#[derive(Default)]
pub struct InProcessEventBus {
    handlers: RwLock<HandlerTable>,
}

impl std::fmt::Debug for InProcessEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let counts: HashMap<&str, usize> = table.iter().map(|(t, h)| (t.as_str(), h.len())).collect();
        f.debug_struct("InProcessEventBus")
            .field("handlers", &counts)
            .finish()
    }
}

impl InProcessEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn handlers_for(&self, topic: Topic) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn handler_count(&self, topic: Topic) -> usize {
        self.handlers_for(topic).len()
    }

    /// Spawns every handler for the event's topic and returns their handles.
    pub fn dispatch(&self, event: ContentEvent) -> Vec<JoinHandle<()>> {
        let topic = event.topic();
        let handlers = self.handlers_for(topic);
        debug!(topic = %topic, handlers = handlers.len(), "Dispatching event");

        handlers
            .into_iter()
            .map(|handler| {
                let event = event.clone();
                tokio::spawn(async move {
                    let content_id = event.content_id().to_string();
                    if let Err(e) = handler.handle(event).await {
                        warn!(topic = %topic, content_id = %content_id, error = %e, "Event handler failed");
                    }
                })
            })
            .collect()
    }

    /// Like [`dispatch`](Self::dispatch) but waits for every handler to finish.
    pub async fn dispatch_and_wait(&self, event: ContentEvent) {
        for handle in self.dispatch(event) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Event handler task panicked");
            }
        }
    }

    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl EventBus for InProcessEventBus {
    fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic)
            .or_default()
            .push(handler);
        debug!(topic = %topic, "Handler subscribed");
    }

    async fn publish(&self, event: ContentEvent) -> Result<()> {
        self.dispatch(event);
        Ok(())
    }
}
