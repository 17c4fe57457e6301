// SPDX-License-Identifier: GPL-3.0-or-later
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use reelwright_domain::ReleaseEvent;
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

/// Event publisher abstraction.
///
/// Publishing is fire-and-forget: a delivery failure is logged by the
/// publisher and never reaches the pipeline, whose history stays the
/// source of truth.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &ReleaseEvent);
}

fn event_json(event: &ReleaseEvent) -> serde_json::Value {
    json!({
        "name": event.name,
        "occurred_at": event.occurred_at,
        "release_id": event.payload.release_id,
        "state": event.payload.state,
        "note": event.payload.note,
    })
}

/// A minimal in-memory event bus that stores serialized events.
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    inner: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> MutexGuard<'_, Vec<serde_json::Value>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retrieve and clear all captured events
    pub fn drain(&self) -> Vec<serde_json::Value> {
        std::mem::take(&mut *self.events())
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, event: &ReleaseEvent) {
        self.events().push(event_json(event));
    }
}

/// Writes every event to the log.
#[derive(Clone, Default)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, event: &ReleaseEvent) {
        info!(
            target: "events",
            name = event.name,
            release_id = %event.payload.release_id,
            state = %event.payload.state,
            note = %event.payload.note,
            "release event"
        );
    }
}

/// POSTs each event as JSON to a configured URL, ntfy/webhook style.
#[derive(Clone)]
pub struct WebhookPublisher {
    client: Client,
    url: String,
}

impl WebhookPublisher {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl EventPublisher for WebhookPublisher {
    async fn publish(&self, event: &ReleaseEvent) {
        let result = self
            .client
            .post(&self.url)
            .json(&event_json(event))
            .send()
            .await
            .and_then(|response| response.error_for_status());
        if let Err(err) = result {
            warn!(
                target: "events",
                release_id = %event.payload.release_id,
                error = %err,
                "webhook delivery failed"
            );
        }
    }
}

/// Hands each event to every registered publisher in order.
#[derive(Clone, Default)]
pub struct FanoutPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }
}

#[async_trait]
impl EventPublisher for FanoutPublisher {
    async fn publish(&self, event: &ReleaseEvent) {
        for publisher in &self.publishers {
            publisher.publish(event).await;
        }
    }
}
