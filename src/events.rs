//! Typed domain events emitted by the order and user services.
//!
//! Events are JSON objects tagged with an `event` field and camelCase fields,
//! matching the documents the services store.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::publisher::{PublishOutcome, QueueMessage, QueuePublisher};

/// Lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "under process")]
    UnderProcess,
    #[serde(rename = "shipping")]
    Shipping,
    #[serde(rename = "delivered")]
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAddress {
    pub street: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub item_id: String,
    pub quantity: u32,
    pub price: f64,
}

/// An event published to the queue after the owning service committed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DomainEvent {
    OrderCreated {
        order_id: String,
        user_id: String,
        items: Vec<OrderItem>,
        user_emails: Vec<String>,
        delivery_address: DeliveryAddress,
        order_status: OrderStatus,
    },
    OrderStatusChanged {
        order_id: String,
        order_status: OrderStatus,
    },
    OrderDetailsUpdated {
        order_id: String,
        user_emails: Vec<String>,
        delivery_address: DeliveryAddress,
    },
    /// Lets the order service sync denormalized user data.
    UserUpdated {
        user_id: String,
        emails: Vec<String>,
        delivery_address: DeliveryAddress,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OrderCreated { .. } => "order_created",
            Self::OrderStatusChanged { .. } => "order_status_changed",
            Self::OrderDetailsUpdated { .. } => "order_details_updated",
            Self::UserUpdated { .. } => "user_updated",
        }
    }
}

/// Publishes domain events to a default queue without blocking the caller
/// past `ack_wait`.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    publisher: QueuePublisher,
    queue: String,
    ack_wait: Duration,
}

impl EventPublisher {
    pub fn new(publisher: QueuePublisher, queue: impl Into<String>, ack_wait: Duration) -> Self {
        Self {
            publisher,
            queue: queue.into(),
            ack_wait,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn publisher(&self) -> &QueuePublisher {
        &self.publisher
    }

    /// Emits `event` once the caller's write has committed.
    ///
    /// The outcome is informational: a failed or deferred publish must not
    /// change the response the caller sends.
    pub async fn emit_after_commit(&self, event: &DomainEvent) -> PublishOutcome {
        let message = match QueueMessage::json(self.queue.as_str(), event) {
            Ok(message) => message,
            Err(e) => {
                error!(event = event.kind(), error = %e, "failed to encode event");
                return PublishOutcome::Failed;
            }
        };

        let outcome = self
            .publisher
            .publish_decoupled(message, self.ack_wait)
            .await;
        info!(event = event.kind(), queue = %self.queue, ?outcome, "event emitted");
        outcome
    }
}
