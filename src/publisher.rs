//! Queue publisher adapter.
//!
//! Backends emit events through a [`QueuePublisher`], which retries a bounded
//! number of times with exponential backoff and never lets a broker failure
//! change the HTTP status the backend returns to its client. Messages that
//! exhaust their retries are recorded in a [`DegradedSignal`] so a
//! reconciliation job can republish them later.
//!
//! Delivery is at-least-once: a retry after a lost acknowledgment can deliver
//! a message twice, so consumers must be idempotent.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{
    DEFAULT_PENDING_CAPACITY, DEFAULT_PUBLISH_ATTEMPTS, DEFAULT_PUBLISH_INITIAL_BACKOFF,
    DEFAULT_PUBLISH_MAX_BACKOFF,
};
use crate::{GatewayError, Result};

/// One message bound for a named queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Queue name, used as the routing key.
    pub queue: String,
    pub payload: Bytes,
    pub content_type: String,
}

impl QueueMessage {
    pub fn new(queue: impl Into<String>, payload: impl Into<Bytes>, content_type: &str) -> Self {
        Self {
            queue: queue.into(),
            payload: payload.into(),
            content_type: content_type.to_owned(),
        }
    }

    /// Serializes `value` as an `application/json` message.
    pub fn json<T: Serialize>(queue: impl Into<String>, value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| GatewayError::Internal(format!("failed to encode message: {e}")))?;
        Ok(Self::new(queue, payload, "application/json"))
    }
}

/// Broker acknowledgment of a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Attempts it took, including the successful one.
    pub attempts: u32,
}

/// Failure reported by a [`Broker`] for a single publish attempt.
#[derive(Debug)]
pub enum BrokerError {
    /// The connection or channel could not be established or was lost.
    Connection(String),
    /// The broker negatively acknowledged the message.
    Rejected(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "broker connection error: {msg}"),
            Self::Rejected(msg) => write!(f, "broker rejected message: {msg}"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// A message broker capable of confirmed, single-attempt publishing.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publishes one message and resolves once the broker confirmed it.
    async fn publish(&self, message: &QueueMessage) -> std::result::Result<(), BrokerError>;
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_PUBLISH_ATTEMPTS,
            initial_backoff: DEFAULT_PUBLISH_INITIAL_BACKOFF,
            max_backoff: DEFAULT_PUBLISH_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `retry`-th failed attempt (0-based):
    /// `initial_backoff * 2^retry`, capped at `max_backoff`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Degraded-mode signal: counts exhausted publishes and keeps the most recent
/// undelivered messages for reconciliation.
#[derive(Debug)]
pub struct DegradedSignal {
    failed: AtomicU64,
    pending: Mutex<VecDeque<QueueMessage>>,
    capacity: usize,
}

impl Default for DegradedSignal {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_CAPACITY)
    }
}

impl DegradedSignal {
    pub fn new(capacity: usize) -> Self {
        Self {
            failed: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Records an undelivered message, evicting the oldest when full.
    pub fn record(&self, message: QueueMessage) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.len() == self.capacity {
            if let Some(evicted) = pending.pop_front() {
                warn!(queue = %evicted.queue, "pending list full, dropping oldest message");
            }
        }
        pending.push_back(message);
    }

    /// Total publishes that exhausted their retries since startup.
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// `true` while undelivered messages are waiting.
    pub fn is_degraded(&self) -> bool {
        self.pending_len() > 0
    }

    /// Removes and returns every pending message, oldest first.
    pub fn take_pending(&self) -> Vec<QueueMessage> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

/// Result of a publish whose caller waits at most `ack_wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker confirmed within the wait.
    Acked(Ack),
    /// Still in flight; the publish continues in the background.
    Deferred,
    /// Retries were exhausted within the wait; the message is pending.
    Failed,
}

/// Retrying publisher over any [`Broker`].
#[derive(Clone)]
pub struct QueuePublisher {
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
    degraded: Arc<DegradedSignal>,
}

impl fmt::Debug for QueuePublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuePublisher")
            .field("policy", &self.policy)
            .field("degraded", &self.degraded)
            .finish_non_exhaustive()
    }
}

impl QueuePublisher {
    pub fn new(broker: Arc<dyn Broker>, policy: RetryPolicy, degraded: Arc<DegradedSignal>) -> Self {
        Self {
            broker,
            policy,
            degraded,
        }
    }

    pub fn degraded(&self) -> &Arc<DegradedSignal> {
        &self.degraded
    }

    /// Publishes with retries. On exhaustion the message is recorded in the
    /// degraded signal and [`GatewayError::Publish`] is returned.
    pub async fn publish(&self, message: &QueueMessage) -> Result<Ack> {
        let attempts = self.policy.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.broker.publish(message).await {
                Ok(()) => {
                    debug!(queue = %message.queue, attempt, "message confirmed");
                    return Ok(Ack { attempts: attempt });
                }
                Err(e) => {
                    warn!(queue = %message.queue, attempt, error = %e, "publish attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.policy.backoff(attempt - 1)).await;
            }
        }

        let reason = last_error.map_or_else(String::new, |e| e.to_string());
        error!(
            queue = %message.queue,
            attempts,
            reason = %reason,
            "publish retries exhausted, message kept for reconciliation"
        );
        self.degraded.record(message.clone());

        Err(GatewayError::Publish {
            queue: message.queue.clone(),
            attempts,
            reason,
        })
    }

    /// Publishes without holding the caller past `ack_wait`.
    ///
    /// When the wait expires the publish keeps running on its own task and
    /// the caller gets [`PublishOutcome::Deferred`].
    pub async fn publish_decoupled(&self, message: QueueMessage, ack_wait: Duration) -> PublishOutcome {
        let publisher = self.clone();
        let queue = message.queue.clone();
        let mut handle = tokio::spawn(async move { publisher.publish(&message).await });

        match tokio::time::timeout(ack_wait, &mut handle).await {
            Ok(Ok(Ok(ack))) => PublishOutcome::Acked(ack),
            Ok(Ok(Err(_))) => PublishOutcome::Failed,
            Ok(Err(e)) => {
                error!(queue = %queue, error = %e, "publish task aborted");
                PublishOutcome::Failed
            }
            Err(_) => {
                debug!(queue = %queue, ?ack_wait, "acknowledgment pending, publish continues in background");
                PublishOutcome::Deferred
            }
        }
    }

    /// Republishes every pending message once; those that fail again are
    /// recorded anew. Returns how many were delivered.
    pub async fn republish_pending(&self) -> usize {
        let pending = self.degraded.take_pending();
        if pending.is_empty() {
            return 0;
        }

        let total = pending.len();
        let mut delivered = 0;
        for message in pending {
            if self.publish(&message).await.is_ok() {
                delivered += 1;
            }
        }
        info!(total, delivered, "republished pending messages");
        delivered
    }

    /// Retries the pending list every `every` while degraded, until the
    /// returned handle is aborted.
    pub fn spawn_reconciler(&self, every: Duration) -> JoinHandle<()> {
        let publisher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if publisher.degraded.is_degraded() {
                    publisher.republish_pending().await;
                }
            }
        })
    }
}
