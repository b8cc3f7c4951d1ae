//! RabbitMQ implementation of the [`Broker`] seam over AMQP 0-9-1.
//!
//! One connection and one confirm-mode channel are opened lazily and reused.
//! Queues are declared durable on first use, messages are published
//! persistent (delivery mode 2) and each publish waits for the broker's
//! confirm. The session lock covers connecting, declaring and handing the
//! message to the channel; the confirm is awaited after the lock is released,
//! so concurrent publishes share the channel instead of queueing behind one
//! another. A connection failure drops the session so the next attempt
//! reconnects.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions};
use lapin::publisher_confirm::PublisherConfirm;
use lapin::types::{FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::publisher::{Broker, BrokerError, QueueMessage};

const PERSISTENT: u8 = 2;

/// Connection settings for the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct AmqpSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Default queue for domain events.
    pub queue: String,
}

impl fmt::Debug for AmqpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"****")
            .field("vhost", &self.vhost)
            .field("queue", &self.queue)
            .finish()
    }
}

impl AmqpSettings {
    pub fn uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: Default::default(),
        }
    }
}

struct Session {
    connection: Connection,
    channel: Channel,
    declared: HashSet<String>,
}

/// A [`Broker`] publishing to RabbitMQ with publisher confirms.
pub struct AmqpBroker {
    settings: AmqpSettings,
    session: Mutex<Option<Session>>,
}

impl fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl AmqpBroker {
    /// Creates a broker; no connection is made until the first publish.
    pub fn new(settings: AmqpSettings) -> Self {
        Self {
            settings,
            session: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &AmqpSettings {
        &self.settings
    }

    /// Closes the connection if one is open.
    pub async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            if let Err(e) = session.connection.close(200, "gateway shutdown").await {
                debug!(error = %e, "error while closing broker connection");
            }
        }
    }

    async fn connect(&self) -> Result<Session, BrokerError> {
        let connection =
            Connection::connect_uri(self.settings.uri(), ConnectionProperties::default())
                .await
                .map_err(connection_error)?;
        let channel = connection.create_channel().await.map_err(connection_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(connection_error)?;

        info!(
            host = %self.settings.host,
            port = self.settings.port,
            vhost = %self.settings.vhost,
            "connected to broker"
        );
        Ok(Session {
            connection,
            channel,
            declared: HashSet::new(),
        })
    }

    /// Declares the queue on first use and hands the message to the channel.
    ///
    /// The returned confirm resolves once the broker acknowledges the message.
    async fn send(session: &mut Session, message: &QueueMessage) -> Result<PublisherConfirm, BrokerError> {
        if !session.declared.contains(&message.queue) {
            session
                .channel
                .queue_declare(
                    &message.queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(connection_error)?;
            session.declared.insert(message.queue.clone());
            debug!(queue = %message.queue, "declared durable queue");
        }

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type(ShortString::from(message.content_type.clone()));

        session
            .channel
            .basic_publish(
                "",
                &message.queue,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(connection_error)
    }

    async fn session(&self) -> Result<MutexGuard<'_, Option<Session>>, BrokerError> {
        let mut guard = self.session.lock().await;
        let connected = guard
            .as_ref()
            .is_some_and(|session| session.connection.status().connected());
        if !connected {
            *guard = Some(self.connect().await?);
        }
        Ok(guard)
    }

    /// Drops the session if its connection is gone. Another publish may have
    /// reconnected in the meantime, in which case the new session stays.
    async fn forget_if_closed(&self, queue: &str, reason: &str) {
        let mut guard = self.session.lock().await;
        if guard
            .as_ref()
            .is_some_and(|session| !session.connection.status().connected())
        {
            warn!(queue = %queue, reason = %reason, "dropping broker session");
            *guard = None;
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, message: &QueueMessage) -> Result<(), BrokerError> {
        let confirm = {
            let mut guard = self.session().await?;
            let Some(session) = guard.as_mut() else {
                return Err(BrokerError::Connection("no broker session".into()));
            };
            match Self::send(session, message).await {
                Ok(confirm) => confirm,
                Err(e) => {
                    if let BrokerError::Connection(reason) = &e {
                        warn!(queue = %message.queue, reason = %reason, "dropping broker session");
                        *guard = None;
                    }
                    return Err(e);
                }
            }
        };

        let confirmation = match confirm.await {
            Ok(confirmation) => confirmation,
            Err(e) => {
                let reason = e.to_string();
                self.forget_if_closed(&message.queue, &reason).await;
                return Err(BrokerError::Connection(reason));
            }
        };

        if confirmation.is_nack() {
            return Err(BrokerError::Rejected(format!(
                "negative acknowledgment on queue {}",
                message.queue
            )));
        }
        Ok(())
    }
}

fn connection_error(err: lapin::Error) -> BrokerError {
    BrokerError::Connection(err.to_string())
}
