//! A weighted traffic-splitting HTTP gateway for strangler-pattern
//! migrations, built on [Hyper].
//!
//! Requests are matched to routes, each route forwards to an upstream, and
//! each upstream spreads traffic over weighted targets. A legacy/modern split
//! is a two-target upstream whose weights follow a single percentage. Target
//! health is tracked passively from forwarding outcomes and actively by
//! periodic probes. A retrying queue publisher lets backends emit domain
//! events to RabbitMQ without tying their responses to broker availability.
//!
//! [Hyper]: https://hyper.rs/

pub mod admin;
pub mod amqp;
pub mod config;
pub mod error;
pub mod events;
pub mod headers;
pub mod health;
pub mod matcher;
pub mod proxy;
pub mod publisher;
pub mod registry;
pub mod reload;
pub mod router;
pub mod selector;
pub mod server;
pub mod strangler;

pub use admin::{AdminState, handle_admin, serve_admin};
pub use amqp::{AmqpBroker, AmqpSettings};
pub use config::{Config, EnvSnapshot, RuntimeConfig};
pub use error::GatewayError;
pub use events::{DomainEvent, EventPublisher};
pub use health::{HealthThresholds, HealthTracker, ProbeSettings, ProbeSupervisor};
pub use matcher::{PathPattern, Route, RouteMatch, RouteMatcher};
pub use proxy::{BoxBody, Gateway, HttpClient, build_client, handle_request};
pub use publisher::{
    Broker, BrokerError, DegradedSignal, PublishOutcome, QueueMessage, QueuePublisher, RetryPolicy,
};
pub use registry::{HashOn, HealthStatus, Target, TargetRegistry, Upstream};
pub use reload::{Reloader, SharedProbes};
pub use router::{ForwardInstruction, GatewayRouter};
pub use selector::{Affinity, WeightedSelector};
pub use server::{ServerState, serve, shutdown_signal};
pub use strangler::StranglerSplit;

/// A specialized `Result` type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
