//! Target health tracking.
//!
//! Passive checks count consecutive forwarding outcomes per target address:
//! `unhealthy_after` consecutive failures flip a target to `Unhealthy`,
//! `healthy_after` consecutive successes flip it back. Active probes issue an
//! HTTP `GET` against each target on its own timer; the first probe result
//! decides the fate of an `Unknown` target, later results feed the same
//! counters as passive outcomes.
//!
//! Counters are lock-free atomics. State transitions are written through the
//! registry's exclusive write path, never by mutating targets directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::Empty;
use hyper::http::uri::Authority;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Result;
use crate::registry::{HealthStatus, TargetRegistry};

/// Consecutive-outcome thresholds for passive health transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// Consecutive failures that mark a target unhealthy.
    pub unhealthy_after: u32,
    /// Consecutive successes that mark an unhealthy target healthy again.
    pub healthy_after: u32,
}

#[derive(Debug, Default)]
struct Counters {
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
}

/// Records forwarding and probe outcomes and drives health transitions.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    registry: Arc<TargetRegistry>,
    counters: Arc<DashMap<Authority, Arc<Counters>>>,
    thresholds: HealthThresholds,
}

impl HealthTracker {
    pub fn new(registry: Arc<TargetRegistry>, thresholds: HealthThresholds) -> Self {
        Self {
            registry,
            counters: Arc::new(DashMap::new()),
            thresholds,
        }
    }

    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    /// Sets a target's health directly, for operators bringing a target back
    /// (or taking it out) without active probes.
    ///
    /// Both streaks restart from zero. Fails with `NotFound` for an
    /// unregistered address.
    pub fn set_status(&self, address: &Authority, status: HealthStatus) -> Result<bool> {
        let changed = self.registry.set_health(address, status)?;
        let counters = self.counters_for(address);
        counters.consecutive_failures.store(0, Ordering::Release);
        counters.consecutive_successes.store(0, Ordering::Release);
        if changed {
            info!(target = %address, status = status.as_str(), "target health set by operator");
        }
        Ok(changed)
    }

    /// Records a failed forward (transport error or timeout).
    ///
    /// Returns `true` if this failure marked the target unhealthy.
    pub fn record_failure(&self, address: &Authority) -> bool {
        let counters = self.counters_for(address);
        counters.consecutive_successes.store(0, Ordering::Release);
        let failures = counters
            .consecutive_failures
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);

        if failures < self.thresholds.unhealthy_after {
            return false;
        }

        let transitioned = self.transition(address, HealthStatus::Unhealthy);
        if transitioned {
            warn!(target = %address, failures, "target marked unhealthy");
        }
        transitioned
    }

    /// Records a successful forward.
    ///
    /// Returns `true` if this success marked the target healthy.
    pub fn record_success(&self, address: &Authority) -> bool {
        let counters = self.counters_for(address);
        counters.consecutive_failures.store(0, Ordering::Release);
        let successes = counters
            .consecutive_successes
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);

        let ready = match self.registry.health_of(address) {
            Some(HealthStatus::Unknown) => true,
            Some(HealthStatus::Unhealthy) => successes >= self.thresholds.healthy_after,
            Some(HealthStatus::Healthy) | None => false,
        };
        if !ready {
            return false;
        }

        let transitioned = self.transition(address, HealthStatus::Healthy);
        if transitioned {
            info!(target = %address, successes, "target marked healthy");
        }
        transitioned
    }

    /// Records an active probe result.
    ///
    /// A target that has never been probed takes the probe result directly;
    /// afterwards probes count like passive outcomes.
    pub fn record_probe(&self, address: &Authority, ok: bool) -> bool {
        if self.registry.health_of(address) == Some(HealthStatus::Unknown) {
            let status = if ok {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            };
            let counters = self.counters_for(address);
            counters.consecutive_failures.store(u32::from(!ok), Ordering::Release);
            counters.consecutive_successes.store(u32::from(ok), Ordering::Release);
            let transitioned = self.transition(address, status);
            if transitioned {
                info!(target = %address, status = status.as_str(), "first probe result");
            }
            return transitioned;
        }

        if ok {
            self.record_success(address)
        } else {
            self.record_failure(address)
        }
    }

    /// Current consecutive failure count for a target.
    pub fn failure_count(&self, address: &Authority) -> u32 {
        self.counters
            .get(address)
            .map_or(0, |c| c.consecutive_failures.load(Ordering::Acquire))
    }

    /// Drops counters of targets no longer present in the registry.
    pub fn prune(&self) {
        let live = self.registry.addresses();
        self.counters.retain(|address, _| live.contains(address));
    }

    fn counters_for(&self, address: &Authority) -> Arc<Counters> {
        Arc::clone(
            self.counters
                .entry(address.clone())
                .or_insert_with(|| Arc::new(Counters::default()))
                .value(),
        )
    }

    fn transition(&self, address: &Authority, status: HealthStatus) -> bool {
        match self.registry.set_health(address, status) {
            Ok(changed) => changed,
            Err(e) => {
                debug!(target = %address, error = %e, "health update for unregistered target");
                false
            }
        }
    }
}

/// Active probe settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
}

/// Owns one periodic probe task per registered target address.
///
/// Call [`ProbeSupervisor::sync`] after the registry is reinitialized so that
/// new targets gain a probe and removed targets lose theirs.
#[derive(Debug)]
pub struct ProbeSupervisor {
    tracker: HealthTracker,
    settings: ProbeSettings,
    client: Client<HttpConnector, Empty<Bytes>>,
    tasks: HashMap<Authority, JoinHandle<()>>,
}

impl ProbeSupervisor {
    pub fn new(tracker: HealthTracker, settings: ProbeSettings) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            tracker,
            settings,
            client,
            tasks: HashMap::new(),
        }
    }

    /// Starts probes for new targets and stops probes for removed ones.
    pub fn sync(&mut self) {
        let live = self.tracker.registry.addresses();

        self.tasks.retain(|address, handle| {
            let keep = live.contains(address);
            if !keep {
                debug!(target = %address, "stopping health probe");
                handle.abort();
            }
            keep
        });

        for address in live {
            if self.tasks.contains_key(&address) {
                continue;
            }
            debug!(target = %address, path = %self.settings.path, "starting health probe");
            let handle = spawn_probe(
                address.clone(),
                self.tracker.clone(),
                self.settings.clone(),
                self.client.clone(),
            );
            self.tasks.insert(address, handle);
        }

        self.tracker.prune();
    }

    /// Number of running probe tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Drop for ProbeSupervisor {
    fn drop(&mut self) {
        self.tasks.values().for_each(JoinHandle::abort);
    }
}

fn spawn_probe(
    address: Authority,
    tracker: HealthTracker,
    settings: ProbeSettings,
    client: Client<HttpConnector, Empty<Bytes>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let uri = match format!("http://{address}{}", settings.path).parse::<hyper::Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(target = %address, error = %e, "failed to build health probe URI");
                return;
            }
        };

        let mut ticker = tokio::time::interval(settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let ok = match tokio::time::timeout(settings.timeout, client.get(uri.clone())).await {
                Ok(Ok(resp)) if resp.status().is_success() => true,
                Ok(Ok(resp)) => {
                    debug!(target = %address, status = resp.status().as_u16(), "probe returned non-success status");
                    false
                }
                Ok(Err(e)) => {
                    debug!(target = %address, error = %e, "probe request failed");
                    false
                }
                Err(_) => {
                    debug!(target = %address, "probe timed out");
                    false
                }
            };

            tracker.record_probe(&address, ok);
        }
    })
}
