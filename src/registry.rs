//! Target registry: the single owner of upstreams and their weighted targets.
//!
//! Readers load an immutable [`RegistrySnapshot`] through [`ArcSwap`] and never
//! block. Writers serialize on a mutex, clone the current snapshot (a map of
//! `Arc<Upstream>`, so only the touched upstream is copied), apply the change
//! and swap the new snapshot in. In-flight selections keep the snapshot they
//! loaded, so they always see a consistent view.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use hyper::http::uri::Authority;

use crate::{GatewayError, Result};

/// Observed health of a single target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// No probe result yet. Treated as healthy by the selector.
    Unknown,
}

impl HealthStatus {
    /// Returns `true` if the selector may send traffic to a target in this state.
    pub fn is_selectable(self) -> bool {
        !matches!(self, Self::Unhealthy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

/// Request attribute an upstream hashes on for sticky selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HashOn {
    /// Uniform random selection per request.
    #[default]
    None,
    /// Hash of the client IP address.
    ClientIp,
    /// Hash of the named request header, random when the header is absent.
    Header(String),
}

/// One concrete backend instance within an upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub address: Authority,
    /// Relative weight. Zero keeps the target registered but never selected.
    pub weight: u32,
    pub health: HealthStatus,
}

impl Target {
    /// Creates a target in the `Unknown` health state.
    pub fn new(address: Authority, weight: u32) -> Self {
        Self {
            address,
            weight,
            health: HealthStatus::Unknown,
        }
    }
}

/// A named group of weighted targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    id: String,
    hash_on: HashOn,
    targets: Vec<Target>,
}

impl Upstream {
    /// Builds an upstream, enforcing that it has at least one target, unique
    /// addresses and a positive weight total.
    pub fn new(id: impl Into<String>, hash_on: HashOn, targets: Vec<Target>) -> Result<Self> {
        let upstream = Self {
            id: id.into(),
            hash_on,
            targets,
        };
        upstream.validate()?;
        Ok(upstream)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hash_on(&self) -> &HashOn {
        &self.hash_on
    }

    /// Targets in registration order.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn target(&self, address: &Authority) -> Option<&Target> {
        self.targets.iter().find(|t| &t.address == address)
    }

    pub fn total_weight(&self) -> u64 {
        self.targets.iter().map(|t| u64::from(t.weight)).sum()
    }

    fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(GatewayError::Config(format!(
                "upstream {} must have at least one target",
                self.id
            )));
        }

        for (idx, target) in self.targets.iter().enumerate() {
            if self.targets[..idx]
                .iter()
                .any(|prev| prev.address == target.address)
            {
                return Err(GatewayError::Config(format!(
                    "upstream {} lists target {} more than once",
                    self.id, target.address
                )));
            }
        }

        if self.total_weight() == 0 {
            return Err(GatewayError::Config(format!(
                "upstream {} must have a positive total weight",
                self.id
            )));
        }

        Ok(())
    }
}

/// An immutable, versioned view of every registered upstream.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    version: u64,
    upstreams: BTreeMap<String, Arc<Upstream>>,
}

impl RegistrySnapshot {
    /// Monotonic counter bumped by every successful write.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Upstream>> {
        self.upstreams.get(id)
    }

    pub fn upstreams(&self) -> impl Iterator<Item = &Arc<Upstream>> {
        self.upstreams.values()
    }
}

/// Shared registry of upstreams with copy-on-write updates.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    current: ArcSwap<RegistrySnapshot>,
    writer: Mutex<()>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry pre-populated with the given upstreams.
    pub fn from_upstreams(upstreams: Vec<Upstream>) -> Result<Self> {
        let registry = Self::new();
        registry.reinitialize(upstreams)?;
        Ok(registry)
    }

    /// Registers (or replaces) an upstream with default hashing.
    pub fn register(&self, upstream_id: &str, targets: Vec<Target>) -> Result<()> {
        self.register_upstream(Upstream::new(upstream_id, HashOn::None, targets)?)
    }

    /// Registers (or replaces) a fully described upstream.
    pub fn register_upstream(&self, upstream: Upstream) -> Result<()> {
        upstream.validate()?;
        self.write(|snapshot| {
            snapshot
                .upstreams
                .insert(upstream.id.clone(), Arc::new(upstream));
            Ok(())
        })
    }

    /// Returns the current state of an upstream.
    pub fn get(&self, upstream_id: &str) -> Result<Arc<Upstream>> {
        self.current
            .load()
            .get(upstream_id)
            .cloned()
            .ok_or_else(|| upstream_not_found(upstream_id))
    }

    pub fn contains(&self, upstream_id: &str) -> bool {
        self.current.load().get(upstream_id).is_some()
    }

    /// Returns the full current snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    /// Changes the weight of a single target.
    ///
    /// Rejects updates that would leave the upstream with a zero weight total.
    pub fn update_weight(&self, upstream_id: &str, address: &Authority, weight: u32) -> Result<()> {
        self.update_weights(upstream_id, &[(address.clone(), weight)])
    }

    /// Applies several weight changes to one upstream in a single write, so
    /// readers never observe a partially applied split.
    pub fn update_weights(&self, upstream_id: &str, weights: &[(Authority, u32)]) -> Result<()> {
        self.write(|snapshot| {
            let entry = snapshot
                .upstreams
                .get_mut(upstream_id)
                .ok_or_else(|| upstream_not_found(upstream_id))?;

            let mut updated = Upstream::clone(entry);
            for (address, weight) in weights {
                let target = updated
                    .targets
                    .iter_mut()
                    .find(|t| &t.address == address)
                    .ok_or_else(|| target_not_found(address))?;
                target.weight = *weight;
            }

            if updated.total_weight() == 0 {
                return Err(GatewayError::Config(format!(
                    "weight update would leave upstream {upstream_id} with zero total weight"
                )));
            }

            *entry = Arc::new(updated);
            Ok(())
        })
    }

    /// Sets the health of every registered target with the given address.
    ///
    /// Returns `true` if at least one target changed state.
    pub fn set_health(&self, address: &Authority, status: HealthStatus) -> Result<bool> {
        self.write(|snapshot| {
            let mut found = false;
            let mut changed = false;

            for entry in snapshot.upstreams.values_mut() {
                let Some(idx) = entry.targets.iter().position(|t| &t.address == address) else {
                    continue;
                };
                found = true;
                if entry.targets[idx].health != status {
                    Arc::make_mut(entry).targets[idx].health = status;
                    changed = true;
                }
            }

            if found {
                Ok(changed)
            } else {
                Err(target_not_found(address))
            }
        })
    }

    /// Returns the health of the first registered target with the given address.
    pub fn health_of(&self, address: &Authority) -> Option<HealthStatus> {
        self.current
            .load()
            .upstreams()
            .find_map(|u| u.target(address).map(|t| t.health))
    }

    /// Returns every distinct target address across all upstreams.
    pub fn addresses(&self) -> Vec<Authority> {
        let snapshot = self.current.load();
        let mut addresses: Vec<Authority> = Vec::new();
        for target in snapshot.upstreams().flat_map(|u| u.targets()) {
            if !addresses.contains(&target.address) {
                addresses.push(target.address.clone());
            }
        }
        addresses
    }

    /// Replaces every upstream at once.
    ///
    /// Health of targets that survive is carried over.
    pub fn reinitialize(&self, upstreams: Vec<Upstream>) -> Result<()> {
        for upstream in &upstreams {
            upstream.validate()?;
        }

        self.write(|snapshot| {
            let previous = std::mem::take(&mut snapshot.upstreams);
            for upstream in upstreams {
                insert_carrying_health(&mut snapshot.upstreams, &previous, upstream);
            }
            Ok(())
        })
    }

    /// Adds or replaces the given upstreams and leaves every other one in
    /// place, so routes that still name them keep resolving.
    ///
    /// Health of targets that survive is carried over. Nothing changes if any
    /// upstream is invalid.
    pub fn merge(&self, upstreams: Vec<Upstream>) -> Result<()> {
        for upstream in &upstreams {
            upstream.validate()?;
        }

        self.write(|snapshot| {
            let previous = snapshot.upstreams.clone();
            for upstream in upstreams {
                insert_carrying_health(&mut snapshot.upstreams, &previous, upstream);
            }
            Ok(())
        })
    }

    /// Removes every upstream whose id is not in `keep`. Returns the removed ids.
    pub fn retain(&self, keep: &[&str]) -> Result<Vec<String>> {
        self.write(|snapshot| {
            let removed = snapshot
                .upstreams
                .keys()
                .filter(|id| !keep.contains(&id.as_str()))
                .cloned()
                .collect::<Vec<_>>();
            for id in &removed {
                snapshot.upstreams.remove(id);
            }
            Ok(removed)
        })
    }

    fn write<T>(&self, apply: impl FnOnce(&mut RegistrySnapshot) -> Result<T>) -> Result<T> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = RegistrySnapshot::clone(&self.current.load());
        let out = apply(&mut next)?;
        next.version += 1;
        self.current.store(Arc::new(next));
        Ok(out)
    }
}

fn insert_carrying_health(
    upstreams: &mut BTreeMap<String, Arc<Upstream>>,
    previous: &BTreeMap<String, Arc<Upstream>>,
    mut upstream: Upstream,
) {
    if let Some(old) = previous.get(&upstream.id) {
        for target in &mut upstream.targets {
            if let Some(existing) = old.target(&target.address) {
                target.health = existing.health;
            }
        }
    }
    upstreams.insert(upstream.id.clone(), Arc::new(upstream));
}

fn upstream_not_found(id: &str) -> GatewayError {
    GatewayError::NotFound {
        kind: "upstream",
        key: id.to_owned(),
    }
}

fn target_not_found(address: &Authority) -> GatewayError {
    GatewayError::NotFound {
        kind: "target",
        key: address.to_string(),
    }
}
