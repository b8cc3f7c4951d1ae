//! Weighted target selection.
//!
//! Each selectable target owns a slice of the cumulative range
//! `[0, total_weight)`, laid out in registration order. A point in that range
//! is either drawn uniformly per request or derived from a stable request
//! attribute (`hash mod total`), and the target whose slice contains it wins.
//!
//! Unhealthy targets and targets with weight zero are left out before the
//! range is built, so the remaining weights are renormalized implicitly.

use std::hash::{DefaultHasher, Hash, Hasher};

use hyper::http::uri::Authority;
use rand::Rng;

use crate::registry::{Target, Upstream};
use crate::{GatewayError, Result};

/// How the selection point is chosen for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// Uniformly random point.
    Random,
    /// Point derived from a hash of a stable request attribute.
    Sticky(u64),
}

impl Affinity {
    /// Derives a sticky affinity from any hashable request attribute.
    pub fn from_key<K: Hash + ?Sized>(key: &K) -> Self {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        Self::Sticky(hasher.finish())
    }
}

/// Stateless weighted selector over a registry [`Upstream`].
///
/// Safe to share across request handlers; it only reads the upstream it is
/// given and never mutates weights or health.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedSelector;

impl WeightedSelector {
    pub fn new() -> Self {
        Self
    }

    /// Selects one target honoring weight ratios.
    ///
    /// Fails with [`GatewayError::NoHealthyTarget`] if no target is healthy
    /// with a positive weight.
    pub fn select(&self, upstream: &Upstream, affinity: Affinity) -> Result<Target> {
        self.select_excluding(upstream, affinity, &[])
    }

    /// Selects a target, skipping the given addresses (used when retrying
    /// after a forwarding failure).
    pub fn select_excluding(
        &self,
        upstream: &Upstream,
        affinity: Affinity,
        excluded: &[Authority],
    ) -> Result<Target> {
        let candidates = upstream
            .targets()
            .iter()
            .filter(|t| t.weight > 0 && t.health.is_selectable())
            .filter(|t| !excluded.contains(&t.address))
            .collect::<Vec<&Target>>();

        let total: u64 = candidates.iter().map(|t| u64::from(t.weight)).sum();
        if total == 0 {
            return Err(GatewayError::NoHealthyTarget {
                upstream: upstream.id().to_owned(),
            });
        }

        let point = match affinity {
            Affinity::Random => rand::thread_rng().gen_range(0..total),
            Affinity::Sticky(hash) => hash % total,
        };

        pick(&candidates, point)
            .cloned()
            .ok_or_else(|| GatewayError::NoHealthyTarget {
                upstream: upstream.id().to_owned(),
            })
    }
}

/// Walks the cumulative slices and returns the target containing `point`.
fn pick<'a>(candidates: &[&'a Target], mut point: u64) -> Option<&'a Target> {
    for target in candidates {
        let weight = u64::from(target.weight);
        if point < weight {
            return Some(target);
        }
        point -= weight;
    }
    None
}
