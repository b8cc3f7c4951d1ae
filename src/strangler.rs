//! Legacy/modern percentage split over a two-target upstream.
//!
//! `P` percent of traffic goes to the legacy target and `100 - P` to the
//! modern one. The split is plain weighted selection; this module only turns a
//! percentage into the two weights and applies them in one registry write.

use hyper::http::uri::Authority;
use tracing::info;

use crate::registry::TargetRegistry;
use crate::{GatewayError, Result};

/// Addresses of the two sides of a strangler migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StranglerSplit {
    upstream: String,
    legacy: Authority,
    modern: Authority,
}

impl StranglerSplit {
    pub fn new(upstream: impl Into<String>, legacy: Authority, modern: Authority) -> Self {
        Self {
            upstream: upstream.into(),
            legacy,
            modern,
        }
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn legacy(&self) -> &Authority {
        &self.legacy
    }

    pub fn modern(&self) -> &Authority {
        &self.modern
    }

    /// Target weights for `legacy_percent`, legacy first.
    pub fn weights(&self, legacy_percent: u32) -> Result<[(Authority, u32); 2]> {
        if legacy_percent > 100 {
            return Err(GatewayError::Config(format!(
                "legacy percentage for {} must be between 0 and 100, got {legacy_percent}",
                self.upstream
            )));
        }
        Ok([
            (self.legacy.clone(), legacy_percent),
            (self.modern.clone(), 100 - legacy_percent),
        ])
    }

    /// Moves the split to `legacy_percent` in a single registry write.
    pub fn apply(&self, registry: &TargetRegistry, legacy_percent: u32) -> Result<()> {
        let weights = self.weights(legacy_percent)?;
        registry.update_weights(&self.upstream, &weights)?;
        info!(
            upstream = %self.upstream,
            legacy = %self.legacy,
            modern = %self.modern,
            legacy_percent,
            "strangler split updated"
        );
        Ok(())
    }
}
