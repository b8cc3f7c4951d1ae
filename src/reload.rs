//! Configuration reload.
//!
//! A reload re-reads the configuration file with the environment captured at
//! startup and applies upstreams, routes, strangler splits and probes. A file
//! that fails to load or validate leaves the running configuration as it was.
//! Listener addresses, timeouts and broker settings only change on restart.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::admin::AdminState;
use crate::config::{Config, EnvSnapshot};
use crate::health::ProbeSupervisor;
use crate::matcher::RouteMatcher;
use crate::router::GatewayRouter;
use crate::Result;

/// Probe supervisor shared by the binary and the reloader.
pub type SharedProbes = Arc<Mutex<ProbeSupervisor>>;

#[derive(Debug)]
pub struct Reloader {
    config_path: PathBuf,
    env: EnvSnapshot,
    router: Arc<GatewayRouter>,
    admin: Arc<AdminState>,
    probes: Option<SharedProbes>,
}

impl Reloader {
    pub fn new(
        config_path: impl Into<PathBuf>,
        env: EnvSnapshot,
        router: Arc<GatewayRouter>,
        admin: Arc<AdminState>,
        probes: Option<SharedProbes>,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            env,
            router,
            admin,
            probes,
        }
    }

    /// Re-reads the file and applies it. Returns the new registry version.
    pub fn reload(&self) -> Result<u64> {
        let config = Config::load_from_file(&self.config_path, &self.env)?.into_runtime()?;

        self.router
            .reload(RouteMatcher::new(config.routes), config.upstreams)?;
        self.admin.replace_splits(config.splits);
        if let Some(probes) = &self.probes {
            probes.lock().unwrap_or_else(PoisonError::into_inner).sync();
        }

        let version = self.router.registry().snapshot().version();
        info!(path = %self.config_path.display(), version, "configuration reloaded");
        Ok(version)
    }
}
