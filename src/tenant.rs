use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::engine::{Engine, EngineSettings};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::sweeper::{self, SweepSettings};

/// Manages per-tenant engines. Each tenant gets its own Engine, WAL and
/// background jobs. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: EngineSettings,
    sweep: SweepSettings,
    clock: Arc<dyn Clock>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: EngineSettings, sweep: SweepSettings) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
            sweep,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the time source handed to every engine created afterwards.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize to keep the WAL inside data_dir.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections racing on a fresh tenant must share one engine.
        let entry = self.engines.entry(tenant.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::with_clock(
            wal_path,
            Arc::new(NotifyHub::new()),
            self.settings.clone(),
            self.clock.clone(),
        )?);

        tokio::spawn(sweeper::run_status_updater(engine.clone(), self.sweep.interval));
        tokio::spawn(sweeper::run_compactor(engine.clone(), self.sweep.compact_threshold));
        tokio::spawn(sweeper::run_dispatcher(engine.clone()));

        entry.or_insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!(tenant = %safe_name, "tenant loaded");
        Ok(engine)
    }
}
