use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::engine::Engine;
use crate::limits::*;
use crate::model::SettingsRow;
use crate::notify::{self, Audience, NotifyHub};
use crate::scheduler;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// lifecycle scan + compactor + notice dispatcher.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    scan_interval: Duration,
    global: Option<Arc<SettingsRow>>,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        scan_interval: Duration,
        global: Option<Arc<SettingsRow>>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            scan_interval,
            global,
        }
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

        // Sanitize tenant name to prevent path traversal
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

        // Two connections racing on a new tenant must share one engine.
        let entry = self.engines.entry(tenant.to_string());
        if let dashmap::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let hub = Arc::new(NotifyHub::new());
        let notices = hub.subscribe(Audience::Business);
        let engine = Arc::new(Engine::new(wal_path, hub, self.global.clone())?);

        tokio::spawn(scheduler::run_lifecycle_scan(engine.clone(), self.scan_interval));
        tokio::spawn(scheduler::run_compactor(engine.clone(), self.compact_threshold));
        tokio::spawn(notify::run_log_dispatcher(notices, tenant.to_string()));

        entry.or_insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(tenant, "tenant loaded");
        Ok(engine)
    }
}
