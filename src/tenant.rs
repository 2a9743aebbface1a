use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::admission::RateLimiter;
use crate::config::Config;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reconciler::{Reconciler, ReconcilerHandle};
use crate::service::BookingService;
use crate::sinks::JsonlSink;

/// Everything one tenant owns: its engine and WAL, its notice hub, and the
/// reconciler sweeping it.
pub struct Tenant {
    pub name: String,
    pub engine: Arc<Engine>,
    pub hub: Arc<NotifyHub>,
}

/// Manages per-tenant engines, created lazily on first use.
/// The rate limiter is shared, so a caller's budget spans tenants.
pub struct TenantManager {
    tenants: DashMap<String, Arc<Tenant>>,
    reconcilers: Mutex<Vec<ReconcilerHandle>>,
    data_dir: PathBuf,
    config: Arc<Config>,
    limiter: Arc<RateLimiter>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, config: Arc<Config>) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        Self {
            tenants: DashMap::new(),
            reconcilers: Mutex::new(Vec::new()),
            data_dir,
            config,
            limiter,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    /// Get or lazily create a tenant, replaying its WAL and starting its reconciler.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Tenant>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
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
        if let Some(existing) = self.tenants.get(&safe_name) {
            return Ok(existing.value().clone());
        }
        // Checked before taking the entry: len() locks every shard.
        if self.tenants.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        let created = match self.tenants.entry(safe_name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let tenant = self.open_tenant(&safe_name)?;
                slot.insert(tenant.clone());
                tenant
            }
        };
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        Ok(created)
    }

    fn open_tenant(&self, name: &str) -> std::io::Result<Arc<Tenant>> {
        let wal_path = self.data_dir.join(format!("{name}.wal"));
        let hub = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, hub.clone(), self.config.engine)?);

        let reconciler = Arc::new(Reconciler::new(
            name,
            engine.clone(),
            self.config.reconciler.clone(),
            Arc::new(JsonlSink::new(self.data_dir.join(format!("{name}.archive.jsonl")))),
            Arc::new(JsonlSink::new(self.data_dir.join(format!("{name}.stats.jsonl")))),
        ));
        let handle = reconciler.spawn();
        self.reconcilers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);

        info!(tenant = name, "tenant opened");
        Ok(Arc::new(Tenant {
            name: name.to_string(),
            engine,
            hub,
        }))
    }

    /// Request facade for one tenant, sharing this manager's rate limiter.
    pub fn service(&self, tenant: &str) -> std::io::Result<BookingService> {
        let tenant = self.get_or_create(tenant)?;
        Ok(BookingService::new(tenant.engine.clone(), self.limiter.clone()))
    }

    /// Open every tenant that already has a WAL in the data directory.
    pub fn load_existing(&self) -> std::io::Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wal") {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                self.get_or_create(name)?;
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Drop notice channels nobody listens to any more, across all tenants.
    pub fn prune_channels(&self) -> usize {
        self.tenants.iter().map(|t| t.hub.prune()).sum()
    }

    /// Stop every reconciler and wait for in-flight sweeps.
    pub async fn shutdown(&self) {
        let handles = std::mem::take(
            &mut *self
                .reconcilers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let count = handles.len();
        for handle in handles {
            handle.shutdown().await;
        }
        info!(reconcilers = count, "reconcilers stopped");
    }
}
