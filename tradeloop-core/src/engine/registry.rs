use crate::config::TenantSettings;
use crate::engine::{TradeEngine, UsageReport};
use crate::types::{EngineError, EngineResult, TenantId};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Owner of all tenant engines.
///
/// Every handle the registry gives out is scoped to one tenant; there is no
/// cross-tenant iteration available to callers of the engine, which is what
/// keeps discovery (and everything else) tenant-isolated by construction.
pub struct TenantRegistry {
    tenants: DashMap<TenantId, Arc<TradeEngine>>,
    /// Base directory for tenants that opt into durability
    data_dir: Option<PathBuf>,
}

impl Default for TenantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantRegistry {
    /// In-memory-only registry; tenants carry no durability.
    pub fn new() -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir: None,
        }
    }

    /// Registry whose tenants persist under `data_dir/<tenant>/`. Creating a
    /// tenant that already has files there replays them first.
    pub fn with_persistence(data_dir: PathBuf) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir: Some(data_dir),
        }
    }

    /// Create a tenant. With a persistence base dir configured, the tenant is
    /// durable (and replays any state left by a previous incarnation).
    pub fn create_tenant(
        &self,
        tenant: &str,
        settings: TenantSettings,
    ) -> EngineResult<Arc<TradeEngine>> {
        self.create_tenant_inner(tenant, settings, true)
    }

    /// Create a tenant without durability even when the registry has a
    /// persistence dir. Persistence is an opt-in per tenant.
    pub fn create_tenant_transient(
        &self,
        tenant: &str,
        settings: TenantSettings,
    ) -> EngineResult<Arc<TradeEngine>> {
        self.create_tenant_inner(tenant, settings, false)
    }

    fn create_tenant_inner(
        &self,
        tenant: &str,
        settings: TenantSettings,
        durable: bool,
    ) -> EngineResult<Arc<TradeEngine>> {
        if tenant.is_empty() {
            return Err(EngineError::InvalidArgument("empty tenant id".into()));
        }
        // Tenant ids become directory names for persistent tenants.
        if tenant.contains(['/', '\\']) || tenant == "." || tenant == ".." {
            return Err(EngineError::InvalidArgument(format!(
                "tenant id {tenant} contains path separators"
            )));
        }
        if self.tenants.contains_key(tenant) {
            return Err(EngineError::InvalidArgument(format!(
                "tenant {tenant} already exists"
            )));
        }

        let engine = match (&self.data_dir, durable) {
            (Some(base), true) => {
                TradeEngine::open_persistent(tenant, settings, &base.join(tenant))?
            }
            _ => TradeEngine::new(tenant, settings)?,
        };
        let engine = Arc::new(engine);
        self.tenants.insert(tenant.to_string(), engine.clone());
        info!(tenant, "tenant created");
        Ok(engine)
    }

    /// Tear a tenant down, releasing all of its in-memory state. Files of a
    /// persistent tenant stay on disk for a later re-create.
    pub fn delete_tenant(&self, tenant: &str) -> EngineResult<()> {
        let (_, engine) = self
            .tenants
            .remove(tenant)
            .ok_or_else(|| EngineError::UnknownTenant(tenant.to_string()))?;
        engine.cancel_discoveries();
        info!(tenant, "tenant deleted");
        Ok(())
    }

    pub fn engine(&self, tenant: &str) -> EngineResult<Arc<TradeEngine>> {
        self.tenants
            .get(tenant)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EngineError::UnknownTenant(tenant.to_string()))
    }

    pub fn get_tenant_usage(&self, tenant: &str) -> EngineResult<UsageReport> {
        Ok(self.engine(tenant)?.usage())
    }

    pub fn update_tenant_settings(
        &self,
        tenant: &str,
        settings: TenantSettings,
    ) -> EngineResult<()> {
        self.engine(tenant)?.update_settings(settings)
    }

    pub fn tenant_ids(&self) -> Vec<TenantId> {
        let mut ids: Vec<TenantId> = self.tenants.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Drive every tenant's maintenance tick. The boundary calls this from
    /// its own interval timer.
    pub fn tick_all(&self, now: Instant) {
        for entry in self.tenants.iter() {
            entry.value().tick(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopFilter;
    use crate::types::NftMetadata;

    fn nft(id: &str) -> (String, NftMetadata) {
        (id.to_string(), NftMetadata::default())
    }

    fn load_swap(engine: &TradeEngine) {
        engine.submit_inventory("alice", vec![nft("n1")]).unwrap();
        engine.submit_inventory("bob", vec![nft("n2")]).unwrap();
        engine.submit_wants("alice", vec!["n2".to_string()], vec![]).unwrap();
        engine.submit_wants("bob", vec!["n1".to_string()], vec![]).unwrap();
    }

    #[test]
    fn test_create_and_duplicate() {
        let registry = TenantRegistry::new();
        registry.create_tenant("t1", TenantSettings::default()).unwrap();
        assert!(registry.create_tenant("t1", TenantSettings::default()).is_err());
        assert_eq!(registry.tenant_ids(), vec!["t1".to_string()]);
    }

    #[test]
    fn test_unknown_tenant() {
        let registry = TenantRegistry::new();
        assert!(matches!(
            registry.engine("ghost").unwrap_err(),
            EngineError::UnknownTenant(_)
        ));
        assert!(registry.delete_tenant("ghost").is_err());
    }

    #[test]
    fn test_tenant_isolation() {
        let registry = TenantRegistry::new();
        let t1 = registry.create_tenant("t1", TenantSettings::default()).unwrap();
        let t2 = registry.create_tenant("t2", TenantSettings::default()).unwrap();
        load_swap(&t1);
        load_swap(&t2);

        let (loops1, _, _) = t1.get_active_loops(&LoopFilter::All, 10, 0);
        let (loops2, _, _) = t2.get_active_loops(&LoopFilter::All, 10, 0);
        assert_eq!(loops1.len(), 1);
        assert_eq!(loops2.len(), 1);
        // Identical graphs produce the same canonical ids in both tenants.
        assert_eq!(loops1[0].canonical_id, loops2[0].canonical_id);

        // Retracting a want in t1 leaves t2 untouched.
        t1.remove_want("bob", crate::engine::WantTarget::Nft("n1".to_string()))
            .unwrap();
        let (loops1, _, _) = t1.get_active_loops(&LoopFilter::All, 10, 0);
        let (loops2, _, _) = t2.get_active_loops(&LoopFilter::All, 10, 0);
        assert!(loops1.is_empty());
        assert_eq!(loops2.len(), 1);
    }

    #[test]
    fn test_delete_releases_state() {
        let registry = TenantRegistry::new();
        let engine = registry.create_tenant("t1", TenantSettings::default()).unwrap();
        load_swap(&engine);
        registry.delete_tenant("t1").unwrap();
        assert!(registry.engine("t1").is_err());

        // Re-creating an in-memory tenant starts from scratch.
        let engine = registry.create_tenant("t1", TenantSettings::default()).unwrap();
        assert_eq!(engine.stats().graph.nodes, 0);
    }

    #[test]
    fn test_transient_tenant_skips_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantRegistry::with_persistence(dir.path().to_path_buf());
        let engine = registry
            .create_tenant_transient("t1", TenantSettings::default())
            .unwrap();
        load_swap(&engine);
        registry.delete_tenant("t1").unwrap();

        let engine = registry
            .create_tenant_transient("t1", TenantSettings::default())
            .unwrap();
        assert_eq!(engine.stats().graph.nodes, 0);
    }

    #[test]
    fn test_persistent_tenant_replays_on_recreate() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantRegistry::with_persistence(dir.path().to_path_buf());
        let engine = registry.create_tenant("t1", TenantSettings::default()).unwrap();
        load_swap(&engine);
        registry.delete_tenant("t1").unwrap();

        let engine = registry.create_tenant("t1", TenantSettings::default()).unwrap();
        assert_eq!(engine.stats().graph.nodes, 2);
        assert_eq!(engine.stats().graph.nfts, 2);

        // The replayed graph rediscovers its loop on the next event that
        // touches it (replayed wants are idempotent and produce no records).
        engine.submit_wants("carol", vec!["n1".to_string()], vec![]).unwrap();
        let (loops, _, _) = engine.get_active_loops(&LoopFilter::All, 10, 0);
        assert_eq!(loops.len(), 1);
    }
}
