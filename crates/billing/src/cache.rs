//! Tenant display-name cache
//!
//! Purely an optimization for notification and log enrichment. A miss reads
//! the store; a disabled cache reads the store every time.

use std::sync::Arc;

use moka::future::Cache;
use uuid::Uuid;

use crate::config::CacheSettings;
use crate::error::BillingResult;
use crate::store::BillingStore;

#[derive(Clone)]
pub struct TenantNameCache {
    names: Option<Cache<Uuid, String>>,
}

impl std::fmt::Debug for TenantNameCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantNameCache")
            .field("enabled", &self.names.is_some())
            .field("entries", &self.entry_count())
            .finish()
    }
}

impl TenantNameCache {
    pub fn new(settings: &CacheSettings) -> Self {
        if settings.max_entries == 0 {
            return Self::disabled();
        }
        let names = Cache::builder()
            .max_capacity(settings.max_entries)
            .time_to_live(settings.ttl)
            .build();
        Self { names: Some(names) }
    }

    pub fn disabled() -> Self {
        Self { names: None }
    }

    pub fn entry_count(&self) -> u64 {
        self.names.as_ref().map_or(0, |c| c.entry_count())
    }

    /// Display name of `tenant_id`, `None` when the tenant does not exist
    pub async fn name_of(
        &self,
        store: &Arc<dyn BillingStore>,
        tenant_id: Uuid,
    ) -> BillingResult<Option<String>> {
        if let Some(cache) = &self.names {
            if let Some(name) = cache.get(&tenant_id).await {
                return Ok(Some(name));
            }
        }

        let name = store.find_tenant(tenant_id).await?.map(|t| t.name);
        if let (Some(cache), Some(name)) = (&self.names, &name) {
            cache.insert(tenant_id, name.clone()).await;
        }
        Ok(name)
    }

    pub async fn invalidate(&self, tenant_id: Uuid) {
        if let Some(cache) = &self.names {
            cache.invalidate(&tenant_id).await;
        }
    }
}
