//! Tenant registry service.
//!
//! The registry owns the local tenant partition. Reads are local-first; the
//! remote directory is consulted when the cache is empty or on an explicit
//! refresh.

use std::sync::Arc;
use std::time::Duration;

use mockable::Clock;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::document::{Document, KeyRange, RangeScan};
use super::ports::{DocumentStore, TenantDirectory};
use super::retry::{RetryPolicy, Sleeper};
use super::tenant::{TENANT_ID_PREFIX, Tenant, TenantId};
use super::upsert::{UpsertOutcome, upsert_document};
use super::Error;

/// Default bound for one directory fetch.
pub const DEFAULT_TENANT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// First write plus two conflict retries.
pub const DEFAULT_TENANT_UPSERT_ATTEMPTS: u32 = 3;

/// Tunables for [`TenantRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantRegistryConfig {
    /// Upper bound for one remote directory fetch.
    pub fetch_timeout: Duration,
    /// Conflict retry budget for each tenant upsert.
    pub upsert_policy: RetryPolicy,
}

impl Default for TenantRegistryConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_TENANT_FETCH_TIMEOUT,
            upsert_policy: RetryPolicy::immediate(DEFAULT_TENANT_UPSERT_ATTEMPTS),
        }
    }
}

/// Local cache of the tenants the signed-in user belongs to.
#[derive(Clone)]
pub struct TenantRegistry {
    store: Arc<dyn DocumentStore>,
    directory: Arc<dyn TenantDirectory>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    config: TenantRegistryConfig,
}

impl TenantRegistry {
    /// Build a registry over the tenant partition.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        directory: Arc<dyn TenantDirectory>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        config: TenantRegistryConfig,
    ) -> Self {
        Self {
            store,
            directory,
            clock,
            sleeper,
            config,
        }
    }

    /// Fetch the remote directory and upsert every tenant locally.
    ///
    /// Returns the tenants as received, in key order. Records without an
    /// identifier are skipped; a tenant whose write keeps conflicting is
    /// left to the concurrent writer.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Unauthorized`](super::ErrorCode::Unauthorized) when no
    /// token is available or the server rejects it,
    /// [`ErrorCode::Unreachable`](super::ErrorCode::Unreachable) on transport
    /// failure or timeout.
    pub async fn refresh_from_remote(&self) -> Result<Vec<Tenant>, Error> {
        let records = self.fetch_directory().await?;
        let now = self.clock.utc();
        let mut tenants = Vec::with_capacity(records.len());
        for record in &records {
            let mut tenant = match Tenant::from_remote(record) {
                Ok(tenant) => tenant,
                Err(error) => {
                    warn!(%error, "skipping tenant directory entry");
                    continue;
                }
            };
            tenant.synced_at = Some(now);
            self.store_remote_tenant(&tenant).await?;
            tenants.push(tenant);
        }
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        tenants.dedup_by(|a, b| a.id == b.id);
        info!(count = tenants.len(), "tenant directory refreshed");
        Ok(tenants)
    }

    /// Non-deleted tenants from the local partition, in key order.
    pub async fn list_local(&self) -> Result<Vec<Tenant>, Error> {
        let documents = RangeScan::new(self.store.as_ref(), KeyRange::prefix(TENANT_ID_PREFIX))
            .collect()
            .await?;
        Ok(documents
            .iter()
            .filter_map(|document| parse_local(document))
            .filter(|tenant| !tenant.is_deleted())
            .collect())
    }

    /// Local tenants, or a remote refresh when the cache is empty.
    pub async fn get_tenants(&self) -> Result<Vec<Tenant>, Error> {
        let local = self.list_local().await?;
        if !local.is_empty() {
            return Ok(local);
        }
        debug!("no cached tenants; fetching directory");
        self.refresh_from_remote().await?;
        self.list_local().await
    }

    /// Locate a live tenant by identifier in either spelling.
    pub async fn find(&self, tenant_id: &TenantId) -> Result<Option<Tenant>, Error> {
        let document = super::ports::find_document(self.store.as_ref(), &tenant_id.document_id())
            .await?;
        Ok(document
            .as_ref()
            .and_then(parse_local)
            .filter(|tenant| !tenant.is_deleted()))
    }

    /// Merge one tenant record from the directory change feed.
    ///
    /// Returns `true` when the local record changed. Records that fail
    /// validation are skipped.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn merge_remote_tenant(&self, record: &Map<String, Value>) -> Result<bool, Error> {
        let mut tenant = match Tenant::from_remote(record) {
            Ok(tenant) => tenant,
            Err(error) => {
                warn!(%error, "skipping tenant change");
                return Ok(false);
            }
        };
        tenant.synced_at = Some(self.clock.utc());
        self.store_remote_tenant(&tenant).await
    }

    /// Stamp a deletion time on the local record; it is never removed.
    ///
    /// Returns `true` when the record was live before the call.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn mark_deleted(&self, tenant_id: &TenantId) -> Result<bool, Error> {
        let now = self.clock.utc();
        let outcome = upsert_document(
            self.store.as_ref(),
            &tenant_id.document_id(),
            &self.config.upsert_policy,
            self.sleeper.as_ref(),
            |current| {
                let mut tenant = current.and_then(parse_local)?;
                if tenant.is_deleted() {
                    return None;
                }
                tenant.deleted_at = Some(now);
                tenant.synced_at = Some(now);
                Some(tenant.to_document().body)
            },
        )
        .await?;
        let deleted = matches!(outcome, UpsertOutcome::Written(_));
        if deleted {
            info!(tenant_id = %tenant_id, "tenant soft-deleted by directory change");
        }
        Ok(deleted)
    }

    async fn fetch_directory(&self) -> Result<Vec<Map<String, Value>>, Error> {
        let timeout = self.config.fetch_timeout;
        match tokio::time::timeout(timeout, self.directory.list_tenants()).await {
            Ok(Ok(records)) => Ok(records),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(Error::unreachable(format!(
                "tenant directory did not answer within {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn store_remote_tenant(&self, tenant: &Tenant) -> Result<bool, Error> {
        let wanted = tenant.to_document();
        let outcome = upsert_document(
            self.store.as_ref(),
            &wanted.id,
            &self.config.upsert_policy,
            self.sleeper.as_ref(),
            |current| match current.and_then(parse_local) {
                Some(existing) if existing.same_content(tenant) => None,
                _ => Some(wanted.body.clone()),
            },
        )
        .await?;
        match outcome {
            UpsertOutcome::Written(_) => Ok(true),
            UpsertOutcome::Unchanged => Ok(false),
            UpsertOutcome::Abandoned => {
                warn!(tenant_id = %tenant.id, "tenant upsert lost to concurrent writer");
                Ok(false)
            }
        }
    }
}

fn parse_local(document: &Document) -> Option<Tenant> {
    match Tenant::from_document(document) {
        Ok(tenant) => Some(tenant),
        Err(error) => {
            debug!(document_id = %document.id, %error, "ignoring unreadable tenant record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit coverage for the registry's cache-first behaviour.

    use super::*;
    use crate::domain::ErrorCode;
    use crate::domain::ports::{MockTenantDirectory, RemoteCallError};
    use crate::outbound::persistence::MemoryDocumentStore;
    use crate::test_support::{ImmediateSleeper, MutableClock, fixed_now};
    use rstest::rstest;
    use serde_json::json;

    fn record(value: Value) -> Map<String, Value> {
        let Value::Object(map) = value else {
            panic!("object literal");
        };
        map
    }

    fn registry(store: Arc<MemoryDocumentStore>, directory: MockTenantDirectory) -> TenantRegistry {
        TenantRegistry::new(
            store,
            Arc::new(directory),
            Arc::new(MutableClock::new(fixed_now())),
            Arc::new(ImmediateSleeper),
            TenantRegistryConfig::default(),
        )
    }

    #[tokio::test]
    async fn get_tenants_prefers_local_cache() {
        let store = Arc::new(MemoryDocumentStore::new());
        store
            .put(&Tenant::new(TenantId::new("t1").expect("id"), "Acme").to_document())
            .await
            .expect("seed");
        let mut directory = MockTenantDirectory::new();
        directory.expect_list_tenants().never();

        let tenants = registry(store, directory)
            .get_tenants()
            .await
            .expect("cached tenants");
        assert_eq!(tenants.len(), 1);
        assert_eq!(tenants[0].name, "Acme");
    }

    #[tokio::test]
    async fn get_tenants_falls_back_to_remote_and_skips_entries_without_id() {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut directory = MockTenantDirectory::new();
        directory.expect_list_tenants().times(1).returning(|| {
            Ok(vec![
                record(json!({ "tenantId": "tenant_t2", "name": "Zed" })),
                record(json!({ "name": "No id" })),
                record(json!({ "id": "t1", "name": "Acme", "userIds": ["u1"] })),
            ])
        });

        let tenants = registry(Arc::clone(&store), directory)
            .get_tenants()
            .await
            .expect("remote tenants");
        let ids: Vec<_> = tenants.iter().map(|tenant| tenant.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        assert_eq!(tenants[0].synced_at, Some(fixed_now()));
    }

    #[rstest]
    #[case::unauthorized(RemoteCallError::unauthorized("no token"), ErrorCode::Unauthorized)]
    #[case::forbidden(RemoteCallError::forbidden("denied"), ErrorCode::Unauthorized)]
    #[case::offline(RemoteCallError::transport("refused"), ErrorCode::Unreachable)]
    #[tokio::test]
    async fn remote_failures_map_to_domain_codes(
        #[case] failure: RemoteCallError,
        #[case] expected: ErrorCode,
    ) {
        let mut directory = MockTenantDirectory::new();
        directory
            .expect_list_tenants()
            .returning(move || Err(failure.clone()));

        let error = registry(Arc::new(MemoryDocumentStore::new()), directory)
            .refresh_from_remote()
            .await
            .expect_err("refresh fails");
        assert_eq!(error.code(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_directory_times_out_as_unreachable() {
        struct Hanging;

        #[async_trait::async_trait]
        impl TenantDirectory for Hanging {
            async fn list_tenants(&self) -> Result<Vec<Map<String, Value>>, RemoteCallError> {
                std::future::pending().await
            }
        }

        let registry = TenantRegistry::new(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(Hanging),
            Arc::new(MutableClock::new(fixed_now())),
            Arc::new(ImmediateSleeper),
            TenantRegistryConfig::default(),
        );
        let error = registry.refresh_from_remote().await.expect_err("times out");
        assert_eq!(error.code(), ErrorCode::Unreachable);
    }

    #[tokio::test]
    async fn find_matches_either_spelling_and_hides_deleted() {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut deleted = Tenant::new(TenantId::new("t9").expect("id"), "Gone");
        deleted.deleted_at = Some(fixed_now());
        store.put(&deleted.to_document()).await.expect("seed");
        store
            .put(&Tenant::new(TenantId::new("t1").expect("id"), "Acme").to_document())
            .await
            .expect("seed");
        let registry = registry(store, MockTenantDirectory::new());

        let found = registry
            .find(&TenantId::new("tenant_t1").expect("id"))
            .await
            .expect("lookup");
        assert_eq!(found.map(|tenant| tenant.name), Some("Acme".to_owned()));
        assert_eq!(
            registry
                .find(&TenantId::new("t9").expect("id"))
                .await
                .expect("lookup"),
            None
        );
    }

    #[tokio::test]
    async fn deleted_change_soft_deletes_once() {
        let store = Arc::new(MemoryDocumentStore::new());
        store
            .put(&Tenant::new(TenantId::new("t1").expect("id"), "Acme").to_document())
            .await
            .expect("seed");
        let registry = registry(Arc::clone(&store), MockTenantDirectory::new());
        let id = TenantId::new("t1").expect("id");

        assert!(registry.mark_deleted(&id).await.expect("first delete"));
        assert!(!registry.mark_deleted(&id).await.expect("second delete"));

        assert!(registry.list_local().await.expect("list").is_empty());
        let stored = store
            .get(&id.document_id())
            .await
            .expect("record kept");
        let tenant = Tenant::from_document(&stored).expect("tenant");
        assert_eq!(tenant.deleted_at, Some(fixed_now()));
    }

    #[tokio::test]
    async fn merging_identical_content_reports_no_change() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(Arc::clone(&store), MockTenantDirectory::new());
        let change = record(json!({ "_id": "tenant_t1", "type": "tenant", "name": "Acme" }));

        assert!(registry.merge_remote_tenant(&change).await.expect("first merge"));
        assert!(!registry.merge_remote_tenant(&change).await.expect("replayed merge"));
        assert!(
            !registry
                .merge_remote_tenant(&record(json!({ "name": "No id" })))
                .await
                .expect("invalid change is skipped")
        );
    }
}
