//! Per-feed merge rules.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::domain::identity_binding::IdentityBinding;
use crate::domain::ports::{ChangeRecord, FeedName};
use crate::domain::tenant::TenantId;
use crate::domain::tenant_registry::TenantRegistry;
use crate::domain::{DocumentKind, Error, KIND_FIELD, UserKey};

/// How one feed's changes land in local storage.
#[async_trait]
pub trait FeedMerger: Send + Sync {
    /// Feed this merger consumes.
    fn feed(&self) -> FeedName;

    /// Work run at the start of every cycle, before fetching.
    async fn prepare(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Apply one change. Returns `true` when local content changed.
    async fn merge(&self, change: &ChangeRecord) -> Result<bool, Error>;
}

fn document_key(change: &ChangeRecord) -> Option<&str> {
    change.id.as_deref().or_else(|| {
        change
            .doc
            .as_ref()
            .and_then(|doc| doc.get("_id"))
            .and_then(Value::as_str)
    })
}

fn kind_tag(change: &ChangeRecord) -> Option<&str> {
    change
        .doc
        .as_ref()
        .and_then(|doc| doc.get(KIND_FIELD))
        .and_then(Value::as_str)
}

/// Live documents must carry the feed's kind tag. Tombstones usually arrive
/// untagged and are accepted unless they name another kind.
fn kind_matches(change: &ChangeRecord, kind: DocumentKind) -> bool {
    match kind_tag(change) {
        Some(tag) => tag == kind.as_str(),
        None => change.deleted,
    }
}

/// Applies the signed-in user's profile changes.
///
/// Other users' profiles are ignored. Each cycle first flushes a pending
/// local active-tenant pointer to the remote profile.
pub struct ProfileFeedMerger {
    binding: IdentityBinding,
    user_key: UserKey,
}

impl ProfileFeedMerger {
    /// Merger for `user_key`'s profile.
    pub fn new(binding: IdentityBinding, user_key: UserKey) -> Self {
        Self { binding, user_key }
    }
}

#[async_trait]
impl FeedMerger for ProfileFeedMerger {
    fn feed(&self) -> FeedName {
        FeedName::UserProfiles
    }

    async fn prepare(&self) -> Result<(), Error> {
        if self.binding.flush_pending_sync(&self.user_key).await? {
            debug!(user_key = %self.user_key, "pending active tenant reconciled");
        }
        Ok(())
    }

    async fn merge(&self, change: &ChangeRecord) -> Result<bool, Error> {
        if change.deleted || !kind_matches(change, DocumentKind::User) {
            return Ok(false);
        }
        if document_key(change).is_some_and(|key| !self.user_key.owns(key)) {
            return Ok(false);
        }
        let Some(doc) = change.doc.as_ref() else {
            return Ok(false);
        };
        self.binding.merge_remote_profile(&self.user_key, doc).await
    }
}

/// Applies tenant directory changes; deletions become soft deletions.
pub struct TenantFeedMerger {
    registry: TenantRegistry,
}

impl TenantFeedMerger {
    /// Merger writing through `registry`.
    pub fn new(registry: TenantRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl FeedMerger for TenantFeedMerger {
    fn feed(&self) -> FeedName {
        FeedName::TenantDirectory
    }

    async fn merge(&self, change: &ChangeRecord) -> Result<bool, Error> {
        if !kind_matches(change, DocumentKind::Tenant) {
            return Ok(false);
        }
        if change.deleted {
            let Some(tenant_id) = document_key(change).and_then(|key| TenantId::new(key).ok())
            else {
                debug!(sequence = change.sequence, "deleted change without tenant id");
                return Ok(false);
            };
            return self.registry.mark_deleted(&tenant_id).await;
        }
        let Some(doc) = change.doc.as_ref() else {
            return Ok(false);
        };
        self.registry.merge_remote_tenant(doc).await
    }
}
