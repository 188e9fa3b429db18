//! Driven port for the remote user-profile endpoint.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::domain::{TenantId, UserKey};

use super::RemoteCallError;

/// Remote user-profile operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    /// Fetch the remote profile document, `None` when the server has none.
    async fn fetch_profile(
        &self,
        user_key: &UserKey,
    ) -> Result<Option<Map<String, Value>>, RemoteCallError>;

    /// Replace the remote active-tenant pointer.
    async fn update_active_tenant(
        &self,
        user_key: &UserKey,
        tenant: &TenantId,
    ) -> Result<(), RemoteCallError>;

    /// Ask the server to copy the choice into identity-provider metadata.
    async fn choose_tenant(&self, tenant: &TenantId) -> Result<(), RemoteCallError>;
}
