//! Driven port for the remote tenant directory.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::RemoteCallError;

/// Remote listing of the tenants the current identity belongs to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Return raw tenant documents exactly as the directory sends them.
    async fn list_tenants(&self) -> Result<Vec<Map<String, Value>>, RemoteCallError>;
}
