//! `/__tenants` adapter.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::dto::TenantListDto;
use super::transport::SyncServerClient;
use crate::domain::ports::{RemoteCallError, TenantDirectory};

#[async_trait]
impl TenantDirectory for SyncServerClient {
    async fn list_tenants(&self) -> Result<Vec<Map<String, Value>>, RemoteCallError> {
        let url = self.endpoint(&["__tenants"])?;
        let decoded: TenantListDto = self.get_json(url).await?;
        Ok(decoded.into_records())
    }
}
