//! `/__users` and `/choose-tenant` adapter.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Map, Value};

use super::dto::{ActiveTenantDto, ChooseTenantDto};
use super::transport::SyncServerClient;
use crate::domain::ports::{ProfileDirectory, RemoteCallError};
use crate::domain::{TenantId, UserKey};

const USERS_PATH: &str = "__users";
const CHOOSE_TENANT_PATH: &str = "choose-tenant";

#[async_trait]
impl ProfileDirectory for SyncServerClient {
    async fn fetch_profile(
        &self,
        user_key: &UserKey,
    ) -> Result<Option<Map<String, Value>>, RemoteCallError> {
        let url = self.endpoint(&[USERS_PATH, user_key.as_str()])?;
        match self.get_json::<Map<String, Value>>(url).await {
            Ok(profile) => Ok(Some(profile)),
            Err(RemoteCallError::NotFound { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn update_active_tenant(
        &self,
        user_key: &UserKey,
        tenant: &TenantId,
    ) -> Result<(), RemoteCallError> {
        let url = self.endpoint(&[USERS_PATH, user_key.as_str()])?;
        let payload = ActiveTenantDto {
            active_tenant_id: tenant.as_str(),
        };
        self.send_unit(Method::PUT, url, Some(&payload)).await
    }

    async fn choose_tenant(&self, tenant: &TenantId) -> Result<(), RemoteCallError> {
        let url = self.endpoint(&[CHOOSE_TENANT_PATH])?;
        let payload = ChooseTenantDto {
            tenant_id: tenant.as_str(),
        };
        self.send_unit(Method::POST, url, Some(&payload)).await
    }
}
