//! CouchDB-compatible replication target.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::{info, warn};

use super::dto::{BulkDocsDto, BulkResultDto, ChangesResponseDto, DatabaseInfoDto, SinceTokens};
use super::transport::SyncServerClient;
use crate::domain::Document;
use crate::domain::ports::{ChangeBatch, RemoteCallError, RemoteDocumentStore, RemoteInfo};

/// Remote database used as the other side of replication.
#[derive(Clone)]
pub struct CouchRemoteStore {
    client: SyncServerClient,
    database: String,
    skip_setup: bool,
    since_tokens: Arc<SinceTokens>,
}

impl CouchRemoteStore {
    /// Bind to `database` on the sync server.
    ///
    /// With `skip_setup` unset, a missing database is created on the first
    /// info probe.
    pub fn new(client: SyncServerClient, database: impl Into<String>, skip_setup: bool) -> Self {
        Self {
            client,
            database: database.into(),
            skip_setup,
            since_tokens: Arc::default(),
        }
    }

    async fn probe(&self) -> Result<RemoteInfo, RemoteCallError> {
        let url = self.client.endpoint(&[self.database.as_str()])?;
        let info: DatabaseInfoDto = self.client.get_json(url).await?;
        Ok(info.into_info())
    }
}

#[async_trait]
impl RemoteDocumentStore for CouchRemoteStore {
    async fn info(&self) -> Result<RemoteInfo, RemoteCallError> {
        match self.probe().await {
            Err(RemoteCallError::NotFound { .. }) if !self.skip_setup => {
                info!(database = %self.database, "creating remote database");
                let url = self.client.endpoint(&[self.database.as_str()])?;
                self.client
                    .send_unit::<Value>(Method::PUT, url, None)
                    .await?;
                self.probe().await
            }
            other => other,
        }
    }

    async fn changes_since(
        &self,
        since: u64,
        limit: usize,
    ) -> Result<ChangeBatch, RemoteCallError> {
        let mut url = self.client.endpoint(&[self.database.as_str(), "_changes"])?;
        url.query_pairs_mut()
            .append_pair("since", &self.since_tokens.since_param(since))
            .append_pair("include_docs", "true")
            .append_pair("limit", &limit.to_string());
        let decoded: ChangesResponseDto = self.client.get_json(url).await?;
        self.since_tokens.remember(&decoded);
        decoded.into_batch().map_err(RemoteCallError::decode)
    }

    async fn bulk_write(&self, documents: &[Document]) -> Result<(), RemoteCallError> {
        if documents.is_empty() {
            return Ok(());
        }
        let url = self.client.endpoint(&[self.database.as_str(), "_bulk_docs"])?;
        let payload = BulkDocsDto {
            docs: documents.iter().map(Document::to_json).collect(),
            new_edits: false,
        };
        let results: Vec<BulkResultDto> = self
            .client
            .send_json(Method::POST, url, &payload)
            .await?;
        for rejected in results.iter().filter(|result| result.error.is_some()) {
            warn!(
                document_id = rejected.id.as_deref().unwrap_or("<unknown>"),
                error = rejected.error.as_deref().unwrap_or_default(),
                reason = rejected.reason.as_deref().unwrap_or_default(),
                "remote rejected replicated document"
            );
        }
        Ok(())
    }
}
