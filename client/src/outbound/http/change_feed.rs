//! `/__users/_changes` and `/__tenants/_changes` adapter.

use async_trait::async_trait;

use super::dto::ChangesResponseDto;
use super::transport::SyncServerClient;
use crate::domain::ports::{ChangeBatch, ChangeFeedSource, FeedName, RemoteCallError};

fn feed_root(feed: FeedName) -> &'static str {
    match feed {
        FeedName::UserProfiles => "__users",
        FeedName::TenantDirectory => "__tenants",
    }
}

#[async_trait]
impl ChangeFeedSource for SyncServerClient {
    async fn fetch_changes(
        &self,
        feed: FeedName,
        since: u64,
    ) -> Result<ChangeBatch, RemoteCallError> {
        let tokens = self.since_tokens(feed);
        let mut url = self.endpoint(&[feed_root(feed), "_changes"])?;
        url.query_pairs_mut()
            .append_pair("since", &tokens.since_param(since))
            .append_pair("include_docs", "true");
        let decoded: ChangesResponseDto = self.get_json(url).await?;
        tokens.remember(&decoded);
        decoded.into_batch().map_err(RemoteCallError::decode)
    }
}
