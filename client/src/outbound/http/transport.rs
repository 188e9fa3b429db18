//! Shared reqwest transport for every sync-server adapter.
//!
//! The transport owns URL building, bearer-token injection at send time, and
//! the mapping of transport and status failures onto [`RemoteCallError`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::dto::SinceTokens;
use crate::domain::ports::{FeedName, IdentityProvider, RemoteCallError, TokenRequest};

/// Connection to the sync server shared by the HTTP adapters.
#[derive(Clone)]
pub struct SyncServerClient {
    client: Client,
    base: Url,
    identity: Arc<dyn IdentityProvider>,
    profile_feed: Arc<SinceTokens>,
    tenant_feed: Arc<SinceTokens>,
}

impl SyncServerClient {
    /// Build a client with an explicit per-request timeout.
    /// ```rust,ignore
    /// let client = SyncServerClient::new(base_url, Duration::from_secs(10), identity);
    /// assert!(client.is_ok() || client.is_err());
    /// ```
    /// # Errors
    ///
    /// Returns an error when the reqwest client cannot be constructed.
    pub fn new(
        base: Url,
        timeout: Duration,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base,
            identity,
            profile_feed: Arc::default(),
            tenant_feed: Arc::default(),
        })
    }

    /// Base URL every path is joined onto.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub(super) fn since_tokens(&self, feed: FeedName) -> &SinceTokens {
        match feed {
            FeedName::UserProfiles => self.profile_feed.as_ref(),
            FeedName::TenantDirectory => self.tenant_feed.as_ref(),
        }
    }

    pub(super) fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteCallError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| {
                RemoteCallError::transport(format!("base URL {} cannot carry a path", self.base))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub(super) async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, RemoteCallError> {
        let body = self.send(self.client.get(url)).await?;
        decode(&body)
    }

    pub(super) async fn send_json<B, T>(
        &self,
        method: Method,
        url: Url,
        payload: &B,
    ) -> Result<T, RemoteCallError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = self
            .send(self.client.request(method, url).json(payload))
            .await?;
        decode(&body)
    }

    pub(super) async fn send_unit<B>(
        &self,
        method: Method,
        url: Url,
        payload: Option<&B>,
    ) -> Result<(), RemoteCallError>
    where
        B: Serialize + ?Sized,
    {
        let request = self.client.request(method, url);
        let request = match payload {
            Some(payload) => request.json(payload),
            None => request,
        };
        self.send(request).await.map(|_| ())
    }

    async fn send(&self, request: RequestBuilder) -> Result<Vec<u8>, RemoteCallError> {
        let token = self
            .identity
            .signed_token(TokenRequest::Cached)
            .await
            .map_err(|error| RemoteCallError::unauthorized(error.to_string()))?
            .ok_or_else(|| RemoteCallError::unauthorized("no identity token available"))?;
        let response = request
            .bearer_auth(token.expose())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.bytes().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(map_status_error(status, body.as_ref()));
        }
        Ok(body.to_vec())
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, RemoteCallError> {
    serde_json::from_slice(body).map_err(|error| {
        RemoteCallError::decode(format!(
            "invalid JSON payload: {error}; body: {}",
            body_preview(body)
        ))
    })
}

pub(super) fn map_transport_error(error: reqwest::Error) -> RemoteCallError {
    if error.is_timeout() {
        RemoteCallError::timeout(error.to_string())
    } else {
        RemoteCallError::transport(error.to_string())
    }
}

pub(super) fn map_status_error(status: StatusCode, body: &[u8]) -> RemoteCallError {
    let body_preview = body_preview(body);
    let message = if body_preview.is_empty() {
        format!("status {}", status.as_u16())
    } else {
        format!("status {}: {}", status.as_u16(), body_preview)
    };

    match status {
        StatusCode::UNAUTHORIZED => RemoteCallError::unauthorized(message),
        StatusCode::FORBIDDEN => RemoteCallError::forbidden(message),
        StatusCode::NOT_FOUND => RemoteCallError::not_found(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            RemoteCallError::timeout(message)
        }
        _ => RemoteCallError::status(status.as_u16(), message),
    }
}

fn body_preview(body: &[u8]) -> String {
    const PREVIEW_CHAR_LIMIT: usize = 160;

    let compact = String::from_utf8_lossy(body)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let preview = compact.chars().take(PREVIEW_CHAR_LIMIT).collect::<String>();
    if compact.chars().count() > PREVIEW_CHAR_LIMIT {
        format!("{preview}...")
    } else {
        preview
    }
}
