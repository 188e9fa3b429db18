//! Identity provider backed by a token file kept fresh by the host session.
//!
//! The hosting shell owns sign-in and writes the current signed token to a
//! file. A forced refresh re-reads the file so claims written after a
//! metadata update become visible.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::IdentityToken;
use crate::domain::ports::{IdentityProvider, IdentityProviderError, TokenRequest};

/// Reads the signed token from a file, caching it between forced refreshes.
pub struct TokenFileProvider {
    path: PathBuf,
    cached: Mutex<Option<IdentityToken>>,
    subject: std::sync::Mutex<Option<String>>,
}

impl TokenFileProvider {
    /// Provider reading from `path`. Nothing is read until the first request.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
            subject: std::sync::Mutex::new(None),
        }
    }

    /// File the token is read from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_token(&self) -> Result<Option<IdentityToken>, IdentityProviderError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(IdentityProviderError::unavailable(format!(
                    "reading {}: {error}",
                    self.path.display()
                )));
            }
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(IdentityToken::new(trimmed)))
    }

    fn remember_subject(&self, token: Option<&IdentityToken>) {
        let subject = token
            .and_then(|token| token.claims().ok())
            .and_then(|claims| claims.subject);
        if let Ok(mut slot) = self.subject.lock() {
            *slot = subject;
        }
    }
}

#[async_trait]
impl IdentityProvider for TokenFileProvider {
    async fn signed_token(
        &self,
        request: TokenRequest,
    ) -> Result<Option<IdentityToken>, IdentityProviderError> {
        let mut cached = self.cached.lock().await;
        if request == TokenRequest::Cached
            && let Some(token) = cached.as_ref()
        {
            return Ok(Some(token.clone()));
        }
        debug!(path = %self.path.display(), ?request, "reading identity token");
        let token = self.read_token().await?;
        self.remember_subject(token.as_ref());
        cached.clone_from(&token);
        Ok(token)
    }

    fn user_identifier(&self) -> Option<String> {
        self.subject.lock().ok().and_then(|slot| slot.clone())
    }
}
