//! Identity provider holding one token supplied at startup.

use async_trait::async_trait;

use crate::domain::IdentityToken;
use crate::domain::ports::{IdentityProvider, IdentityProviderError, TokenRequest};

/// Serves a fixed token. A forced refresh returns the same token, so a
/// claim missing from it never appears.
pub struct StaticTokenProvider {
    token: IdentityToken,
    subject: Option<String>,
}

impl StaticTokenProvider {
    /// Wrap `token`, reading its subject once.
    pub fn new(token: IdentityToken) -> Self {
        let subject = token.claims().ok().and_then(|claims| claims.subject);
        Self { token, subject }
    }
}

#[async_trait]
impl IdentityProvider for StaticTokenProvider {
    async fn signed_token(
        &self,
        _request: TokenRequest,
    ) -> Result<Option<IdentityToken>, IdentityProviderError> {
        Ok(Some(self.token.clone()))
    }

    fn user_identifier(&self) -> Option<String> {
        self.subject.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::unsigned_token;
    use serde_json::json;

    #[tokio::test]
    async fn forced_refresh_returns_the_same_token() {
        let token = unsigned_token(&json!({ "sub": "user_a" }));
        let provider = StaticTokenProvider::new(token.clone());

        let refreshed = provider
            .signed_token(TokenRequest::ForceRefresh)
            .await
            .expect("static provider never fails");

        assert_eq!(refreshed, Some(token));
        assert_eq!(provider.user_identifier().as_deref(), Some("user_a"));
    }
}
