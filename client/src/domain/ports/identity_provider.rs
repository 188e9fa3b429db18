//! Driven port for the external identity provider.
//!
//! The provider is consumed through exactly two operations: obtaining the
//! current signed token and reading the user identifier. Sign-in and session
//! issuance stay outside this crate.

use async_trait::async_trait;

use crate::domain::IdentityToken;

use super::define_port_error;

define_port_error! {
    /// Errors surfaced by identity provider adapters.
    pub enum IdentityProviderError {
        /// Provider session could not be reached or reloaded.
        Unavailable { message: String } =>
            "identity provider unavailable: {message}" as NoIdentity,
    }
}

/// How fresh the requested token must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRequest {
    /// Any unexpired token the provider already holds.
    Cached,
    /// Reload the session and mint a new token so updated metadata is signed in.
    ForceRefresh,
}

/// Port for reading the signed identity token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Return the current signed token, or `None` when signed out.
    async fn signed_token(
        &self,
        request: TokenRequest,
    ) -> Result<Option<IdentityToken>, IdentityProviderError>;

    /// Return the provider's user identifier, when signed in.
    fn user_identifier(&self) -> Option<String>;
}
