//! Domain-level error types.
//!
//! These errors are transport agnostic. Services return them to the embedding
//! application; outbound adapters never construct them directly and instead
//! report port errors that the services translate.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable machine-readable error code describing the failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No signed identity token is available.
    NoIdentity,
    /// The identity token carries no subject claim.
    MissingSubject,
    /// The remote rejected the identity token or none was supplied.
    Unauthorized,
    /// The remote could not be reached or did not answer in time.
    Unreachable,
    /// The identity belongs to zero tenants.
    NoTenantsAvailable,
    /// A requested tenant is not part of the identity's tenant list.
    TenantNotFound,
    /// The local active-tenant write did not commit.
    LocalWriteFailed,
    /// Reissued tokens never carried the active-tenant claim.
    ClaimPropagationTimeout,
    /// An optimistic-concurrency check failed and was not resolved.
    Conflict,
    /// A document does not exist.
    NotFound,
    /// An unexpected error occurred inside the domain.
    InternalError,
}

impl ErrorCode {
    /// Whether this class of failure blocks startup.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::NoIdentity
                | Self::MissingSubject
                | Self::NoTenantsAvailable
                | Self::LocalWriteFailed
                | Self::ClaimPropagationTimeout
        )
    }
}

/// Domain error payload.
///
/// # Examples
/// ```
/// use client::domain::{Error, ErrorCode};
///
/// let err = Error::no_tenants_available("user belongs to no bands");
/// assert_eq!(err.code(), ErrorCode::NoTenantsAvailable);
/// assert!(err.is_fatal());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Error {
    code: ErrorCode,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl Error {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Human-readable message.
    pub fn message(&self) -> &str {
        self.message.as_str()
    }

    /// Supplementary structured details.
    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    /// Whether the error halts onboarding.
    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }

    /// Attach structured details to the error.
    ///
    /// # Examples
    /// ```
    /// use client::domain::Error;
    /// use serde_json::json;
    ///
    /// let err = Error::conflict("revision mismatch")
    ///     .with_details(json!({ "documentId": "tenant_t1" }));
    /// assert!(err.details().is_some());
    /// ```
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Convenience constructor for [`ErrorCode::NoIdentity`].
    pub fn no_identity(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NoIdentity, message)
    }

    /// Convenience constructor for [`ErrorCode::MissingSubject`].
    pub fn missing_subject(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MissingSubject, message)
    }

    /// Convenience constructor for [`ErrorCode::Unauthorized`].
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Convenience constructor for [`ErrorCode::Unreachable`].
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unreachable, message)
    }

    /// Convenience constructor for [`ErrorCode::NoTenantsAvailable`].
    pub fn no_tenants_available(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NoTenantsAvailable, message)
    }

    /// Convenience constructor for [`ErrorCode::TenantNotFound`].
    pub fn tenant_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TenantNotFound, message)
    }

    /// Convenience constructor for [`ErrorCode::LocalWriteFailed`].
    pub fn local_write_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::LocalWriteFailed, message)
    }

    /// Convenience constructor for [`ErrorCode::ClaimPropagationTimeout`].
    pub fn claim_propagation_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ClaimPropagationTimeout, message)
    }

    /// Convenience constructor for [`ErrorCode::Conflict`].
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    /// Convenience constructor for [`ErrorCode::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Convenience constructor for [`ErrorCode::InternalError`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}
