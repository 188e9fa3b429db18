//! Domain primitives and services.
//!
//! Purpose: model tenants, profiles and documents, and run the services that
//! bind an identity to a tenant and keep local data in step with the remote.
//! Services depend on the traits in [`ports`] only.
//!
//! Public surface:
//! - Error / ErrorCode — transport-agnostic failure payload.
//! - Document, DocumentId, Revision, KeyRange, RangeScan — local store model.
//! - TenantId, Tenant, UserKey, UserProfile, IdentityToken — identity model.
//! - IdentityBinding, TenantRegistry, ChangeFeedPoller, ReplicationEngine,
//!   TenantContextOrchestrator — services.

pub mod ports;

mod business;
pub mod change_feed;
mod context;
mod document;
mod error;
mod identity;
pub mod identity_binding;
pub mod orchestrator;
mod profile;
pub mod replication;
mod retry;
mod tenant;
pub mod tenant_registry;
mod upsert;

pub use self::business::{
    BAND_INFO_ID, BusinessDocuments, ChecklistItem, EquipmentEntry, GigType, GigTypeEquipment,
    TENANT_FIELD, TenantScope, expand_checklist,
};
pub use self::change_feed::{
    ChangeCursor, ChangeFeedPoller, FeedMerger, FeedNotification, PollOutcome, PollerState,
    ProfileFeedMerger, TenantFeedMerger,
};
pub use self::context::SessionContext;
pub use self::document::{
    DELETED_AT_FIELD, Document, DocumentId, DocumentKind, DocumentValidationError, KIND_FIELD,
    KeyRange, RangeScan, Revision,
};
pub use self::error::{Error, ErrorCode};
pub use self::identity::{IdentityToken, TokenClaims, TokenDecodeError, USER_ID_PREFIX, UserKey};
pub use self::identity_binding::{
    ActiveTenantUpdate, IdentityBinding, IdentityBindingConfig, ResolvedIdentity,
};
pub use self::orchestrator::{
    OrchestratorConfig, OrchestratorState, SelectionSource, TenantContextOrchestrator,
};
pub use self::profile::UserProfile;
pub use self::replication::{
    Direction, ReplicationConfig, ReplicationEngine, ReplicationEvent, ReplicationStatus,
    ReplicationSummary,
};
pub use self::retry::{
    Attempt, RetryError, RetryPolicy, Sleeper, TokioSleeper, retry_with_policy,
};
pub use self::tenant::{TENANT_ID_PREFIX, Tenant, TenantId, TenantValidationError};
pub use self::tenant_registry::{TenantRegistry, TenantRegistryConfig};
