//! Explicit session context produced by the orchestrator.

use super::business::TenantScope;
use super::identity::UserKey;
use super::tenant::Tenant;

/// Identity and tenant selection for one signed-in session.
///
/// Built once per startup or tenant switch and passed to every operation that
/// needs to know who is signed in and which tenant is active.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionContext {
    user_key: UserKey,
    subject: String,
    selected: Tenant,
    tenants: Vec<Tenant>,
}

impl SessionContext {
    /// Assemble a context. `selected` should be one of `tenants`.
    pub fn new(user_key: UserKey, subject: String, selected: Tenant, tenants: Vec<Tenant>) -> Self {
        Self {
            user_key,
            subject,
            selected,
            tenants,
        }
    }

    /// Hashed user key.
    pub fn user_key(&self) -> &UserKey {
        &self.user_key
    }

    /// Identity-provider subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Active tenant.
    pub fn selected_tenant(&self) -> &Tenant {
        &self.selected
    }

    /// Tenants the user belongs to, in key order.
    pub fn tenants(&self) -> &[Tenant] {
        &self.tenants
    }

    /// Read scope for the active tenant.
    pub fn scope(&self) -> TenantScope {
        TenantScope::new(self.selected.id.clone())
    }

    /// Copy of the context with another active tenant and tenant list.
    #[must_use]
    pub fn with_selection(&self, selected: Tenant, tenants: Vec<Tenant>) -> Self {
        Self {
            user_key: self.user_key.clone(),
            subject: self.subject.clone(),
            selected,
            tenants,
        }
    }
}
