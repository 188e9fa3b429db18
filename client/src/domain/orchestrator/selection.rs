//! Active-tenant priority rules.

use crate::domain::tenant::{Tenant, TenantId};

/// Where the selected tenant came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionSource {
    /// The local profile's active-tenant pointer.
    Profile,
    /// The identity token's active-tenant claim.
    Claim,
    /// First tenant in key order.
    First,
}

/// Pick the active tenant: profile pointer, then token claim, then the first
/// tenant. Candidates naming a tenant outside `tenants` are passed over.
pub fn select_active_tenant<'a>(
    tenants: &'a [Tenant],
    profile_pointer: Option<&TenantId>,
    claim: Option<&TenantId>,
) -> Option<(&'a Tenant, SelectionSource)> {
    let find = |candidate: Option<&TenantId>| {
        candidate.and_then(|wanted| tenants.iter().find(|tenant| tenant.id == *wanted))
    };
    find(profile_pointer)
        .map(|tenant| (tenant, SelectionSource::Profile))
        .or_else(|| find(claim).map(|tenant| (tenant, SelectionSource::Claim)))
        .or_else(|| tenants.first().map(|tenant| (tenant, SelectionSource::First)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tenants() -> Vec<Tenant> {
        ["t1", "t2", "t3"]
            .into_iter()
            .map(|id| Tenant::new(TenantId::new(id).expect("id"), id.to_uppercase()))
            .collect()
    }

    fn id(raw: &str) -> TenantId {
        TenantId::new(raw).expect("id")
    }

    #[rstest]
    #[case::profile_wins(Some("tenant_t2"), Some("t3"), "t2", SelectionSource::Profile)]
    #[case::claim_when_no_profile(None, Some("tenant_t3"), "t3", SelectionSource::Claim)]
    #[case::stale_profile_falls_to_claim(Some("t9"), Some("t3"), "t3", SelectionSource::Claim)]
    #[case::first_as_last_resort(Some("t9"), Some("t8"), "t1", SelectionSource::First)]
    #[case::nothing_known(None, None, "t1", SelectionSource::First)]
    fn applies_priority_order(
        #[case] pointer: Option<&str>,
        #[case] claim: Option<&str>,
        #[case] expected: &str,
        #[case] source: SelectionSource,
    ) {
        let tenants = tenants();
        let pointer = pointer.map(id);
        let claim = claim.map(id);

        let (selected, selected_from) =
            select_active_tenant(&tenants, pointer.as_ref(), claim.as_ref()).expect("selection");

        assert_eq!(selected.id.as_str(), expected);
        assert_eq!(selected_from, source);
    }

    #[test]
    fn empty_list_selects_nothing() {
        assert!(select_active_tenant(&[], Some(&id("t1")), None).is_none());
    }
}
