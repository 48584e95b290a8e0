//! Resource catalog
//!
//! Enumerates every resource kind the provider exposes, each behind a
//! factory that yields a fresh reconciler. The host adapter asks for the
//! catalog once per session and dispatches plan steps by kind name.

use crate::reconcile::ResourceReconciler;
use crate::resources::{
    app::AppReconciler,
    domain::DomainReconciler,
    isolation_segment::{IsolationSegmentEntitlementReconciler, IsolationSegmentReconciler},
    mta::MtaReconciler,
    org::OrgReconciler,
    org_quota::OrgQuotaReconciler,
    role::RoleReconciler,
    route::RouteReconciler,
    security_group::SecurityGroupReconciler,
    service_binding::ServiceBindingReconciler,
    service_broker::ServiceBrokerReconciler,
    service_instance::ServiceInstanceReconciler,
    service_sharing::ServiceSharingReconciler,
    space::SpaceReconciler,
    space_quota::SpaceQuotaReconciler,
};

/// A fresh reconciler per kind, in catalog order
pub fn catalog() -> Vec<Box<dyn ResourceReconciler>> {
    vec![
        Box::new(OrgReconciler),
        Box::new(OrgQuotaReconciler),
        Box::new(SpaceReconciler),
        Box::new(SpaceQuotaReconciler),
        Box::new(DomainReconciler),
        Box::new(RouteReconciler),
        Box::new(SecurityGroupReconciler),
        Box::new(IsolationSegmentReconciler),
        Box::new(IsolationSegmentEntitlementReconciler),
        Box::new(RoleReconciler),
        Box::new(AppReconciler),
        Box::new(ServiceInstanceReconciler),
        Box::new(ServiceBindingReconciler),
        Box::new(ServiceSharingReconciler),
        Box::new(ServiceBrokerReconciler),
        Box::new(MtaReconciler),
    ]
}

/// Look a reconciler up by its full kind name
pub fn reconciler_for(kind: &str) -> Option<Box<dyn ResourceReconciler>> {
    catalog().into_iter().find(|r| r.kind() == kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_kinds_are_namespaced_and_unique() {
        let mut seen = BTreeSet::new();
        for reconciler in catalog() {
            let kind = reconciler.kind();
            assert!(kind.starts_with("cloudfoundry_"), "{} lacks the namespace", kind);
            assert!(seen.insert(kind.to_string()), "{} enumerated twice", kind);
            assert_eq!(
                kind.trim_start_matches("cloudfoundry_"),
                reconciler.short_kind()
            );
        }
        assert_eq!(seen.len(), 16);
    }

    #[test]
    fn test_lookup_by_kind() {
        assert!(reconciler_for("cloudfoundry_app").is_some());
        assert!(reconciler_for("cloudfoundry_teapot").is_none());
    }
}
