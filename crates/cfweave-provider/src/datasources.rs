//! Read-only data sources
//!
//! Thin list-by-name lookups over the same client collections the
//! reconcilers use; each resolves a name (plus parent scope) to the
//! record shape of the corresponding resource.

use serde_json::Value;

use cfweave_client::types::{App, Domain, Organization, ServicePlan, Space};
use cfweave_client::ClientError;
use cfweave_core::{Attribute, Diagnostics, Schema};

use crate::session::Session;

/// Schemas for the catalog, keyed by data-source kind
pub fn schemas() -> Vec<(&'static str, Schema)> {
    vec![
        (
            "cloudfoundry_org",
            Schema::v0()
                .with_attribute("name", Attribute::required_string())
                .with_attribute("id", Attribute::computed_id()),
        ),
        (
            "cloudfoundry_space",
            Schema::v0()
                .with_attribute("name", Attribute::required_string())
                .with_attribute("org", Attribute::required_string())
                .with_attribute("id", Attribute::computed_id()),
        ),
        (
            "cloudfoundry_domain",
            Schema::v0()
                .with_attribute("name", Attribute::required_string())
                .with_attribute("id", Attribute::computed_id()),
        ),
        (
            "cloudfoundry_service_plan",
            Schema::v0()
                .with_attribute("name", Attribute::required_string())
                .with_attribute("service_offering", Attribute::required_string())
                .with_attribute("id", Attribute::computed_id()),
        ),
        (
            "cloudfoundry_app",
            Schema::v0()
                .with_attribute("name", Attribute::required_string())
                .with_attribute("space", Attribute::required_string())
                .with_attribute("id", Attribute::computed_id()),
        ),
    ]
}

fn lookup_failed(what: &str, e: &ClientError) -> Diagnostics {
    let mut diagnostics = Diagnostics::new();
    diagnostics.error(format!("Failed to look up {}", what), e.to_string());
    diagnostics
}

/// Resolve an org by name.
pub async fn org_by_name(session: &Session, name: &str) -> Result<Value, Diagnostics> {
    let org: Organization = session
        .client()
        .collection("organization", "/v3/organizations")
        .single(&[("names", name)])
        .await
        .map_err(|e| lookup_failed("org", &e))?;
    Ok(serde_json::json!({ "name": org.name, "id": org.guid }))
}

/// Resolve a space by name within an org.
pub async fn space_by_name(
    session: &Session,
    name: &str,
    org_guid: &str,
) -> Result<Value, Diagnostics> {
    let space: Space = session
        .client()
        .collection("space", "/v3/spaces")
        .single(&[("names", name), ("organization_guids", org_guid)])
        .await
        .map_err(|e| lookup_failed("space", &e))?;
    Ok(serde_json::json!({ "name": space.name, "org": org_guid, "id": space.guid }))
}

/// Resolve a domain by name.
pub async fn domain_by_name(session: &Session, name: &str) -> Result<Value, Diagnostics> {
    let domain: Domain = session
        .client()
        .collection("domain", "/v3/domains")
        .single(&[("names", name)])
        .await
        .map_err(|e| lookup_failed("domain", &e))?;
    Ok(serde_json::json!({ "name": domain.name, "id": domain.guid }))
}

/// Resolve a service plan by name within an offering.
pub async fn service_plan_by_name(
    session: &Session,
    name: &str,
    offering: &str,
) -> Result<Value, Diagnostics> {
    let plan: ServicePlan = session
        .client()
        .collection("service plan", "/v3/service_plans")
        .single(&[("names", name), ("service_offering_names", offering)])
        .await
        .map_err(|e| lookup_failed("service plan", &e))?;
    Ok(serde_json::json!({
        "name": plan.name,
        "service_offering": offering,
        "id": plan.guid,
    }))
}

/// Resolve an app by name within a space.
pub async fn app_by_name(
    session: &Session,
    name: &str,
    space_guid: &str,
) -> Result<Value, Diagnostics> {
    let app: App = session
        .client()
        .collection("app", "/v3/apps")
        .single(&[("names", name), ("space_guids", space_guid)])
        .await
        .map_err(|e| lookup_failed("app", &e))?;
    Ok(serde_json::json!({ "name": app.name, "space": space_guid, "id": app.guid }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datasource_ids_are_chain_stable() {
        for (kind, schema) in schemas() {
            assert!(schema.ids_are_chain_stable(), "{} fails the sweep", kind);
        }
    }
}
