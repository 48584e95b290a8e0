//! `cloudfoundry_role`
//!
//! Tagged variant: an org role carries `org` and no `space`, a space role
//! the reverse. Roles are immutable on the platform; every attribute
//! forces replacement and Update is never reached with a live diff.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use cfweave_client::types::Role;
use cfweave_client::{CancelToken, Collection, Created};
use cfweave_core::{Attribute, AttributePath, Diagnostics, Schema};

use crate::reconcile::{
    client_diag, decode, finish_delete, ReadOutcome, ReadOutput, ReconcileOutput,
    ResourceReconciler,
};
use crate::session::Session;

pub const BASE: &str = "/v3/roles";

const ORG_ROLES: &[&str] = &[
    "organization_user",
    "organization_auditor",
    "organization_manager",
    "organization_billing_manager",
];
const SPACE_ROLES: &[&str] = &["space_auditor", "space_developer", "space_manager", "space_supporter"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub role_type: String,
    pub user: String,
    pub org: Option<String>,
    pub space: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl RoleRecord {
    fn from_api(role: Role) -> Self {
        Self {
            id: role.guid,
            role_type: role.role_type,
            user: role
                .relationships
                .user
                .guid()
                .unwrap_or_default()
                .to_string(),
            org: role
                .relationships
                .organization
                .guid()
                .map(str::to_string),
            space: role.relationships.space.guid().map(str::to_string),
            created_at: Some(role.created_at.to_rfc3339()),
            updated_at: Some(role.updated_at.to_rfc3339()),
        }
    }
}

pub struct RoleReconciler;

fn roles(session: &Session) -> Collection<'_, Role> {
    session.client().collection("role", BASE)
}

#[async_trait]
impl ResourceReconciler for RoleReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_role"
    }

    fn short_kind(&self) -> &'static str {
        "role"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("type", Attribute::required_string().requires_replace())
            .with_attribute("user", Attribute::required_string().requires_replace())
            .with_attribute("org", Attribute::optional_string().requires_replace())
            .with_attribute("space", Attribute::optional_string().requires_replace())
            .with_attribute("id", Attribute::computed_id())
            .with_attribute("created_at", Attribute::computed_string())
            .with_attribute("updated_at", Attribute::computed_string())
    }

    fn validate(&self, config: &Value) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();
        let role_type = config.get("type").and_then(Value::as_str).unwrap_or("");
        let has_org = config.get("org").and_then(Value::as_str).is_some();
        let has_space = config.get("space").and_then(Value::as_str).is_some();

        if ORG_ROLES.contains(&role_type) {
            if !has_org {
                diagnostics.error_at(
                    AttributePath::root("org"),
                    "Missing attribute",
                    format!("role type '{}' requires 'org'", role_type),
                );
            }
            if has_space {
                diagnostics.error_at(
                    AttributePath::root("space"),
                    "Conflicting attributes",
                    format!("role type '{}' does not take 'space'", role_type),
                );
            }
        } else if SPACE_ROLES.contains(&role_type) {
            if !has_space {
                diagnostics.error_at(
                    AttributePath::root("space"),
                    "Missing attribute",
                    format!("role type '{}' requires 'space'", role_type),
                );
            }
            if has_org {
                diagnostics.error_at(
                    AttributePath::root("org"),
                    "Conflicting attributes",
                    format!("role type '{}' does not take 'org'", role_type),
                );
            }
        } else if !role_type.is_empty() {
            diagnostics.error_at(
                AttributePath::root("type"),
                "Unknown role type",
                format!(
                    "'{}' is not one of {}",
                    role_type,
                    ORG_ROLES
                        .iter()
                        .chain(SPACE_ROLES.iter())
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            );
        }
        diagnostics
    }

    async fn create(
        &self,
        session: &Session,
        desired: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let validation = self.validate(&desired);
        if validation.has_errors() {
            return ReconcileOutput::errors(validation);
        }
        let desired: RoleRecord = match decode("role", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let mut relationships = json!({
            "user": { "data": { "guid": desired.user } }
        });
        if let Some(org) = &desired.org {
            relationships["organization"] = json!({ "data": { "guid": org } });
        }
        if let Some(space) = &desired.space {
            relationships["space"] = json!({ "data": { "guid": space } });
        }
        let body = json!({ "type": desired.role_type, "relationships": relationships });

        match roles(session).create(&body).await {
            Ok(Created::Resource(role)) => {
                let record = RoleRecord::from_api(role);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Ok(Created::Job(_)) => ReconcileOutput::error(
                "Failed to create role",
                "role create answered with a job",
            ),
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to create role",
                &e,
            )])),
        }
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: RoleRecord = match decode("role", prior) {
            Ok(record) => record,
            Err(diags) => {
                return ReadOutput {
                    outcome: ReadOutcome::Gone,
                    identity: None,
                    diagnostics: diags,
                }
            }
        };
        match roles(session).get(&prior.id).await {
            Ok(role) => {
                let record = RoleRecord::from_api(role);
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) if e.is_not_found() => ReadOutput::gone(),
            Err(e) => ReadOutput::error("Failed to read role", e.to_string()),
        }
    }

    async fn update(
        &self,
        _session: &Session,
        _plan: Value,
        _prior: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        // Every attribute requires replacement; the engine destroys and
        // recreates instead of calling here.
        ReconcileOutput::error(
            "Roles are immutable",
            "changing a role requires destroy-then-create",
        )
    }

    async fn delete(&self, session: &Session, prior: Value, cancel: &CancelToken) -> Diagnostics {
        let prior: RoleRecord = match decode("role", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let result = roles(session).delete(&prior.id).await;
        finish_delete(session, "role", result, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_org_role_requires_org() {
        let diags = RoleReconciler.validate(&json!({
            "type": "organization_manager",
            "user": "u-1"
        }));
        assert!(diags.has_errors());

        let diags = RoleReconciler.validate(&json!({
            "type": "organization_manager",
            "user": "u-1",
            "org": "o-1"
        }));
        assert!(!diags.has_errors());
    }

    #[test]
    fn test_space_role_rejects_org() {
        let diags = RoleReconciler.validate(&json!({
            "type": "space_developer",
            "user": "u-1",
            "org": "o-1",
            "space": "s-1"
        }));
        assert!(diags.has_errors());
    }

    #[test]
    fn test_unknown_role_type() {
        let diags = RoleReconciler.validate(&json!({
            "type": "galaxy_admin",
            "user": "u-1"
        }));
        assert!(diags.has_errors());
    }

    #[test]
    fn test_everything_forces_replace() {
        let schema = RoleReconciler.schema();
        for name in ["type", "user", "org", "space"] {
            assert!(schema
                .get(name)
                .unwrap()
                .has_modifier(cfweave_core::PlanModifier::RequiresReplace));
        }
    }
}
