//! `cloudfoundry_space`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use cfweave_client::types::{AppFeature, Space};
use cfweave_client::{CancelToken, Collection, Created};
use cfweave_core::{identity, Attribute, AttributePath, Diagnostics, Metadata, Schema};

use crate::reconcile::{
    client_diag, decode, finish_delete, ReadOutcome, ReadOutput, ReconcileOutput,
    ResourceReconciler,
};
use crate::session::Session;

pub const BASE: &str = "/v3/spaces";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceRecord {
    pub id: String,
    pub name: String,
    pub org: String,
    pub quota: Option<String>,
    pub allow_ssh: Option<bool>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl SpaceRecord {
    pub fn metadata(&self) -> Metadata {
        Metadata {
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
        }
    }

    fn from_api(space: Space, allow_ssh: Option<bool>) -> Self {
        Self {
            id: space.guid,
            name: space.name,
            org: space
                .relationships
                .organization
                .guid()
                .unwrap_or_default()
                .to_string(),
            quota: space.relationships.quota.guid().map(str::to_string),
            allow_ssh,
            labels: space.metadata.labels,
            annotations: space.metadata.annotations,
            created_at: Some(space.created_at.to_rfc3339()),
            updated_at: Some(space.updated_at.to_rfc3339()),
        }
    }
}

pub struct SpaceReconciler;

fn spaces(session: &Session) -> Collection<'_, Space> {
    session.client().collection("space", BASE)
}

async fn read_ssh(session: &Session, guid: &str) -> Option<bool> {
    let feature: Result<AppFeature, _> = session
        .client()
        .get_json(&format!("/v3/spaces/{}/features/ssh", guid), &[])
        .await;
    feature.ok().map(|f| f.enabled)
}

async fn write_ssh(session: &Session, guid: &str, enabled: bool) -> cfweave_client::Result<()> {
    let _: AppFeature = session
        .client()
        .patch_json(
            &format!("/v3/spaces/{}/features/ssh", guid),
            &json!({ "enabled": enabled }),
        )
        .await?;
    Ok(())
}

#[async_trait]
impl ResourceReconciler for SpaceReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_space"
    }

    fn short_kind(&self) -> &'static str {
        "space"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("name", Attribute::required_string())
            .with_attribute("org", Attribute::required_string().requires_replace())
            .with_attribute("quota", Attribute::computed_id())
            .with_attribute("allow_ssh", Attribute::optional_bool())
            .with_common()
    }

    fn validate(&self, config: &Value) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();
        if let Some(org) = config.get("org").and_then(Value::as_str) {
            if identity::validate_guid("org", org).is_err() {
                diagnostics.error_at(
                    AttributePath::root("org"),
                    "Invalid foreign identifier",
                    format!("'{}' is not a GUID", org),
                );
            }
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
        let desired: SpaceRecord = match decode("space", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let mut body = json!({
            "name": desired.name,
            "relationships": { "organization": { "data": { "guid": desired.org } } }
        });
        if let Some(metadata) = cfweave_client::types::metadata_for_create(&desired.metadata()) {
            body["metadata"] = metadata;
        }

        let created = match spaces(session).create(&body).await {
            Ok(Created::Resource(space)) => space,
            Ok(Created::Job(_)) => {
                return ReconcileOutput::error(
                    "Failed to create space",
                    "space create answered with a job",
                )
            }
            Err(e) => {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Failed to create space",
                    &e,
                )]))
            }
        };
        let guid = created.guid.clone();

        // The SSH feature is a separate endpoint, set after the entity
        // exists. Surface failures but keep the created identifier so the
        // next plan converges instead of leaking the space.
        let mut diagnostics = Diagnostics::new();
        let mut allow_ssh = desired.allow_ssh;
        if let Some(enabled) = desired.allow_ssh {
            if let Err(e) = write_ssh(session, &guid, enabled).await {
                diagnostics.push(client_diag("Failed to set space SSH feature", &e));
                allow_ssh = read_ssh(session, &guid).await;
            }
        } else {
            allow_ssh = read_ssh(session, &guid).await;
        }

        let record = SpaceRecord::from_api(created, allow_ssh);
        ReconcileOutput::ok(self.short_kind(), &record.id, &record).with_warnings(diagnostics)
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: SpaceRecord = match decode("space", prior) {
            Ok(record) => record,
            Err(diags) => {
                return ReadOutput {
                    outcome: ReadOutcome::Gone,
                    identity: None,
                    diagnostics: diags,
                }
            }
        };
        match spaces(session).get(&prior.id).await {
            Ok(space) => {
                let allow_ssh = read_ssh(session, &space.guid).await;
                let record = SpaceRecord::from_api(space, allow_ssh);
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) if e.is_not_found() => ReadOutput::gone(),
            Err(e) => ReadOutput::error("Failed to read space", e.to_string()),
        }
    }

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let plan: SpaceRecord = match decode("space", plan) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let prior: SpaceRecord = match decode("space", prior) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let metadata = Metadata::diff(&prior.metadata(), &plan.metadata());
        let body = json!({ "name": plan.name, "metadata": metadata });
        let updated = match spaces(session).update(&prior.id, &body).await {
            Ok(space) => space,
            Err(e) => {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Failed to update space",
                    &e,
                )]))
            }
        };

        let mut diagnostics = Diagnostics::new();
        let mut allow_ssh = plan.allow_ssh;
        if plan.allow_ssh != prior.allow_ssh {
            if let Some(enabled) = plan.allow_ssh {
                if let Err(e) = write_ssh(session, &prior.id, enabled).await {
                    diagnostics.push(client_diag("Failed to set space SSH feature", &e));
                    allow_ssh = read_ssh(session, &prior.id).await;
                }
            }
        }

        let record = SpaceRecord::from_api(updated, allow_ssh);
        ReconcileOutput::ok(self.short_kind(), &record.id, &record).with_warnings(diagnostics)
    }

    async fn delete(&self, session: &Session, prior: Value, cancel: &CancelToken) -> Diagnostics {
        let prior: SpaceRecord = match decode("space", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let result = spaces(session).delete(&prior.id).await;
        finish_delete(session, "space", result, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_org_requires_replace() {
        let schema = SpaceReconciler.schema();
        assert!(schema
            .get("org")
            .unwrap()
            .has_modifier(cfweave_core::PlanModifier::RequiresReplace));
        assert!(schema.ids_are_chain_stable());
    }

    #[test]
    fn test_validate_rejects_bad_org_guid() {
        let diags = SpaceReconciler.validate(&json!({ "org": "not-a-guid" }));
        assert!(diags.has_errors());

        let diags = SpaceReconciler
            .validate(&json!({ "org": "8f7d9a2e-4b3c-4f1a-9e6d-2c5b8a7f0e13" }));
        assert!(!diags.has_errors());
    }
}
