//! `cloudfoundry_org`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use cfweave_client::types::Organization;
use cfweave_client::{CancelToken, Collection, Created};
use cfweave_core::{Attribute, Diagnostics, Metadata, Schema};

use crate::reconcile::{
    client_diag, decode, finish_delete, ReadOutput, ReconcileOutput, ResourceReconciler,
};
use crate::session::Session;

pub const BASE: &str = "/v3/organizations";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrgRecord {
    pub id: String,
    pub name: String,
    pub suspended: bool,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub quota: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl OrgRecord {
    pub fn metadata(&self) -> Metadata {
        Metadata {
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
        }
    }

    fn from_api(org: Organization) -> Self {
        Self {
            id: org.guid,
            name: org.name,
            suspended: org.suspended,
            labels: org.metadata.labels,
            annotations: org.metadata.annotations,
            quota: org.relationships.quota.guid().map(str::to_string),
            created_at: Some(org.created_at.to_rfc3339()),
            updated_at: Some(org.updated_at.to_rfc3339()),
        }
    }
}

pub struct OrgReconciler;

fn orgs(session: &Session) -> Collection<'_, Organization> {
    session.client().collection("organization", BASE)
}

#[async_trait]
impl ResourceReconciler for OrgReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_org"
    }

    fn short_kind(&self) -> &'static str {
        "org"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("name", Attribute::required_string())
            .with_attribute("suspended", Attribute::optional_bool())
            .with_attribute("quota", Attribute::computed_id())
            .with_common()
    }

    async fn create(
        &self,
        session: &Session,
        desired: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let desired: OrgRecord = match decode("org", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let mut body = json!({ "name": desired.name, "suspended": desired.suspended });
        if let Some(metadata) = cfweave_client::types::metadata_for_create(&desired.metadata()) {
            body["metadata"] = metadata;
        }

        let created = match orgs(session).create(&body).await {
            Ok(Created::Resource(org)) => org,
            Ok(Created::Job(_)) => {
                return ReconcileOutput::error(
                    "Failed to create org",
                    "organization create answered with a job",
                )
            }
            Err(e) => {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Failed to create org",
                    &e,
                )]))
            }
        };

        let record = OrgRecord::from_api(created);
        ReconcileOutput::ok(self.short_kind(), &record.id, &record)
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: OrgRecord = match decode("org", prior) {
            Ok(record) => record,
            Err(diags) => {
                return ReadOutput {
                    outcome: crate::reconcile::ReadOutcome::Gone,
                    identity: None,
                    diagnostics: diags,
                }
            }
        };
        match orgs(session).get(&prior.id).await {
            Ok(org) => {
                let record = OrgRecord::from_api(org);
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) if e.is_not_found() => ReadOutput::gone(),
            Err(e) => ReadOutput::error("Failed to read org", e.to_string()),
        }
    }

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let plan: OrgRecord = match decode("org", plan) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let prior: OrgRecord = match decode("org", prior) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let metadata = Metadata::diff(&prior.metadata(), &plan.metadata());
        let body = json!({
            "name": plan.name,
            "suspended": plan.suspended,
            "metadata": metadata,
        });

        match orgs(session).update(&prior.id, &body).await {
            Ok(org) => {
                let record = OrgRecord::from_api(org);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to update org",
                &e,
            )])),
        }
    }

    async fn delete(&self, session: &Session, prior: Value, cancel: &CancelToken) -> Diagnostics {
        let prior: OrgRecord = match decode("org", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let result = orgs(session).delete(&prior.id).await;
        finish_delete(session, "org", result, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_shape() {
        let schema = OrgReconciler.schema();
        assert!(schema.get("name").unwrap().required);
        assert!(schema.get("quota").unwrap().computed);
        assert!(schema.ids_are_chain_stable());
    }

    #[test]
    fn test_record_round_trips_through_json() {
        let record = OrgRecord {
            id: "org-1".to_string(),
            name: "production".to_string(),
            suspended: false,
            labels: BTreeMap::from([("env".to_string(), "prod".to_string())]),
            ..OrgRecord::default()
        };
        let value = serde_json::to_value(&record).unwrap();
        let back: OrgRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.name, "production");
        assert_eq!(back.labels.get("env").map(String::as_str), Some("prod"));
    }
}
