//! `cloudfoundry_domain`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

use cfweave_client::types::{Domain, ToMany};
use cfweave_client::{CancelToken, ClientError, Collection, Created};
use cfweave_core::{diff_sets, Attribute, Diagnostics, Metadata, Schema};

use crate::reconcile::{
    client_diag, decode, finish_delete, ReadOutcome, ReadOutput, ReconcileOutput,
    ResourceReconciler,
};
use crate::session::Session;

pub const BASE: &str = "/v3/domains";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainRecord {
    pub id: String,
    pub name: String,
    pub internal: bool,
    pub router_group: Option<String>,
    /// Owning org for a private domain; unset means shared platform-wide
    pub org: Option<String>,
    pub shared_orgs: BTreeSet<String>,
    pub supported_protocols: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl DomainRecord {
    pub fn metadata(&self) -> Metadata {
        Metadata {
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
        }
    }

    fn from_api(domain: Domain) -> Self {
        Self {
            id: domain.guid,
            name: domain.name,
            internal: domain.internal,
            router_group: domain.router_group.map(|g| g.guid),
            org: domain
                .relationships
                .organization
                .guid()
                .map(str::to_string),
            shared_orgs: domain.relationships.shared_organizations.guids(),
            supported_protocols: domain.supported_protocols,
            labels: domain.metadata.labels,
            annotations: domain.metadata.annotations,
            created_at: Some(domain.created_at.to_rfc3339()),
            updated_at: Some(domain.updated_at.to_rfc3339()),
        }
    }
}

pub struct DomainReconciler;

fn domains(session: &Session) -> Collection<'_, Domain> {
    session.client().collection("domain", BASE)
}

async fn share_with(
    session: &Session,
    domain_guid: &str,
    added: &BTreeSet<String>,
    removed: &BTreeSet<String>,
) -> Result<(), ClientError> {
    for org in removed {
        let result = session
            .client()
            .delete(&format!(
                "{}/{}/relationships/shared_organizations/{}",
                BASE, domain_guid, org
            ))
            .await;
        match result {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    if !added.is_empty() {
        let body = json!({
            "data": added.iter().map(|guid| json!({ "guid": guid })).collect::<Vec<_>>()
        });
        let _: ToMany = match session
            .client()
            .post_json(
                &format!("{}/{}/relationships/shared_organizations", BASE, domain_guid),
                &body,
            )
            .await?
        {
            Created::Resource(list) => list,
            Created::Job(_) => {
                return Err(ClientError::UnexpectedResponse {
                    message: "domain sharing answered with a job".to_string(),
                })
            }
        };
    }
    Ok(())
}

#[async_trait]
impl ResourceReconciler for DomainReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_domain"
    }

    fn short_kind(&self) -> &'static str {
        "domain"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("name", Attribute::required_string().requires_replace())
            .with_attribute("internal", Attribute::optional_bool().requires_replace())
            .with_attribute(
                "router_group",
                Attribute::optional_string().requires_replace(),
            )
            .with_attribute("org", Attribute::optional_string().requires_replace())
            .with_attribute("shared_orgs", Attribute::optional_string_set())
            .with_attribute("supported_protocols", Attribute::optional_string_set())
            .with_common()
    }

    async fn create(
        &self,
        session: &Session,
        desired: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let desired: DomainRecord = match decode("domain", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let mut body = json!({ "name": desired.name, "internal": desired.internal });
        if let Some(router_group) = &desired.router_group {
            body["router_group"] = json!({ "guid": router_group });
        }
        let mut relationships = serde_json::Map::new();
        if let Some(org) = &desired.org {
            relationships.insert(
                "organization".to_string(),
                json!({ "data": { "guid": org } }),
            );
        }
        if !desired.shared_orgs.is_empty() {
            relationships.insert(
                "shared_organizations".to_string(),
                json!({
                    "data": desired.shared_orgs.iter().map(|guid| json!({ "guid": guid })).collect::<Vec<_>>()
                }),
            );
        }
        if !relationships.is_empty() {
            body["relationships"] = Value::Object(relationships);
        }
        if let Some(metadata) = cfweave_client::types::metadata_for_create(&desired.metadata()) {
            body["metadata"] = metadata;
        }

        match domains(session).create(&body).await {
            Ok(Created::Resource(domain)) => {
                let record = DomainRecord::from_api(domain);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Ok(Created::Job(_)) => ReconcileOutput::error(
                "Failed to create domain",
                "domain create answered with a job",
            ),
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to create domain",
                &e,
            )])),
        }
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: DomainRecord = match decode("domain", prior) {
            Ok(record) => record,
            Err(diags) => {
                return ReadOutput {
                    outcome: ReadOutcome::Gone,
                    identity: None,
                    diagnostics: diags,
                }
            }
        };
        match domains(session).get(&prior.id).await {
            Ok(domain) => {
                let record = DomainRecord::from_api(domain);
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) if e.is_not_found() => ReadOutput::gone(),
            Err(e) => ReadOutput::error("Failed to read domain", e.to_string()),
        }
    }

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let plan: DomainRecord = match decode("domain", plan) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let prior: DomainRecord = match decode("domain", prior) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let diff = diff_sets(&plan.shared_orgs, &prior.shared_orgs);
        if let Err(e) = share_with(session, &prior.id, &diff.added, &diff.removed).await {
            return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to reconcile domain sharing",
                &e,
            )]));
        }

        let metadata = Metadata::diff(&prior.metadata(), &plan.metadata());
        let body = json!({ "metadata": metadata });
        match domains(session).update(&prior.id, &body).await {
            Ok(domain) => {
                let record = DomainRecord::from_api(domain);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to update domain",
                &e,
            )])),
        }
    }

    async fn delete(&self, session: &Session, prior: Value, cancel: &CancelToken) -> Diagnostics {
        let prior: DomainRecord = match decode("domain", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let result = domains(session).delete(&prior.id).await;
        finish_delete(session, "domain", result, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_forces_replace() {
        let schema = DomainReconciler.schema();
        assert!(schema
            .get("name")
            .unwrap()
            .has_modifier(cfweave_core::PlanModifier::RequiresReplace));
        assert!(schema.ids_are_chain_stable());
    }
}
