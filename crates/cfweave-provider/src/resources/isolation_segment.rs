//! `cloudfoundry_isolation_segment` and its org entitlement
//!
//! The segment itself is a name plus metadata; which orgs may use it is a
//! separate relationship-set resource so entitlements can be managed by a
//! different owner than the segment.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

use cfweave_client::types::{EntitledOrgs, IsolationSegment, ToMany};
use cfweave_client::{CancelToken, ClientError, Collection, Created};
use cfweave_core::{diff_sets, Attribute, Diagnostics, Metadata, Schema};

use crate::reconcile::{
    client_diag, decode, finish_delete, ReadOutcome, ReadOutput, ReconcileOutput,
    ResourceReconciler,
};
use crate::session::Session;

pub const BASE: &str = "/v3/isolation_segments";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationSegmentRecord {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl IsolationSegmentRecord {
    pub fn metadata(&self) -> Metadata {
        Metadata {
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
        }
    }

    fn from_api(segment: IsolationSegment) -> Self {
        Self {
            id: segment.guid,
            name: segment.name,
            labels: segment.metadata.labels,
            annotations: segment.metadata.annotations,
            created_at: Some(segment.created_at.to_rfc3339()),
            updated_at: Some(segment.updated_at.to_rfc3339()),
        }
    }
}

pub struct IsolationSegmentReconciler;

fn segments(session: &Session) -> Collection<'_, IsolationSegment> {
    session.client().collection("isolation segment", BASE)
}

#[async_trait]
impl ResourceReconciler for IsolationSegmentReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_isolation_segment"
    }

    fn short_kind(&self) -> &'static str {
        "isolation_segment"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("name", Attribute::required_string())
            .with_common()
    }

    async fn create(
        &self,
        session: &Session,
        desired: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let desired: IsolationSegmentRecord = match decode("isolation segment", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let mut body = json!({ "name": desired.name });
        if let Some(metadata) = cfweave_client::types::metadata_for_create(&desired.metadata()) {
            body["metadata"] = metadata;
        }

        match segments(session).create(&body).await {
            Ok(Created::Resource(segment)) => {
                let record = IsolationSegmentRecord::from_api(segment);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Ok(Created::Job(_)) => ReconcileOutput::error(
                "Failed to create isolation segment",
                "segment create answered with a job",
            ),
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to create isolation segment",
                &e,
            )])),
        }
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: IsolationSegmentRecord = match decode("isolation segment", prior) {
            Ok(record) => record,
            Err(diags) => {
                return ReadOutput {
                    outcome: ReadOutcome::Gone,
                    identity: None,
                    diagnostics: diags,
                }
            }
        };
        match segments(session).get(&prior.id).await {
            Ok(segment) => {
                let record = IsolationSegmentRecord::from_api(segment);
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) if e.is_not_found() => ReadOutput::gone(),
            Err(e) => ReadOutput::error("Failed to read isolation segment", e.to_string()),
        }
    }

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let plan: IsolationSegmentRecord = match decode("isolation segment", plan) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let prior: IsolationSegmentRecord = match decode("isolation segment", prior) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let metadata = Metadata::diff(&prior.metadata(), &plan.metadata());
        let body = json!({ "name": plan.name, "metadata": metadata });
        match segments(session).update(&prior.id, &body).await {
            Ok(segment) => {
                let record = IsolationSegmentRecord::from_api(segment);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to update isolation segment",
                &e,
            )])),
        }
    }

    async fn delete(&self, session: &Session, prior: Value, cancel: &CancelToken) -> Diagnostics {
        let prior: IsolationSegmentRecord = match decode("isolation segment", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let result = segments(session).delete(&prior.id).await;
        finish_delete(session, "isolation segment", result, cancel).await
    }
}

// ---------------------------------------------------------------------------
// Entitlement: segment <-> orgs relationship set
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EntitlementRecord {
    /// Mirrors the segment guid; this resource has no identity of its own
    pub id: String,
    pub segment: String,
    pub orgs: BTreeSet<String>,
}

pub struct IsolationSegmentEntitlementReconciler;

async fn read_entitled(
    session: &Session,
    segment_guid: &str,
) -> Result<BTreeSet<String>, ClientError> {
    let list: EntitledOrgs = session
        .client()
        .get_json(
            &format!("{}/{}/relationships/organizations", BASE, segment_guid),
            &[],
        )
        .await?;
    Ok(list.guids())
}

async fn entitle(
    session: &Session,
    segment_guid: &str,
    added: &BTreeSet<String>,
    removed: &BTreeSet<String>,
) -> Result<(), ClientError> {
    for org in removed {
        let result = session
            .client()
            .delete(&format!(
                "{}/{}/relationships/organizations/{}",
                BASE, segment_guid, org
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
                &format!("{}/{}/relationships/organizations", BASE, segment_guid),
                &body,
            )
            .await?
        {
            Created::Resource(list) => list,
            Created::Job(_) => {
                return Err(ClientError::UnexpectedResponse {
                    message: "entitlement answered with a job".to_string(),
                })
            }
        };
    }
    Ok(())
}

#[async_trait]
impl ResourceReconciler for IsolationSegmentEntitlementReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_isolation_segment_entitlement"
    }

    fn short_kind(&self) -> &'static str {
        "isolation_segment_entitlement"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("segment", Attribute::required_string().requires_replace())
            .with_attribute("orgs", Attribute::optional_string_set())
            .with_attribute("id", Attribute::computed_id())
    }

    async fn create(
        &self,
        session: &Session,
        desired: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let desired: EntitlementRecord = match decode("entitlement", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        if let Err(e) = entitle(session, &desired.segment, &desired.orgs, &BTreeSet::new()).await {
            return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to entitle orgs",
                &e,
            )]));
        }
        let orgs = match read_entitled(session, &desired.segment).await {
            Ok(orgs) => orgs,
            Err(e) => {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Failed to read entitlement",
                    &e,
                )]))
            }
        };
        let record = EntitlementRecord {
            id: desired.segment.clone(),
            segment: desired.segment,
            orgs,
        };
        ReconcileOutput::ok(self.short_kind(), &record.id, &record)
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: EntitlementRecord = match decode("entitlement", prior) {
            Ok(record) => record,
            Err(diags) => {
                return ReadOutput {
                    outcome: ReadOutcome::Gone,
                    identity: None,
                    diagnostics: diags,
                }
            }
        };
        // Reconstructed from the relationship list, not the segment body.
        let segment = if prior.segment.is_empty() {
            prior.id.clone()
        } else {
            prior.segment.clone()
        };
        match read_entitled(session, &segment).await {
            Ok(orgs) => {
                let record = EntitlementRecord {
                    id: segment.clone(),
                    segment,
                    orgs,
                };
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) if e.is_not_found() => ReadOutput::gone(),
            Err(e) => ReadOutput::error("Failed to read entitlement", e.to_string()),
        }
    }

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let plan: EntitlementRecord = match decode("entitlement", plan) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let prior: EntitlementRecord = match decode("entitlement", prior) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let diff = diff_sets(&plan.orgs, &prior.orgs);
        if let Err(e) = entitle(session, &prior.segment, &diff.added, &diff.removed).await {
            // Report what actually converged so state stays truthful.
            let orgs = read_entitled(session, &prior.segment)
                .await
                .unwrap_or_else(|_| prior.orgs.clone());
            let record = EntitlementRecord {
                id: prior.segment.clone(),
                segment: prior.segment,
                orgs,
            };
            let mut output = ReconcileOutput::ok(self.short_kind(), &record.id, &record);
            output
                .diagnostics
                .push(client_diag("Failed to reconcile entitlement", &e));
            return output;
        }

        let orgs = match read_entitled(session, &prior.segment).await {
            Ok(orgs) => orgs,
            Err(e) => {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Failed to read entitlement",
                    &e,
                )]))
            }
        };
        let record = EntitlementRecord {
            id: prior.segment.clone(),
            segment: prior.segment,
            orgs,
        };
        ReconcileOutput::ok(self.short_kind(), &record.id, &record)
    }

    async fn delete(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> Diagnostics {
        let prior: EntitlementRecord = match decode("entitlement", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let mut diagnostics = Diagnostics::new();
        if let Err(e) = entitle(session, &prior.segment, &BTreeSet::new(), &prior.orgs).await {
            if !e.is_not_found() {
                diagnostics.push(client_diag("Failed to revoke entitlement", &e));
            }
        }
        diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_schema() {
        let schema = IsolationSegmentReconciler.schema();
        assert!(schema.get("name").unwrap().required);
        assert!(schema.ids_are_chain_stable());
    }

    #[test]
    fn test_entitlement_segment_forces_replace() {
        let schema = IsolationSegmentEntitlementReconciler.schema();
        assert!(schema
            .get("segment")
            .unwrap()
            .has_modifier(cfweave_core::PlanModifier::RequiresReplace));
    }
}
