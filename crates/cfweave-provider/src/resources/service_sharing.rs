//! `cloudfoundry_service_instance_sharing`
//!
//! The whole resource is one relationship set: the spaces a service
//! instance is shared into. Reconcile order is unshare-then-share to stay
//! inside per-space binding quotas, and after a partial failure the
//! record reports exactly what the platform now holds so host state never
//! drifts from reality.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;

use cfweave_client::types::{SharedSpaces, ToMany};
use cfweave_client::{CancelToken, ClientError, Created};
use cfweave_core::{diff_sets, Attribute, Diagnostics, Schema};

use crate::reconcile::{
    client_diag, decode, ReadOutcome, ReadOutput, ReconcileOutput, ResourceReconciler,
};
use crate::session::Session;

fn relationship_path(instance: &str) -> String {
    format!("/v3/service_instances/{}/relationships/shared_spaces", instance)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingRecord {
    /// Mirrors the service instance guid; sharing has no identity of its own
    pub id: String,
    pub service_instance: String,
    pub spaces: BTreeSet<String>,
}

pub struct ServiceSharingReconciler;

async fn read_shared(
    session: &Session,
    instance: &str,
) -> Result<BTreeSet<String>, ClientError> {
    let list: SharedSpaces = session
        .client()
        .get_json(&relationship_path(instance), &[])
        .await?;
    Ok(list.guids())
}

async fn share(
    session: &Session,
    instance: &str,
    spaces: &BTreeSet<String>,
) -> Result<(), ClientError> {
    if spaces.is_empty() {
        return Ok(());
    }
    let body = json!({
        "data": spaces.iter().map(|guid| json!({ "guid": guid })).collect::<Vec<_>>()
    });
    let _: ToMany = match session
        .client()
        .post_json(&relationship_path(instance), &body)
        .await?
    {
        Created::Resource(list) => list,
        Created::Job(_) => {
            return Err(ClientError::UnexpectedResponse {
                message: "share answered with a job".to_string(),
            })
        }
    };
    Ok(())
}

async fn unshare(
    session: &Session,
    instance: &str,
    spaces: &BTreeSet<String>,
) -> Result<(), ClientError> {
    for space in spaces {
        let result = session
            .client()
            .delete(&format!("{}/{}", relationship_path(instance), space))
            .await;
        match result {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Re-read remote membership so the record reflects what actually
/// happened, falling back to `assumed` when even the read fails.
async fn settle(
    session: &Session,
    instance: &str,
    assumed: BTreeSet<String>,
) -> SharingRecord {
    let spaces = read_shared(session, instance)
        .await
        .unwrap_or(assumed);
    SharingRecord {
        id: instance.to_string(),
        service_instance: instance.to_string(),
        spaces,
    }
}

#[async_trait]
impl ResourceReconciler for ServiceSharingReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_service_instance_sharing"
    }

    fn short_kind(&self) -> &'static str {
        "service_instance_sharing"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute(
                "service_instance",
                Attribute::required_string().requires_replace(),
            )
            .with_attribute("spaces", Attribute::optional_string_set())
            .with_attribute("id", Attribute::computed_id())
    }

    async fn create(
        &self,
        session: &Session,
        desired: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let desired: SharingRecord = match decode("sharing", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        if let Err(e) = share(session, &desired.service_instance, &desired.spaces).await {
            return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to share service instance",
                &e,
            )]));
        }
        let record = settle(session, &desired.service_instance, desired.spaces).await;
        ReconcileOutput::ok(self.short_kind(), &record.id, &record)
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: SharingRecord = match decode("sharing", prior) {
            Ok(record) => record,
            Err(diags) => {
                return ReadOutput {
                    outcome: ReadOutcome::Gone,
                    identity: None,
                    diagnostics: diags,
                }
            }
        };
        let instance = if prior.service_instance.is_empty() {
            prior.id.clone()
        } else {
            prior.service_instance.clone()
        };
        match read_shared(session, &instance).await {
            Ok(spaces) => {
                let record = SharingRecord {
                    id: instance.clone(),
                    service_instance: instance,
                    spaces,
                };
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) if e.is_not_found() => ReadOutput::gone(),
            Err(e) => ReadOutput::error("Failed to read sharing", e.to_string()),
        }
    }

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let plan: SharingRecord = match decode("sharing", plan) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let prior: SharingRecord = match decode("sharing", prior) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let diff = diff_sets(&plan.spaces, &prior.spaces);

        if let Err(e) = unshare(session, &prior.service_instance, &diff.removed).await {
            let record = settle(session, &prior.service_instance, prior.spaces).await;
            let mut output = ReconcileOutput::ok(self.short_kind(), &record.id, &record);
            output
                .diagnostics
                .push(client_diag("Failed to unshare service instance", &e));
            return output;
        }

        if let Err(e) = share(session, &prior.service_instance, &diff.added).await {
            // Unshare already landed: report the intermediate membership.
            let mut assumed = prior.spaces.clone();
            assumed.retain(|space| !diff.removed.contains(space));
            let record = settle(session, &prior.service_instance, assumed).await;
            let mut output = ReconcileOutput::ok(self.short_kind(), &record.id, &record);
            output
                .diagnostics
                .push(client_diag("Failed to share service instance", &e));
            return output;
        }

        let record = settle(session, &prior.service_instance, plan.spaces).await;
        ReconcileOutput::ok(self.short_kind(), &record.id, &record)
    }

    async fn delete(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> Diagnostics {
        let prior: SharingRecord = match decode("sharing", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let mut diagnostics = Diagnostics::new();
        match unshare(session, &prior.service_instance, &prior.spaces).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => diagnostics.push(client_diag("Failed to unshare service instance", &e)),
        }
        diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_a_pure_relationship_set() {
        let schema = ServiceSharingReconciler.schema();
        assert_eq!(
            schema.get("spaces").unwrap().attr_type,
            cfweave_core::AttrType::StringSet
        );
        assert!(schema
            .get("service_instance")
            .unwrap()
            .has_modifier(cfweave_core::PlanModifier::RequiresReplace));
        assert!(schema.ids_are_chain_stable());
    }
}
