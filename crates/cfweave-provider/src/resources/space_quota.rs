//! `cloudfoundry_space_quota`
//!
//! Unlike org quotas, space quotas can be unapplied, so the spaces
//! relationship reconciles remove-then-add.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;

use cfweave_client::types::{QuotaApps, QuotaRoutes, QuotaServices, SpaceQuota, ToMany};
use cfweave_client::{CancelToken, ClientError, Collection, Created};
use cfweave_core::{diff_sets, Attribute, Diagnostics, Schema};

use crate::reconcile::{
    client_diag, decode, finish_delete, ReadOutcome, ReadOutput, ReconcileOutput,
    ResourceReconciler,
};
use crate::session::Session;

pub const BASE: &str = "/v3/space_quotas";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceQuotaRecord {
    pub id: String,
    pub name: String,
    pub org: String,
    pub total_memory: Option<i64>,
    pub instance_memory: Option<i64>,
    pub total_app_instances: Option<i64>,
    pub total_app_tasks: Option<i64>,
    pub total_app_log_rate_limit: Option<i64>,
    pub allow_paid_service_plans: Option<bool>,
    pub total_services: Option<i64>,
    pub total_service_keys: Option<i64>,
    pub total_routes: Option<i64>,
    pub total_route_ports: Option<i64>,
    pub spaces: BTreeSet<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl SpaceQuotaRecord {
    fn from_api(quota: SpaceQuota) -> Self {
        Self {
            id: quota.guid,
            name: quota.name,
            org: quota
                .relationships
                .organization
                .guid()
                .unwrap_or_default()
                .to_string(),
            total_memory: quota.apps.total_memory_in_mb,
            instance_memory: quota.apps.per_process_memory_in_mb,
            total_app_instances: quota.apps.total_instances,
            total_app_tasks: quota.apps.per_app_tasks,
            total_app_log_rate_limit: quota.apps.log_rate_limit_in_bytes_per_second,
            allow_paid_service_plans: quota.services.paid_services_allowed,
            total_services: quota.services.total_service_instances,
            total_service_keys: quota.services.total_service_keys,
            total_routes: quota.routes.total_routes,
            total_route_ports: quota.routes.total_reserved_ports,
            spaces: quota.relationships.spaces.guids(),
            created_at: Some(quota.created_at.to_rfc3339()),
            updated_at: Some(quota.updated_at.to_rfc3339()),
        }
    }

    fn attribute_body(&self) -> Value {
        json!({
            "name": self.name,
            "apps": QuotaApps {
                total_memory_in_mb: self.total_memory,
                per_process_memory_in_mb: self.instance_memory,
                total_instances: self.total_app_instances,
                per_app_tasks: self.total_app_tasks,
                log_rate_limit_in_bytes_per_second: self.total_app_log_rate_limit,
            },
            "services": QuotaServices {
                paid_services_allowed: self.allow_paid_service_plans,
                total_service_instances: self.total_services,
                total_service_keys: self.total_service_keys,
            },
            "routes": QuotaRoutes {
                total_routes: self.total_routes,
                total_reserved_ports: self.total_route_ports,
            },
        })
    }
}

pub struct SpaceQuotaReconciler;

fn quotas(session: &Session) -> Collection<'_, SpaceQuota> {
    session.client().collection("space quota", BASE)
}

async fn apply_spaces(
    session: &Session,
    quota_guid: &str,
    added: &BTreeSet<String>,
    removed: &BTreeSet<String>,
) -> Result<(), ClientError> {
    // Remove first to stay inside assignment limits.
    for space in removed {
        let result = session
            .client()
            .delete(&format!("{}/{}/relationships/spaces/{}", BASE, quota_guid, space))
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
            .post_json(&format!("{}/{}/relationships/spaces", BASE, quota_guid), &body)
            .await?
        {
            Created::Resource(list) => list,
            Created::Job(_) => {
                return Err(ClientError::UnexpectedResponse {
                    message: "space quota assignment answered with a job".to_string(),
                })
            }
        };
    }
    Ok(())
}

#[async_trait]
impl ResourceReconciler for SpaceQuotaReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_space_quota"
    }

    fn short_kind(&self) -> &'static str {
        "space_quota"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("name", Attribute::required_string())
            .with_attribute("org", Attribute::required_string().requires_replace())
            .with_attribute("total_memory", Attribute::optional_int())
            .with_attribute("instance_memory", Attribute::optional_int())
            .with_attribute("total_app_instances", Attribute::optional_int())
            .with_attribute("total_app_tasks", Attribute::optional_int())
            .with_attribute("total_app_log_rate_limit", Attribute::optional_int())
            .with_attribute("allow_paid_service_plans", Attribute::optional_bool())
            .with_attribute("total_services", Attribute::optional_int())
            .with_attribute("total_service_keys", Attribute::optional_int())
            .with_attribute("total_routes", Attribute::optional_int())
            .with_attribute("total_route_ports", Attribute::optional_int())
            .with_attribute("spaces", Attribute::optional_string_set())
            .with_attribute("id", Attribute::computed_id())
            .with_attribute("created_at", Attribute::computed_string())
            .with_attribute("updated_at", Attribute::computed_string())
    }

    async fn create(
        &self,
        session: &Session,
        desired: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let desired: SpaceQuotaRecord = match decode("space quota", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let mut body = desired.attribute_body();
        let mut relationships = json!({
            "organization": { "data": { "guid": desired.org } }
        });
        if !desired.spaces.is_empty() {
            relationships["spaces"] = json!({
                "data": desired.spaces.iter().map(|guid| json!({ "guid": guid })).collect::<Vec<_>>()
            });
        }
        body["relationships"] = relationships;

        match quotas(session).create(&body).await {
            Ok(Created::Resource(quota)) => {
                let record = SpaceQuotaRecord::from_api(quota);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Ok(Created::Job(_)) => ReconcileOutput::error(
                "Failed to create space quota",
                "quota create answered with a job",
            ),
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to create space quota",
                &e,
            )])),
        }
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: SpaceQuotaRecord = match decode("space quota", prior) {
            Ok(record) => record,
            Err(diags) => {
                return ReadOutput {
                    outcome: ReadOutcome::Gone,
                    identity: None,
                    diagnostics: diags,
                }
            }
        };
        match quotas(session).get(&prior.id).await {
            Ok(quota) => {
                let record = SpaceQuotaRecord::from_api(quota);
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) if e.is_not_found() => ReadOutput::gone(),
            Err(e) => ReadOutput::error("Failed to read space quota", e.to_string()),
        }
    }

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let plan: SpaceQuotaRecord = match decode("space quota", plan) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let prior: SpaceQuotaRecord = match decode("space quota", prior) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let diff = diff_sets(&plan.spaces, &prior.spaces);
        if let Err(e) = apply_spaces(session, &prior.id, &diff.added, &diff.removed).await {
            return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to reconcile space quota assignment",
                &e,
            )]));
        }

        match quotas(session).update(&prior.id, &plan.attribute_body()).await {
            Ok(quota) => {
                let record = SpaceQuotaRecord::from_api(quota);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to update space quota",
                &e,
            )])),
        }
    }

    async fn delete(&self, session: &Session, prior: Value, cancel: &CancelToken) -> Diagnostics {
        let prior: SpaceQuotaRecord = match decode("space quota", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let result = quotas(session).delete(&prior.id).await;
        finish_delete(session, "space quota", result, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spaces_relationship_is_a_set() {
        let schema = SpaceQuotaReconciler.schema();
        assert_eq!(
            schema.get("spaces").unwrap().attr_type,
            cfweave_core::AttrType::StringSet
        );
        assert!(schema.ids_are_chain_stable());
    }

    #[test]
    fn test_attribute_body_has_no_domains_section() {
        let record = SpaceQuotaRecord {
            name: "dev".to_string(),
            ..SpaceQuotaRecord::default()
        };
        let body = record.attribute_body();
        assert!(body.get("domains").is_none());
    }
}
