//! `cloudfoundry_org_quota`
//!
//! The orgs relationship is set-diffed, but the platform has no unassign
//! endpoint for org quotas: a plan that drops an org fails up front with
//! a diagnostic naming the offenders, and no mutation is issued.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;

use cfweave_client::types::{OrgQuota, QuotaApps, QuotaDomains, QuotaRoutes, QuotaServices};
use cfweave_client::{CancelToken, Collection, Created};
use cfweave_core::{diff_sets, Attribute, AttributePath, Diagnostics, Schema};

use crate::reconcile::{
    client_diag, decode, finish_delete, ReadOutcome, ReadOutput, ReconcileOutput,
    ResourceReconciler,
};
use crate::session::Session;

pub const BASE: &str = "/v3/organization_quotas";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrgQuotaRecord {
    pub id: String,
    pub name: String,
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
    pub total_private_domains: Option<i64>,
    pub orgs: BTreeSet<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl OrgQuotaRecord {
    fn from_api(quota: OrgQuota) -> Self {
        Self {
            id: quota.guid,
            name: quota.name,
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
            total_private_domains: quota.domains.total_domains,
            orgs: quota.relationships.organizations.guids(),
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
            "domains": QuotaDomains {
                total_domains: self.total_private_domains,
            },
        })
    }
}

pub struct OrgQuotaReconciler;

fn quotas(session: &Session) -> Collection<'_, OrgQuota> {
    session.client().collection("organization quota", BASE)
}

#[async_trait]
impl ResourceReconciler for OrgQuotaReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_org_quota"
    }

    fn short_kind(&self) -> &'static str {
        "org_quota"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("name", Attribute::required_string())
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
            .with_attribute("total_private_domains", Attribute::optional_int())
            .with_attribute("orgs", Attribute::optional_string_set())
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
        let desired: OrgQuotaRecord = match decode("org quota", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let mut body = desired.attribute_body();
        if !desired.orgs.is_empty() {
            body["relationships"] = json!({
                "organizations": {
                    "data": desired.orgs.iter().map(|guid| json!({ "guid": guid })).collect::<Vec<_>>()
                }
            });
        }

        match quotas(session).create(&body).await {
            Ok(Created::Resource(quota)) => {
                let record = OrgQuotaRecord::from_api(quota);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Ok(Created::Job(_)) => ReconcileOutput::error(
                "Failed to create org quota",
                "quota create answered with a job",
            ),
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to create org quota",
                &e,
            )])),
        }
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: OrgQuotaRecord = match decode("org quota", prior) {
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
                let record = OrgQuotaRecord::from_api(quota);
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) if e.is_not_found() => ReadOutput::gone(),
            Err(e) => ReadOutput::error("Failed to read org quota", e.to_string()),
        }
    }

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let plan: OrgQuotaRecord = match decode("org quota", plan) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let prior: OrgQuotaRecord = match decode("org quota", prior) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        // Refuse unassignment before touching the platform.
        let diff = diff_sets(&plan.orgs, &prior.orgs);
        if !diff.removed.is_empty() {
            let mut diagnostics = Diagnostics::new();
            diagnostics.error_at(
                AttributePath::root("orgs"),
                "Org quota unassignment is unsupported",
                format!(
                    "the platform cannot unassign a quota; offending orgs: {}",
                    diff.removed.iter().cloned().collect::<Vec<_>>().join(", ")
                ),
            );
            return ReconcileOutput::errors(diagnostics);
        }

        let updated = match quotas(session).update(&prior.id, &plan.attribute_body()).await {
            Ok(quota) => quota,
            Err(e) => {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Failed to update org quota",
                    &e,
                )]))
            }
        };

        let mut record = OrgQuotaRecord::from_api(updated);
        if !diff.added.is_empty() {
            let body = json!({
                "data": diff.added.iter().map(|guid| json!({ "guid": guid })).collect::<Vec<_>>()
            });
            let assigned: Result<cfweave_client::types::ToMany, _> = session
                .client()
                .post_json(&format!("{}/{}/relationships/organizations", BASE, prior.id), &body)
                .await
                .and_then(|created| match created {
                    Created::Resource(list) => Ok(list),
                    Created::Job(_) => Err(cfweave_client::ClientError::UnexpectedResponse {
                        message: "quota assignment answered with a job".to_string(),
                    }),
                });
            match assigned {
                Ok(list) => record.orgs = list.guids(),
                Err(e) => {
                    let mut output = ReconcileOutput::ok(self.short_kind(), &record.id, &record);
                    output
                        .diagnostics
                        .push(client_diag("Failed to assign org quota", &e));
                    return output;
                }
            }
        }

        ReconcileOutput::ok(self.short_kind(), &record.id, &record)
    }

    async fn delete(&self, session: &Session, prior: Value, cancel: &CancelToken) -> Diagnostics {
        let prior: OrgQuotaRecord = match decode("org quota", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let result = quotas(session).delete(&prior.id).await;
        finish_delete(session, "org quota", result, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_body_skips_unset_limits() {
        let record = OrgQuotaRecord {
            name: "runtime".to_string(),
            total_memory: Some(10240),
            ..OrgQuotaRecord::default()
        };
        let body = record.attribute_body();
        assert_eq!(body["apps"]["total_memory_in_mb"], 10240);
        assert!(body["apps"].get("total_instances").is_none());
    }

    #[test]
    fn test_schema_orgs_is_a_set() {
        let schema = OrgQuotaReconciler.schema();
        assert_eq!(
            schema.get("orgs").unwrap().attr_type,
            cfweave_core::AttrType::StringSet
        );
        assert!(schema.ids_are_chain_stable());
    }
}
