//! `cloudfoundry_service_instance`
//!
//! One record shape, two variants: `managed` (broker-provisioned, plan
//! required, asynchronous operations) and `user-provided` (synchronous,
//! credentials instead of a plan). The variant decides which fields are
//! admissible and whether a job must be polled.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use cfweave_client::types::ServiceInstance;
use cfweave_client::{poll_job, CancelToken, Collection, Created};
use cfweave_core::{Attribute, AttributePath, Diagnostics, Metadata, Schema};

use crate::reconcile::{
    client_diag, decode, finish_delete, ReadOutcome, ReadOutput, ReconcileOutput,
    ResourceReconciler,
};
use crate::session::Session;

pub const BASE: &str = "/v3/service_instances";

pub const TYPE_MANAGED: &str = "managed";
pub const TYPE_USER_PROVIDED: &str = "user-provided";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInstanceRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    pub space: String,
    pub service_plan: Option<String>,
    /// Broker parameters (managed); opaque normalized JSON, sensitive
    pub parameters: Option<String>,
    /// Credentials (user-provided); opaque normalized JSON, sensitive
    pub credentials: Option<String>,
    pub tags: Vec<String>,
    pub syslog_drain_url: Option<String>,
    pub route_service_url: Option<String>,
    pub dashboard_url: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl ServiceInstanceRecord {
    pub fn metadata(&self) -> Metadata {
        Metadata {
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
        }
    }

    /// Project the API shape, preserving the write-only fields the
    /// platform does not round-trip.
    fn from_api(instance: ServiceInstance, keep: &ServiceInstanceRecord) -> Self {
        Self {
            id: instance.guid,
            name: instance.name,
            instance_type: instance.instance_type,
            space: instance
                .relationships
                .space
                .guid()
                .unwrap_or_default()
                .to_string(),
            service_plan: instance
                .relationships
                .service_plan
                .guid()
                .map(str::to_string),
            parameters: keep.parameters.clone(),
            credentials: keep.credentials.clone(),
            tags: instance.tags,
            syslog_drain_url: instance.syslog_drain_url,
            route_service_url: instance.route_service_url,
            dashboard_url: instance.dashboard_url,
            labels: instance.metadata.labels,
            annotations: instance.metadata.annotations,
            created_at: Some(instance.created_at.to_rfc3339()),
            updated_at: Some(instance.updated_at.to_rfc3339()),
        }
    }
}

/// Parse an opaque JSON attribute, normalizing whitespace/key order.
pub fn normalize_json(attribute: &str, raw: &str) -> Result<Value, Diagnostics> {
    serde_json::from_str(raw).map_err(|e| {
        let mut diagnostics = Diagnostics::new();
        diagnostics.error_at(
            AttributePath::root(attribute),
            "Invalid JSON",
            e.to_string(),
        );
        diagnostics
    })
}

pub struct ServiceInstanceReconciler;

fn instances(session: &Session) -> Collection<'_, ServiceInstance> {
    session.client().collection("service instance", BASE)
}

#[async_trait]
impl ResourceReconciler for ServiceInstanceReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_service_instance"
    }

    fn short_kind(&self) -> &'static str {
        "service_instance"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("name", Attribute::required_string())
            .with_attribute("type", Attribute::required_string().requires_replace())
            .with_attribute("space", Attribute::required_string().requires_replace())
            .with_attribute("service_plan", Attribute::optional_string())
            .with_attribute("parameters", Attribute::optional_json().sensitive())
            .with_attribute("credentials", Attribute::optional_json().sensitive())
            .with_attribute("tags", Attribute::optional_string_set())
            .with_attribute("syslog_drain_url", Attribute::optional_string())
            .with_attribute("route_service_url", Attribute::optional_string())
            .with_attribute("dashboard_url", Attribute::computed_string())
            .with_common()
    }

    fn validate(&self, config: &Value) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();
        let instance_type = config.get("type").and_then(Value::as_str).unwrap_or("");
        let has_plan = config.get("service_plan").and_then(Value::as_str).is_some();
        let has_credentials = config.get("credentials").and_then(Value::as_str).is_some();
        let has_parameters = config.get("parameters").and_then(Value::as_str).is_some();

        match instance_type {
            TYPE_MANAGED => {
                if !has_plan {
                    diagnostics.error_at(
                        AttributePath::root("service_plan"),
                        "Missing attribute",
                        "managed service instances require 'service_plan'",
                    );
                }
                if has_credentials {
                    diagnostics.error_at(
                        AttributePath::root("credentials"),
                        "Conflicting attributes",
                        "'credentials' is only valid for user-provided instances",
                    );
                }
            }
            TYPE_USER_PROVIDED => {
                if has_plan {
                    diagnostics.error_at(
                        AttributePath::root("service_plan"),
                        "Conflicting attributes",
                        "'service_plan' is only valid for managed instances",
                    );
                }
                if has_parameters {
                    diagnostics.error_at(
                        AttributePath::root("parameters"),
                        "Conflicting attributes",
                        "'parameters' is only valid for managed instances",
                    );
                }
            }
            "" => diagnostics.error_at(
                AttributePath::root("type"),
                "Missing attribute",
                "'type' must be 'managed' or 'user-provided'",
            ),
            other => diagnostics.error_at(
                AttributePath::root("type"),
                "Unknown service instance type",
                format!("'{}' is not 'managed' or 'user-provided'", other),
            ),
        }
        diagnostics
    }

    async fn create(
        &self,
        session: &Session,
        desired: Value,
        cancel: &CancelToken,
    ) -> ReconcileOutput {
        let validation = self.validate(&desired);
        if validation.has_errors() {
            return ReconcileOutput::errors(validation);
        }
        let desired: ServiceInstanceRecord = match decode("service instance", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let mut body = json!({
            "type": desired.instance_type,
            "name": desired.name,
            "relationships": { "space": { "data": { "guid": desired.space } } },
        });
        if !desired.tags.is_empty() {
            body["tags"] = json!(desired.tags);
        }
        if desired.instance_type == TYPE_MANAGED {
            body["relationships"]["service_plan"] =
                json!({ "data": { "guid": desired.service_plan } });
            if let Some(parameters) = &desired.parameters {
                match normalize_json("parameters", parameters) {
                    Ok(value) => body["parameters"] = value,
                    Err(diags) => return ReconcileOutput::errors(diags),
                }
            }
        } else {
            if let Some(credentials) = &desired.credentials {
                match normalize_json("credentials", credentials) {
                    Ok(value) => body["credentials"] = value,
                    Err(diags) => return ReconcileOutput::errors(diags),
                }
            }
            if let Some(url) = &desired.syslog_drain_url {
                body["syslog_drain_url"] = json!(url);
            }
            if let Some(url) = &desired.route_service_url {
                body["route_service_url"] = json!(url);
            }
        }
        if let Some(metadata) = cfweave_client::types::metadata_for_create(&desired.metadata()) {
            body["metadata"] = metadata;
        }

        match instances(session).create(&body).await {
            // User-provided instances answer synchronously.
            Ok(Created::Resource(instance)) => {
                let record = ServiceInstanceRecord::from_api(instance, &desired);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            // Managed instances answer with a provisioning job.
            Ok(Created::Job(job)) => {
                if let Err(e) =
                    poll_job(session.client(), &job, session.poll_options(), cancel).await
                {
                    return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                        "Service instance provisioning did not complete",
                        &e,
                    )]));
                }
                let fetched = instances(session)
                    .single(&[
                        ("names", desired.name.as_str()),
                        ("space_guids", desired.space.as_str()),
                    ])
                    .await;
                match fetched {
                    Ok(instance) => {
                        let record = ServiceInstanceRecord::from_api(instance, &desired);
                        ReconcileOutput::ok(self.short_kind(), &record.id, &record)
                    }
                    Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                        "Failed to read service instance after provisioning",
                        &e,
                    )])),
                }
            }
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to create service instance",
                &e,
            )])),
        }
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: ServiceInstanceRecord = match decode("service instance", prior) {
            Ok(record) => record,
            Err(diags) => {
                return ReadOutput {
                    outcome: ReadOutcome::Gone,
                    identity: None,
                    diagnostics: diags,
                }
            }
        };
        match instances(session).get(&prior.id).await {
            Ok(instance) => {
                let record = ServiceInstanceRecord::from_api(instance, &prior);
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) if e.is_not_found() => ReadOutput::gone(),
            Err(e) => ReadOutput::error("Failed to read service instance", e.to_string()),
        }
    }

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        cancel: &CancelToken,
    ) -> ReconcileOutput {
        let plan: ServiceInstanceRecord = match decode("service instance", plan) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let prior: ServiceInstanceRecord = match decode("service instance", prior) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let metadata = Metadata::diff(&prior.metadata(), &plan.metadata());
        let mut body = json!({
            "name": plan.name,
            "tags": plan.tags,
            "metadata": metadata,
        });
        if plan.instance_type == TYPE_MANAGED {
            if plan.service_plan != prior.service_plan {
                body["relationships"] =
                    json!({ "service_plan": { "data": { "guid": plan.service_plan } } });
            }
            if let Some(parameters) = &plan.parameters {
                match normalize_json("parameters", parameters) {
                    Ok(value) => body["parameters"] = value,
                    Err(diags) => return ReconcileOutput::errors(diags),
                }
            }
        } else {
            if let Some(credentials) = &plan.credentials {
                match normalize_json("credentials", credentials) {
                    Ok(value) => body["credentials"] = value,
                    Err(diags) => return ReconcileOutput::errors(diags),
                }
            }
            if let Some(url) = &plan.syslog_drain_url {
                body["syslog_drain_url"] = json!(url);
            }
            if let Some(url) = &plan.route_service_url {
                body["route_service_url"] = json!(url);
            }
        }

        let response = session
            .client()
            .patch_maybe_job::<ServiceInstance>(&format!("{}/{}", BASE, prior.id), &body)
            .await;
        match response {
            Ok(Created::Resource(instance)) => {
                let record = ServiceInstanceRecord::from_api(instance, &plan);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Ok(Created::Job(job)) => {
                if let Err(e) =
                    poll_job(session.client(), &job, session.poll_options(), cancel).await
                {
                    return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                        "Service instance update did not complete",
                        &e,
                    )]));
                }
                match instances(session).get(&prior.id).await {
                    Ok(instance) => {
                        let record = ServiceInstanceRecord::from_api(instance, &plan);
                        ReconcileOutput::ok(self.short_kind(), &record.id, &record)
                    }
                    Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                        "Failed to read service instance after update",
                        &e,
                    )])),
                }
            }
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to update service instance",
                &e,
            )])),
        }
    }

    async fn delete(&self, session: &Session, prior: Value, cancel: &CancelToken) -> Diagnostics {
        let prior: ServiceInstanceRecord = match decode("service instance", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let result = instances(session).delete(&prior.id).await;
        finish_delete(session, "service instance", result, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_requires_plan() {
        let diags = ServiceInstanceReconciler.validate(&json!({
            "type": "managed",
            "name": "db",
            "space": "s-1"
        }));
        assert!(diags.has_errors());
    }

    #[test]
    fn test_user_provided_rejects_plan_and_parameters() {
        let diags = ServiceInstanceReconciler.validate(&json!({
            "type": "user-provided",
            "name": "logs",
            "space": "s-1",
            "service_plan": "p-1"
        }));
        assert!(diags.has_errors());

        let diags = ServiceInstanceReconciler.validate(&json!({
            "type": "user-provided",
            "name": "logs",
            "space": "s-1",
            "credentials": "{\"uri\":\"syslog://x\"}"
        }));
        assert!(!diags.has_errors());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let diags = ServiceInstanceReconciler.validate(&json!({ "type": "weird" }));
        assert!(diags.has_errors());
    }

    #[test]
    fn test_normalize_json_rejects_garbage() {
        assert!(normalize_json("parameters", "{not json").is_err());
        let value = normalize_json("parameters", r#"{ "a" : 1 }"#).unwrap();
        assert_eq!(serde_json::to_string(&value).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn test_sensitive_attributes() {
        let schema = ServiceInstanceReconciler.schema();
        assert!(schema.get("parameters").unwrap().sensitive);
        assert!(schema.get("credentials").unwrap().sensitive);
        assert!(schema.ids_are_chain_stable());
    }
}
