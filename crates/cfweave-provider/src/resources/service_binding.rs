//! `cloudfoundry_service_credential_binding`
//!
//! Tagged union over `type`: an `app` binding attaches an instance to an
//! application, a `key` is a named credential handle. Managed parents
//! answer with a broker job; user-provided parents are synchronous - the
//! reconciler decides by what the endpoint returned, not by looking up
//! the parent. Credentials and broker parameters come from two separate
//! sub-endpoints after create; either one failing downgrades to a null
//! field plus a warning because the binding itself exists.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use cfweave_client::types::ServiceCredentialBinding;
use cfweave_client::{poll_job, CancelToken, ClientError, Collection, Created};
use cfweave_core::{Attribute, AttributePath, Diagnostics, Metadata, Schema};

use crate::reconcile::{
    client_diag, decode, finish_delete, ReadOutcome, ReadOutput, ReconcileOutput,
    ResourceReconciler,
};
use crate::resources::service_instance::normalize_json;
use crate::session::Session;

pub const BASE: &str = "/v3/service_credential_bindings";

pub const TYPE_APP: &str = "app";
pub const TYPE_KEY: &str = "key";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceBindingRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub binding_type: String,
    /// Key name; unused for app bindings
    pub name: Option<String>,
    /// Bound app; unused for keys
    pub app: Option<String>,
    pub service_instance: String,
    /// User-supplied broker parameters, opaque JSON, sensitive
    pub parameters: Option<String>,
    /// Broker credential payload, opaque normalized JSON, sensitive
    pub credentials: Option<String>,
    /// Broker-reported parameters, opaque normalized JSON, sensitive
    pub broker_parameters: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl ServiceBindingRecord {
    pub fn metadata(&self) -> Metadata {
        Metadata {
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
        }
    }

    fn from_api(binding: ServiceCredentialBinding, keep: &ServiceBindingRecord) -> Self {
        Self {
            id: binding.guid,
            binding_type: binding.binding_type,
            name: binding.name,
            app: binding.relationships.app.guid().map(str::to_string),
            service_instance: binding
                .relationships
                .service_instance
                .guid()
                .unwrap_or_default()
                .to_string(),
            parameters: keep.parameters.clone(),
            credentials: keep.credentials.clone(),
            broker_parameters: keep.broker_parameters.clone(),
            labels: binding.metadata.labels,
            annotations: binding.metadata.annotations,
            created_at: Some(binding.created_at.to_rfc3339()),
            updated_at: Some(binding.updated_at.to_rfc3339()),
        }
    }
}

pub struct ServiceBindingReconciler;

fn bindings(session: &Session) -> Collection<'_, ServiceCredentialBinding> {
    session.client().collection("service credential binding", BASE)
}

/// Fetch one sensitive sub-endpoint, normalizing the payload to a compact
/// JSON string. `Ok(None)` means the endpoint answered but carried
/// nothing.
async fn fetch_opaque(
    session: &Session,
    path: &str,
    unwrap_key: Option<&str>,
) -> Result<Option<String>, ClientError> {
    let payload: Value = session.client().get_json(path, &[]).await?;
    let payload = match unwrap_key {
        Some(key) => payload.get(key).cloned().unwrap_or(Value::Null),
        None => payload,
    };
    if payload.is_null() {
        return Ok(None);
    }
    Ok(Some(payload.to_string()))
}

/// Post-create credential retrieval with the warn-don't-fail downgrade.
async fn enrich_sensitive(
    session: &Session,
    record: &mut ServiceBindingRecord,
    diagnostics: &mut Diagnostics,
) {
    match fetch_opaque(session, &format!("{}/{}/details", BASE, record.id), Some("credentials"))
        .await
    {
        Ok(credentials) => record.credentials = credentials,
        Err(e) => {
            record.credentials = None;
            diagnostics.warning(
                "Binding credentials unavailable",
                format!("the credential endpoint failed: {}", e),
            );
        }
    }
    match fetch_opaque(
        session,
        &format!("{}/{}/parameters", BASE, record.id),
        None,
    )
    .await
    {
        Ok(parameters) => record.broker_parameters = parameters,
        Err(e) => {
            record.broker_parameters = None;
            diagnostics.warning(
                "Binding parameters unavailable",
                format!("the parameter endpoint failed: {}", e),
            );
        }
    }
}

#[async_trait]
impl ResourceReconciler for ServiceBindingReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_service_credential_binding"
    }

    fn short_kind(&self) -> &'static str {
        "service_credential_binding"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("type", Attribute::required_string().requires_replace())
            .with_attribute("name", Attribute::optional_string().requires_replace())
            .with_attribute("app", Attribute::optional_string().requires_replace())
            .with_attribute(
                "service_instance",
                Attribute::required_string().requires_replace(),
            )
            .with_attribute(
                "parameters",
                Attribute::optional_json().sensitive().requires_replace(),
            )
            .with_attribute("credentials", {
                let mut attr = Attribute::optional_json().sensitive();
                attr.optional = false;
                attr.computed = true;
                attr
            })
            .with_attribute("broker_parameters", {
                let mut attr = Attribute::optional_json().sensitive();
                attr.optional = false;
                attr.computed = true;
                attr
            })
            .with_common()
    }

    fn validate(&self, config: &Value) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();
        let binding_type = config.get("type").and_then(Value::as_str).unwrap_or("");
        let has_name = config.get("name").and_then(Value::as_str).is_some();
        let has_app = config.get("app").and_then(Value::as_str).is_some();

        match binding_type {
            TYPE_APP => {
                if !has_app {
                    diagnostics.error_at(
                        AttributePath::root("app"),
                        "Missing attribute",
                        "app bindings require 'app'",
                    );
                }
                if has_name {
                    diagnostics.error_at(
                        AttributePath::root("name"),
                        "Conflicting attributes",
                        "'name' is only valid for keys",
                    );
                }
            }
            TYPE_KEY => {
                if !has_name {
                    diagnostics.error_at(
                        AttributePath::root("name"),
                        "Missing attribute",
                        "keys require 'name'",
                    );
                }
                if has_app {
                    diagnostics.error_at(
                        AttributePath::root("app"),
                        "Conflicting attributes",
                        "'app' is only valid for app bindings",
                    );
                }
            }
            other => diagnostics.error_at(
                AttributePath::root("type"),
                "Unknown binding type",
                format!("'{}' is not 'app' or 'key'", other),
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
        let desired: ServiceBindingRecord = match decode("service binding", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let mut body = json!({
            "type": desired.binding_type,
            "relationships": {
                "service_instance": { "data": { "guid": desired.service_instance } }
            }
        });
        if desired.binding_type == TYPE_APP {
            body["relationships"]["app"] = json!({ "data": { "guid": desired.app } });
        } else if let Some(name) = &desired.name {
            body["name"] = json!(name);
        }
        if let Some(parameters) = &desired.parameters {
            match normalize_json("parameters", parameters) {
                Ok(value) => body["parameters"] = value,
                Err(diags) => return ReconcileOutput::errors(diags),
            }
        }
        if let Some(metadata) = cfweave_client::types::metadata_for_create(&desired.metadata()) {
            body["metadata"] = metadata;
        }

        let binding = match bindings(session).create(&body).await {
            // User-provided parent: the binding comes straight back.
            Ok(Created::Resource(binding)) => binding,
            // Managed parent: a broker job was started.
            Ok(Created::Job(job)) => {
                if let Err(e) =
                    poll_job(session.client(), &job, session.poll_options(), cancel).await
                {
                    return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                        "Binding operation did not complete",
                        &e,
                    )]));
                }
                // Re-locate by the filter matching this variant.
                let query: Vec<(&str, &str)> = if desired.binding_type == TYPE_APP {
                    vec![
                        ("service_instance_guids", desired.service_instance.as_str()),
                        ("app_guids", desired.app.as_deref().unwrap_or_default()),
                    ]
                } else {
                    vec![
                        ("service_instance_guids", desired.service_instance.as_str()),
                        ("names", desired.name.as_deref().unwrap_or_default()),
                    ]
                };
                match bindings(session).single(&query).await {
                    Ok(binding) => binding,
                    Err(e) => {
                        return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                            "Failed to read binding after creation",
                            &e,
                        )]))
                    }
                }
            }
            Err(e) => {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Failed to create binding",
                    &e,
                )]))
            }
        };

        let mut record = ServiceBindingRecord::from_api(binding, &desired);
        let mut diagnostics = Diagnostics::new();
        enrich_sensitive(session, &mut record, &mut diagnostics).await;
        ReconcileOutput::ok(self.short_kind(), &record.id, &record).with_warnings(diagnostics)
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: ServiceBindingRecord = match decode("service binding", prior) {
            Ok(record) => record,
            Err(diags) => {
                return ReadOutput {
                    outcome: ReadOutcome::Gone,
                    identity: None,
                    diagnostics: diags,
                }
            }
        };
        match bindings(session).get(&prior.id).await {
            Ok(binding) => {
                // Sensitive fields are preserved from prior state, not
                // re-fetched on every refresh.
                let record = ServiceBindingRecord::from_api(binding, &prior);
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) if e.is_not_found() => ReadOutput::gone(),
            Err(e) => ReadOutput::error("Failed to read binding", e.to_string()),
        }
    }

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let plan: ServiceBindingRecord = match decode("service binding", plan) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let prior: ServiceBindingRecord = match decode("service binding", prior) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        // Everything but metadata forces replacement.
        let metadata = Metadata::diff(&prior.metadata(), &plan.metadata());
        match bindings(session)
            .update(&prior.id, &json!({ "metadata": metadata }))
            .await
        {
            Ok(binding) => {
                let record = ServiceBindingRecord::from_api(binding, &plan);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to update binding",
                &e,
            )])),
        }
    }

    async fn delete(&self, session: &Session, prior: Value, cancel: &CancelToken) -> Diagnostics {
        let prior: ServiceBindingRecord = match decode("service binding", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let result = bindings(session).delete(&prior.id).await;
        finish_delete(session, "service credential binding", result, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_binding_requires_app_and_no_name() {
        let diags = ServiceBindingReconciler.validate(&json!({
            "type": "app",
            "service_instance": "si-1",
            "name": "oops"
        }));
        assert!(diags.has_errors());

        let diags = ServiceBindingReconciler.validate(&json!({
            "type": "app",
            "service_instance": "si-1",
            "app": "app-1"
        }));
        assert!(!diags.has_errors());
    }

    #[test]
    fn test_key_requires_name_and_no_app() {
        let diags = ServiceBindingReconciler.validate(&json!({
            "type": "key",
            "service_instance": "si-1",
            "app": "app-1",
            "name": "k"
        }));
        assert!(diags.has_errors());

        let diags = ServiceBindingReconciler.validate(&json!({
            "type": "key",
            "service_instance": "si-1",
            "name": "k"
        }));
        assert!(!diags.has_errors());
    }

    #[test]
    fn test_sensitive_computed_fields() {
        let schema = ServiceBindingReconciler.schema();
        let credentials = schema.get("credentials").unwrap();
        assert!(credentials.sensitive);
        assert!(credentials.computed);
        assert!(schema.ids_are_chain_stable());
    }
}
