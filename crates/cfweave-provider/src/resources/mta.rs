//! `cloudfoundry_mta`
//!
//! Multi-target application deployments: upload the archive and any
//! extension descriptors, submit the deploy operation, poll it to a
//! terminal phase. The MTA identifier comes out of the archive itself;
//! an update whose archive declares a different identifier than the one
//! deployed in the namespace is a user error (a collision), never a
//! silent replace.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use cfweave_client::mta::{inspect_archive, DeployRequest, Mta, MtaClient, MtaStrategy};
use cfweave_client::{CancelToken, ClientError};
use cfweave_core::{Attribute, AttributePath, Diagnostics, Identity, Schema};

use crate::reconcile::{
    client_diag, decode, ReadOutcome, ReadOutput, ReconcileOutput, ResourceReconciler,
};
use crate::session::Session;

const OPERATION_DEADLINE: Duration = Duration::from_secs(60 * 60);
const OPERATION_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MtaRecord {
    /// `<space>/<mta id>`: MTA identifiers are archive-scoped, not GUIDs
    pub id: String,
    pub space: String,
    pub archive_path: String,
    pub extension_descriptors: Vec<String>,
    pub namespace: Option<String>,
    pub strategy: Option<String>,
    pub version_rule: Option<String>,
    pub modules: BTreeSet<String>,
    /// Deploy-service endpoint override for non-standard system domains
    pub deploy_url: Option<String>,
    pub mta_id: String,
    pub mta_version: Option<String>,
    pub app_names: Vec<String>,
    pub service_names: Vec<String>,
}

impl MtaRecord {
    fn composite_id(space: &str, mta_id: &str) -> String {
        format!("{}/{}", space, mta_id)
    }

    fn from_deployed(&self, deployed: &Mta) -> Self {
        let mut record = self.clone();
        record.mta_id = deployed.metadata.id.clone();
        record.mta_version = (!deployed.metadata.version.is_empty())
            .then(|| deployed.metadata.version.clone());
        record.namespace = deployed
            .metadata
            .namespace
            .clone()
            .or_else(|| self.namespace.clone());
        record.app_names = deployed
            .modules
            .iter()
            .map(|m| m.app_name.clone())
            .filter(|name| !name.is_empty())
            .collect();
        record.service_names = deployed.services.clone();
        record.id = Self::composite_id(&self.space, &deployed.metadata.id);
        record
    }
}

pub struct MtaReconciler;

fn deploy_client<'a>(
    session: &'a Session,
    record: &MtaRecord,
) -> Result<MtaClient<'a>, ClientError> {
    match &record.deploy_url {
        Some(endpoint) => MtaClient::with_endpoint(session.client(), endpoint),
        None => MtaClient::new(session.client()),
    }
}

fn strategy_of(record: &MtaRecord, diagnostics: &mut Diagnostics) -> MtaStrategy {
    match record.strategy.as_deref() {
        None => MtaStrategy::Deploy,
        Some(raw) => match MtaStrategy::parse(raw) {
            Some(strategy) => strategy,
            None => {
                diagnostics.error_at(
                    AttributePath::root("strategy"),
                    "Unknown deploy strategy",
                    format!("'{}' is not 'deploy' or 'blue-green-deploy'", raw),
                );
                MtaStrategy::Deploy
            }
        },
    }
}

/// Upload everything and run the deploy operation to completion.
async fn run_deploy(
    session: &Session,
    record: &MtaRecord,
    strategy: MtaStrategy,
    cancel: &CancelToken,
) -> Result<Mta, Diagnostics> {
    let client = deploy_client(session, record).map_err(|e| {
        Diagnostics::from_iter([client_diag("Deploy service unavailable", &e)])
    })?;
    let namespace = record.namespace.as_deref();

    let archive = client
        .upload_file(&record.space, Path::new(&record.archive_path), namespace)
        .await
        .map_err(|e| Diagnostics::from_iter([client_diag("Archive upload failed", &e)]))?;

    let mut ext_ids = Vec::new();
    for descriptor in &record.extension_descriptors {
        let uploaded = client
            .upload_file(&record.space, Path::new(descriptor), namespace)
            .await
            .map_err(|e| {
                Diagnostics::from_iter([client_diag("Extension descriptor upload failed", &e)])
            })?;
        ext_ids.push(uploaded.id);
    }

    let request = DeployRequest {
        archive_id: archive.id,
        ext_descriptor_ids: ext_ids,
        namespace: namespace.map(str::to_string),
        version_rule: record.version_rule.clone(),
        modules: record.modules.iter().cloned().collect(),
    };
    let operation_id = client
        .start_deploy(&record.space, strategy, &request)
        .await
        .map_err(|e| Diagnostics::from_iter([client_diag("Deploy submission failed", &e)]))?;

    client
        .poll_operation(
            &record.space,
            &operation_id,
            OPERATION_DEADLINE,
            OPERATION_INTERVAL,
            cancel,
        )
        .await
        .map_err(|e| Diagnostics::from_iter([client_diag("Deploy operation failed", &e)]))?;

    let descriptor = inspect_archive(Path::new(&record.archive_path)).map_err(|e| {
        Diagnostics::from_iter([client_diag("Archive inspection failed", &e)])
    })?;
    client
        .get_mta(&record.space, &descriptor.id, namespace)
        .await
        .map_err(|e| {
            Diagnostics::from_iter([client_diag("Failed to read MTA after deploy", &e)])
        })
}

#[async_trait]
impl ResourceReconciler for MtaReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_mta"
    }

    fn short_kind(&self) -> &'static str {
        "mta"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("space", Attribute::required_string().requires_replace())
            .with_attribute("archive_path", Attribute::required_string())
            .with_attribute("extension_descriptors", Attribute::optional_string_set())
            .with_attribute(
                "namespace",
                Attribute::optional_string().requires_replace(),
            )
            .with_attribute("strategy", Attribute::optional_string())
            .with_attribute("version_rule", Attribute::optional_string())
            .with_attribute("modules", Attribute::optional_string_set())
            .with_attribute("deploy_url", Attribute::optional_string())
            .with_attribute("mta_id", Attribute::computed_string())
            .with_attribute("mta_version", Attribute::computed_string())
            .with_attribute("app_names", Attribute::optional_string_set())
            .with_attribute("service_names", Attribute::optional_string_set())
            .with_attribute("id", Attribute::computed_id())
    }

    fn validate(&self, config: &Value) -> Diagnostics {
        let mut diagnostics = Diagnostics::new();
        if let Some(strategy) = config.get("strategy").and_then(Value::as_str) {
            if MtaStrategy::parse(strategy).is_none() {
                diagnostics.error_at(
                    AttributePath::root("strategy"),
                    "Unknown deploy strategy",
                    format!("'{}' is not 'deploy' or 'blue-green-deploy'", strategy),
                );
            }
        }
        diagnostics
    }

    async fn create(
        &self,
        session: &Session,
        desired: Value,
        cancel: &CancelToken,
    ) -> ReconcileOutput {
        let desired: MtaRecord = match decode("mta", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let mut diagnostics = Diagnostics::new();
        let strategy = strategy_of(&desired, &mut diagnostics);
        if diagnostics.has_errors() {
            return ReconcileOutput::errors(diagnostics);
        }

        let deployed = match run_deploy(session, &desired, strategy, cancel).await {
            Ok(deployed) => deployed,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let record = desired.from_deployed(&deployed);
        ReconcileOutput::ok(self.short_kind(), &record.id, &record)
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: MtaRecord = match decode("mta", prior) {
            Ok(record) => record,
            Err(diags) => {
                return ReadOutput {
                    outcome: ReadOutcome::Gone,
                    identity: None,
                    diagnostics: diags,
                }
            }
        };
        let client = match deploy_client(session, &prior) {
            Ok(client) => client,
            Err(e) => return ReadOutput::error("Deploy service unavailable", e.to_string()),
        };
        let mta_id = if prior.mta_id.is_empty() {
            prior
                .id
                .split_once('/')
                .map(|(_, id)| id.to_string())
                .unwrap_or_else(|| prior.id.clone())
        } else {
            prior.mta_id.clone()
        };
        match client
            .get_mta(&prior.space, &mta_id, prior.namespace.as_deref())
            .await
        {
            Ok(deployed) => {
                let record = prior.from_deployed(&deployed);
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) if e.is_not_found() => ReadOutput::gone(),
            Err(e) => ReadOutput::error("Failed to read MTA", e.to_string()),
        }
    }

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        cancel: &CancelToken,
    ) -> ReconcileOutput {
        let plan: MtaRecord = match decode("mta", plan) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let prior: MtaRecord = match decode("mta", prior) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        // The archive decides the identifier; a different one in the same
        // namespace is a collision the user has to resolve.
        let descriptor = match inspect_archive(Path::new(&plan.archive_path)) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Archive inspection failed",
                    &e,
                )]))
            }
        };
        if !prior.mta_id.is_empty() && descriptor.id != prior.mta_id {
            let mut diagnostics = Diagnostics::new();
            diagnostics.error_at(
                AttributePath::root("archive_path"),
                "New MTA ID",
                format!(
                    "archive deploys MTA '{}' but '{}' is already deployed in this namespace; \
                     undeploy it first or use a different namespace",
                    descriptor.id, prior.mta_id
                ),
            );
            return ReconcileOutput::errors(diagnostics);
        }

        let mut diagnostics = Diagnostics::new();
        let strategy = strategy_of(&plan, &mut diagnostics);
        if diagnostics.has_errors() {
            return ReconcileOutput::errors(diagnostics);
        }

        let deployed = match run_deploy(session, &plan, strategy, cancel).await {
            Ok(deployed) => deployed,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let record = plan.from_deployed(&deployed);
        ReconcileOutput::ok(self.short_kind(), &record.id, &record)
    }

    async fn delete(&self, session: &Session, prior: Value, cancel: &CancelToken) -> Diagnostics {
        let prior: MtaRecord = match decode("mta", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let mut diagnostics = Diagnostics::new();
        let client = match deploy_client(session, &prior) {
            Ok(client) => client,
            Err(e) => {
                diagnostics.push(client_diag("Deploy service unavailable", &e));
                return diagnostics;
            }
        };
        let operation = client
            .start_undeploy(
                &prior.space,
                &prior.mta_id,
                prior.namespace.as_deref(),
                true,
            )
            .await;
        let operation_id = match operation {
            Ok(id) => id,
            Err(e) if e.is_not_found() => return diagnostics,
            Err(e) => {
                diagnostics.push(client_diag("Undeploy submission failed", &e));
                return diagnostics;
            }
        };
        if let Err(e) = client
            .poll_operation(
                &prior.space,
                &operation_id,
                OPERATION_DEADLINE,
                OPERATION_INTERVAL,
                cancel,
            )
            .await
        {
            diagnostics.push(client_diag("Undeploy operation failed", &e));
        }
        diagnostics
    }

    /// MTA identifiers are not GUIDs; import takes `<space guid>/<mta id>`.
    async fn import(
        &self,
        session: &Session,
        spec: Value,
        cancel: &CancelToken,
    ) -> ReconcileOutput {
        let raw = match &spec {
            Value::String(raw) => raw.clone(),
            Value::Object(map) => match map.get("mta_guid").and_then(Value::as_str) {
                Some(raw) => raw.to_string(),
                None => {
                    return ReconcileOutput::error(
                        "Invalid import specifier",
                        "identity is missing attribute 'mta_guid'",
                    )
                }
            },
            other => {
                return ReconcileOutput::error(
                    "Invalid import specifier",
                    format!("expected '<space>/<mta id>', got {}", other),
                )
            }
        };
        let Some((space, mta_id)) = raw.split_once('/') else {
            return ReconcileOutput::error(
                "Invalid import specifier",
                format!("'{}' is not of the form '<space>/<mta id>'", raw),
            );
        };
        let prior = serde_json::json!({
            "id": raw,
            "space": space,
            "mta_id": mta_id,
        });
        let read = self.read(session, prior, cancel).await;
        match read.outcome {
            ReadOutcome::Live(record) => ReconcileOutput {
                record: Some(record),
                identity: Some(Identity::new(self.short_kind(), &raw)),
                diagnostics: read.diagnostics,
            },
            ReadOutcome::Gone => ReconcileOutput::error(
                "Cannot import cloudfoundry_mta",
                format!("no MTA '{}' deployed in space '{}'", mta_id, space),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strategy_validation() {
        let diags = MtaReconciler.validate(&json!({ "strategy": "canary" }));
        assert!(diags.has_errors());
        let diags = MtaReconciler.validate(&json!({ "strategy": "blue-green-deploy" }));
        assert!(!diags.has_errors());
    }

    #[test]
    fn test_composite_id() {
        assert_eq!(MtaRecord::composite_id("s-1", "a.cf.app"), "s-1/a.cf.app");
    }

    #[test]
    fn test_record_projection_from_deployed() {
        let record = MtaRecord {
            space: "s-1".to_string(),
            archive_path: "/tmp/app.mtar".to_string(),
            namespace: Some("test".to_string()),
            ..MtaRecord::default()
        };
        let deployed: Mta = serde_json::from_value(json!({
            "metadata": { "id": "a.cf.app", "version": "1.2.0", "namespace": "test" },
            "modules": [
                { "moduleName": "web", "appName": "test-a.cf.app-web", "services": [], "uris": [] }
            ],
            "services": ["db"]
        }))
        .unwrap();
        let projected = record.from_deployed(&deployed);
        assert_eq!(projected.id, "s-1/a.cf.app");
        assert_eq!(projected.mta_version.as_deref(), Some("1.2.0"));
        assert_eq!(projected.app_names, vec!["test-a.cf.app-web"]);
        assert_eq!(projected.service_names, vec!["db"]);
    }
}
