//! `cloudfoundry_service_broker`
//!
//! Broker registration is asynchronous end to end: create, update and
//! delete all answer with a job while the platform synchronizes the
//! catalog. Credentials are write-only; the API never returns them, so
//! they are carried over from the desired state on every success path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use cfweave_client::types::ServiceBroker;
use cfweave_client::{poll_job, CancelToken, Collection, Created};
use cfweave_core::{Attribute, Diagnostics, Metadata, Schema};

use crate::reconcile::{
    client_diag, decode, finish_delete, ReadOutcome, ReadOutput, ReconcileOutput,
    ResourceReconciler,
};
use crate::session::Session;

pub const BASE: &str = "/v3/service_brokers";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceBrokerRecord {
    pub id: String,
    pub name: String,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Restricts the broker to one space when set
    pub space: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl ServiceBrokerRecord {
    pub fn metadata(&self) -> Metadata {
        Metadata {
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
        }
    }

    /// Project the API body, carrying credentials from `desired` because
    /// the platform does not round-trip them.
    fn from_api(broker: ServiceBroker, desired: &ServiceBrokerRecord) -> Self {
        Self {
            id: broker.guid,
            name: broker.name,
            url: broker.url,
            username: desired.username.clone(),
            password: desired.password.clone(),
            space: broker.relationships.space.guid().map(str::to_string),
            labels: broker.metadata.labels,
            annotations: broker.metadata.annotations,
            created_at: Some(broker.created_at.to_rfc3339()),
            updated_at: Some(broker.updated_at.to_rfc3339()),
        }
    }
}

pub struct ServiceBrokerReconciler;

fn brokers(session: &Session) -> Collection<'_, ServiceBroker> {
    session.client().collection("service broker", BASE)
}

fn credentials_body(record: &ServiceBrokerRecord) -> Value {
    json!({
        "type": "basic",
        "credentials": {
            "username": record.username.clone().unwrap_or_default(),
            "password": record.password.clone().unwrap_or_default(),
        }
    })
}

#[async_trait]
impl ResourceReconciler for ServiceBrokerReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_service_broker"
    }

    fn short_kind(&self) -> &'static str {
        "service_broker"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("name", Attribute::required_string())
            .with_attribute("url", Attribute::required_string())
            .with_attribute("username", Attribute::optional_string().sensitive())
            .with_attribute("password", Attribute::optional_string().sensitive())
            .with_attribute("space", Attribute::optional_string().requires_replace())
            .with_common()
    }

    async fn create(
        &self,
        session: &Session,
        desired: Value,
        cancel: &CancelToken,
    ) -> ReconcileOutput {
        let desired: ServiceBrokerRecord = match decode("service broker", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let mut body = json!({
            "name": desired.name,
            "url": desired.url,
            "authentication": credentials_body(&desired),
        });
        if let Some(space) = &desired.space {
            body["relationships"] = json!({ "space": { "data": { "guid": space } } });
        }
        if let Some(metadata) = cfweave_client::types::metadata_for_create(&desired.metadata()) {
            body["metadata"] = metadata;
        }

        let job = match brokers(session).create(&body).await {
            Ok(Created::Job(job)) => job,
            Ok(Created::Resource(broker)) => {
                // Older platforms answer synchronously.
                let record = ServiceBrokerRecord::from_api(broker, &desired);
                return ReconcileOutput::ok(self.short_kind(), &record.id, &record);
            }
            Err(e) => {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Failed to create service broker",
                    &e,
                )]))
            }
        };

        if let Err(e) = poll_job(session.client(), &job, session.poll_options(), cancel).await {
            return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Service broker registration did not complete",
                &e,
            )]));
        }

        // The job body does not carry the broker; re-fetch by name.
        match brokers(session).single(&[("names", &desired.name)]).await {
            Ok(broker) => {
                let record = ServiceBrokerRecord::from_api(broker, &desired);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to read service broker after registration",
                &e,
            )])),
        }
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: ServiceBrokerRecord = match decode("service broker", prior) {
            Ok(record) => record,
            Err(diags) => {
                return ReadOutput {
                    outcome: ReadOutcome::Gone,
                    identity: None,
                    diagnostics: diags,
                }
            }
        };
        match brokers(session).get(&prior.id).await {
            Ok(broker) => {
                let record = ServiceBrokerRecord::from_api(broker, &prior);
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) if e.is_not_found() => ReadOutput::gone(),
            Err(e) => ReadOutput::error("Failed to read service broker", e.to_string()),
        }
    }

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        cancel: &CancelToken,
    ) -> ReconcileOutput {
        let plan: ServiceBrokerRecord = match decode("service broker", plan) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let prior: ServiceBrokerRecord = match decode("service broker", prior) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let metadata = Metadata::diff(&prior.metadata(), &plan.metadata());
        let body = json!({
            "name": plan.name,
            "url": plan.url,
            "authentication": credentials_body(&plan),
            "metadata": metadata,
        });

        // PATCH answers 202 when the catalog must re-synchronize.
        let response = session
            .client()
            .patch_maybe_job::<ServiceBroker>(&format!("{}/{}", BASE, prior.id), &body)
            .await;
        match response {
            Ok(Created::Job(job)) => {
                if let Err(e) =
                    poll_job(session.client(), &job, session.poll_options(), cancel).await
                {
                    return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                        "Service broker update did not complete",
                        &e,
                    )]));
                }
                match brokers(session).get(&prior.id).await {
                    Ok(broker) => {
                        let record = ServiceBrokerRecord::from_api(broker, &plan);
                        ReconcileOutput::ok(self.short_kind(), &record.id, &record)
                    }
                    Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                        "Failed to read service broker after update",
                        &e,
                    )])),
                }
            }
            Ok(Created::Resource(broker)) => {
                let record = ServiceBrokerRecord::from_api(broker, &plan);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to update service broker",
                &e,
            )])),
        }
    }

    async fn delete(&self, session: &Session, prior: Value, cancel: &CancelToken) -> Diagnostics {
        let prior: ServiceBrokerRecord = match decode("service broker", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let result = brokers(session).delete(&prior.id).await;
        finish_delete(session, "service broker", result, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_are_sensitive() {
        let schema = ServiceBrokerReconciler.schema();
        assert!(schema.get("username").unwrap().sensitive);
        assert!(schema.get("password").unwrap().sensitive);
        assert!(schema.ids_are_chain_stable());
    }

    #[test]
    fn test_credentials_carried_from_desired() {
        let desired = ServiceBrokerRecord {
            username: Some("admin".to_string()),
            password: Some("pw".to_string()),
            ..ServiceBrokerRecord::default()
        };
        let broker: ServiceBroker = serde_json::from_value(json!({
            "guid": "b-1",
            "name": "my-broker",
            "url": "https://broker.example.com",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        let record = ServiceBrokerRecord::from_api(broker, &desired);
        assert_eq!(record.username.as_deref(), Some("admin"));
        assert_eq!(record.password.as_deref(), Some("pw"));
    }
}
