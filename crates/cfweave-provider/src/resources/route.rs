//! `cloudfoundry_route`
//!
//! Destinations (the apps a route forwards to) are a relationship set
//! over app guids; the route itself is immutable apart from metadata.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

use cfweave_client::types::{Destination, DestinationApp, DestinationList, Route};
use cfweave_client::{CancelToken, ClientError, Collection, Created};
use cfweave_core::{diff_sets, Attribute, Diagnostics, Metadata, Schema};

use crate::reconcile::{
    client_diag, decode, finish_delete, ReadOutcome, ReadOutput, ReconcileOutput,
    ResourceReconciler,
};
use crate::session::Session;

pub const BASE: &str = "/v3/routes";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteRecord {
    pub id: String,
    pub space: String,
    pub domain: String,
    pub host: Option<String>,
    pub path: Option<String>,
    pub port: Option<i64>,
    pub destinations: BTreeSet<String>,
    pub url: Option<String>,
    pub protocol: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl RouteRecord {
    pub fn metadata(&self) -> Metadata {
        Metadata {
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
        }
    }

    fn from_api(route: Route, destinations: BTreeSet<String>) -> Self {
        Self {
            id: route.guid,
            space: route
                .relationships
                .space
                .guid()
                .unwrap_or_default()
                .to_string(),
            domain: route
                .relationships
                .domain
                .guid()
                .unwrap_or_default()
                .to_string(),
            host: (!route.host.is_empty()).then_some(route.host),
            path: (!route.path.is_empty()).then_some(route.path),
            port: route.port,
            destinations,
            url: (!route.url.is_empty()).then_some(route.url),
            protocol: (!route.protocol.is_empty()).then_some(route.protocol),
            labels: route.metadata.labels,
            annotations: route.metadata.annotations,
            created_at: Some(route.created_at.to_rfc3339()),
            updated_at: Some(route.updated_at.to_rfc3339()),
        }
    }
}

pub struct RouteReconciler;

fn routes(session: &Session) -> Collection<'_, Route> {
    session.client().collection("route", BASE)
}

async fn read_destinations(
    session: &Session,
    route_guid: &str,
) -> Result<BTreeSet<String>, ClientError> {
    let list: DestinationList = session
        .client()
        .get_json(&format!("{}/{}/destinations", BASE, route_guid), &[])
        .await?;
    Ok(list
        .destinations
        .into_iter()
        .map(|d| d.app.guid)
        .collect())
}

async fn reconcile_destinations(
    session: &Session,
    route_guid: &str,
    plan: &BTreeSet<String>,
    state: &BTreeSet<String>,
) -> Result<BTreeSet<String>, ClientError> {
    let diff = diff_sets(plan, state);
    if diff.is_empty() {
        return Ok(state.clone());
    }
    if !diff.removed.is_empty() {
        // Removal is per-destination; re-read to learn destination guids.
        let list: DestinationList = session
            .client()
            .get_json(&format!("{}/{}/destinations", BASE, route_guid), &[])
            .await?;
        for destination in list.destinations {
            if diff.removed.contains(&destination.app.guid) {
                if let Some(guid) = destination.guid {
                    let result = session
                        .client()
                        .delete(&format!("{}/{}/destinations/{}", BASE, route_guid, guid))
                        .await;
                    match result {
                        Ok(_) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
    if !diff.added.is_empty() {
        let body = json!({
            "destinations": diff.added.iter().map(|app| Destination {
                guid: None,
                app: DestinationApp { guid: app.clone() },
                port: None,
                weight: None,
            }).collect::<Vec<_>>()
        });
        let _: DestinationList = match session
            .client()
            .post_json(&format!("{}/{}/destinations", BASE, route_guid), &body)
            .await?
        {
            Created::Resource(list) => list,
            Created::Job(_) => {
                return Err(ClientError::UnexpectedResponse {
                    message: "destination insert answered with a job".to_string(),
                })
            }
        };
    }
    read_destinations(session, route_guid).await
}

#[async_trait]
impl ResourceReconciler for RouteReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_route"
    }

    fn short_kind(&self) -> &'static str {
        "route"
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("space", Attribute::required_string().requires_replace())
            .with_attribute("domain", Attribute::required_string().requires_replace())
            .with_attribute("host", Attribute::optional_string().requires_replace())
            .with_attribute("path", Attribute::optional_string().requires_replace())
            .with_attribute("port", Attribute::optional_int().requires_replace())
            .with_attribute("destinations", Attribute::optional_string_set())
            .with_attribute("url", Attribute::computed_string())
            .with_attribute("protocol", Attribute::computed_string())
            .with_common()
    }

    async fn create(
        &self,
        session: &Session,
        desired: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let desired: RouteRecord = match decode("route", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let mut body = json!({
            "relationships": {
                "space": { "data": { "guid": desired.space } },
                "domain": { "data": { "guid": desired.domain } },
            }
        });
        if let Some(host) = &desired.host {
            body["host"] = json!(host);
        }
        if let Some(path) = &desired.path {
            body["path"] = json!(path);
        }
        if let Some(port) = desired.port {
            body["port"] = json!(port);
        }
        if let Some(metadata) = cfweave_client::types::metadata_for_create(&desired.metadata()) {
            body["metadata"] = metadata;
        }

        let created = match routes(session).create(&body).await {
            Ok(Created::Resource(route)) => route,
            Ok(Created::Job(_)) => {
                return ReconcileOutput::error(
                    "Failed to create route",
                    "route create answered with a job",
                )
            }
            Err(e) => {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Failed to create route",
                    &e,
                )]))
            }
        };
        let guid = created.guid.clone();

        let destinations = match reconcile_destinations(
            session,
            &guid,
            &desired.destinations,
            &BTreeSet::new(),
        )
        .await
        {
            Ok(destinations) => destinations,
            Err(e) => {
                // Keep the created route in state; destinations converge
                // on the next plan.
                let record = RouteRecord::from_api(created, BTreeSet::new());
                let mut output = ReconcileOutput::ok(self.short_kind(), &record.id, &record);
                output
                    .diagnostics
                    .push(client_diag("Failed to set route destinations", &e));
                return output;
            }
        };

        let record = RouteRecord::from_api(created, destinations);
        ReconcileOutput::ok(self.short_kind(), &record.id, &record)
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: RouteRecord = match decode("route", prior) {
            Ok(record) => record,
            Err(diags) => {
                return ReadOutput {
                    outcome: ReadOutcome::Gone,
                    identity: None,
                    diagnostics: diags,
                }
            }
        };
        match routes(session).get(&prior.id).await {
            Ok(route) => {
                let destinations = match read_destinations(session, &route.guid).await {
                    Ok(destinations) => destinations,
                    Err(e) => return ReadOutput::error("Failed to read route destinations", e.to_string()),
                };
                let record = RouteRecord::from_api(route, destinations);
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) if e.is_not_found() => ReadOutput::gone(),
            Err(e) => ReadOutput::error("Failed to read route", e.to_string()),
        }
    }

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let plan: RouteRecord = match decode("route", plan) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let prior: RouteRecord = match decode("route", prior) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let destinations = match reconcile_destinations(
            session,
            &prior.id,
            &plan.destinations,
            &prior.destinations,
        )
        .await
        {
            Ok(destinations) => destinations,
            Err(e) => {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Failed to reconcile route destinations",
                    &e,
                )]))
            }
        };

        let metadata = Metadata::diff(&prior.metadata(), &plan.metadata());
        match routes(session)
            .update(&prior.id, &json!({ "metadata": metadata }))
            .await
        {
            Ok(route) => {
                let record = RouteRecord::from_api(route, destinations);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to update route",
                &e,
            )])),
        }
    }

    async fn delete(&self, session: &Session, prior: Value, cancel: &CancelToken) -> Diagnostics {
        let prior: RouteRecord = match decode("route", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let result = routes(session).delete(&prior.id).await;
        finish_delete(session, "route", result, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_attributes_force_replace() {
        let schema = RouteReconciler.schema();
        for name in ["space", "domain", "host", "path", "port"] {
            assert!(
                schema
                    .get(name)
                    .unwrap()
                    .has_modifier(cfweave_core::PlanModifier::RequiresReplace),
                "{} must force replacement",
                name
            );
        }
        assert!(schema.ids_are_chain_stable());
    }

    #[test]
    fn test_empty_host_maps_to_none() {
        let route: Route = serde_json::from_value(json!({
            "guid": "r-1",
            "host": "",
            "path": "",
            "protocol": "http1",
            "url": "example.com",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "relationships": {
                "space": {"data": {"guid": "s-1"}},
                "domain": {"data": {"guid": "d-1"}}
            }
        }))
        .unwrap();
        let record = RouteRecord::from_api(route, BTreeSet::new());
        assert!(record.host.is_none());
        assert_eq!(record.protocol.as_deref(), Some("http1"));
    }
}
