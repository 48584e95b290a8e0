//! `cloudfoundry_security_group`
//!
//! Two independent relationship sets, one per usage flavor: the spaces a
//! group applies to for running containers and the spaces for staging.
//! Each is diffed on its own; order within a flavor is remove-then-add.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;

use cfweave_client::types::{GloballyEnabled, SecurityGroup, SecurityGroupRule, ToMany};
use cfweave_client::{CancelToken, ClientError, Collection, Created};
use cfweave_core::{diff_sets, Attribute, Diagnostics, Schema};

use crate::reconcile::{
    client_diag, decode, finish_delete, ReadOutcome, ReadOutput, ReconcileOutput,
    ResourceReconciler,
};
use crate::session::Session;

pub const BASE: &str = "/v3/security_groups";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityGroupRecord {
    pub id: String,
    pub name: String,
    pub globally_enabled_running: bool,
    pub globally_enabled_staging: bool,
    pub rules: Vec<SecurityGroupRule>,
    pub running_spaces: BTreeSet<String>,
    pub staging_spaces: BTreeSet<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl SecurityGroupRecord {
    fn from_api(group: SecurityGroup) -> Self {
        Self {
            id: group.guid,
            name: group.name,
            globally_enabled_running: group.globally_enabled.running,
            globally_enabled_staging: group.globally_enabled.staging,
            rules: group.rules,
            running_spaces: group.relationships.running_spaces.guids(),
            staging_spaces: group.relationships.staging_spaces.guids(),
            created_at: Some(group.created_at.to_rfc3339()),
            updated_at: Some(group.updated_at.to_rfc3339()),
        }
    }

    fn attribute_body(&self) -> Value {
        json!({
            "name": self.name,
            "globally_enabled": GloballyEnabled {
                running: self.globally_enabled_running,
                staging: self.globally_enabled_staging,
            },
            "rules": self.rules,
        })
    }
}

pub struct SecurityGroupReconciler;

fn groups(session: &Session) -> Collection<'_, SecurityGroup> {
    session.client().collection("security group", BASE)
}

async fn bind_spaces(
    session: &Session,
    group_guid: &str,
    flavor: &str,
    added: &BTreeSet<String>,
    removed: &BTreeSet<String>,
) -> Result<(), ClientError> {
    for space in removed {
        let result = session
            .client()
            .delete(&format!(
                "{}/{}/relationships/{}/{}",
                BASE, group_guid, flavor, space
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
                &format!("{}/{}/relationships/{}", BASE, group_guid, flavor),
                &body,
            )
            .await?
        {
            Created::Resource(list) => list,
            Created::Job(_) => {
                return Err(ClientError::UnexpectedResponse {
                    message: format!("{} bind answered with a job", flavor),
                })
            }
        };
    }
    Ok(())
}

#[async_trait]
impl ResourceReconciler for SecurityGroupReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_security_group"
    }

    fn short_kind(&self) -> &'static str {
        "security_group"
    }

    fn schema(&self) -> Schema {
        let mut rule = indexmap::IndexMap::new();
        rule.insert("protocol".to_string(), Attribute::required_string());
        rule.insert("destination".to_string(), Attribute::required_string());
        rule.insert("ports".to_string(), Attribute::optional_string());
        rule.insert("type".to_string(), Attribute::optional_int());
        rule.insert("code".to_string(), Attribute::optional_int());
        rule.insert("description".to_string(), Attribute::optional_string());
        rule.insert("log".to_string(), Attribute::optional_bool());

        Schema::v0()
            .with_attribute("name", Attribute::required_string())
            .with_attribute("globally_enabled_running", Attribute::optional_bool())
            .with_attribute("globally_enabled_staging", Attribute::optional_bool())
            .with_attribute("rules", Attribute::object_list(rule))
            .with_attribute("running_spaces", Attribute::optional_string_set())
            .with_attribute("staging_spaces", Attribute::optional_string_set())
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
        let desired: SecurityGroupRecord = match decode("security group", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        let mut body = desired.attribute_body();
        let mut relationships = serde_json::Map::new();
        for (flavor, spaces) in [
            ("running_spaces", &desired.running_spaces),
            ("staging_spaces", &desired.staging_spaces),
        ] {
            if !spaces.is_empty() {
                relationships.insert(
                    flavor.to_string(),
                    json!({
                        "data": spaces.iter().map(|guid| json!({ "guid": guid })).collect::<Vec<_>>()
                    }),
                );
            }
        }
        if !relationships.is_empty() {
            body["relationships"] = Value::Object(relationships);
        }

        match groups(session).create(&body).await {
            Ok(Created::Resource(group)) => {
                let record = SecurityGroupRecord::from_api(group);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Ok(Created::Job(_)) => ReconcileOutput::error(
                "Failed to create security group",
                "security group create answered with a job",
            ),
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to create security group",
                &e,
            )])),
        }
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: SecurityGroupRecord = match decode("security group", prior) {
            Ok(record) => record,
            Err(diags) => {
                return ReadOutput {
                    outcome: ReadOutcome::Gone,
                    identity: None,
                    diagnostics: diags,
                }
            }
        };
        match groups(session).get(&prior.id).await {
            Ok(group) => {
                let record = SecurityGroupRecord::from_api(group);
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) if e.is_not_found() => ReadOutput::gone(),
            Err(e) => ReadOutput::error("Failed to read security group", e.to_string()),
        }
    }

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        _cancel: &CancelToken,
    ) -> ReconcileOutput {
        let plan: SecurityGroupRecord = match decode("security group", plan) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let prior: SecurityGroupRecord = match decode("security group", prior) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };

        for (flavor, planned, known) in [
            ("running_spaces", &plan.running_spaces, &prior.running_spaces),
            ("staging_spaces", &plan.staging_spaces, &prior.staging_spaces),
        ] {
            let diff = diff_sets(planned, known);
            if let Err(e) = bind_spaces(session, &prior.id, flavor, &diff.added, &diff.removed).await
            {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    &format!("Failed to reconcile {}", flavor),
                    &e,
                )]));
            }
        }

        match groups(session).update(&prior.id, &plan.attribute_body()).await {
            Ok(group) => {
                let record = SecurityGroupRecord::from_api(group);
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
            }
            Err(e) => ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Failed to update security group",
                &e,
            )])),
        }
    }

    async fn delete(&self, session: &Session, prior: Value, cancel: &CancelToken) -> Diagnostics {
        let prior: SecurityGroupRecord = match decode("security group", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let result = groups(session).delete(&prior.id).await;
        finish_delete(session, "security group", result, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_independent_space_sets() {
        let schema = SecurityGroupReconciler.schema();
        assert_eq!(
            schema.get("running_spaces").unwrap().attr_type,
            cfweave_core::AttrType::StringSet
        );
        assert_eq!(
            schema.get("staging_spaces").unwrap().attr_type,
            cfweave_core::AttrType::StringSet
        );
        assert!(schema.ids_are_chain_stable());
    }

    #[test]
    fn test_rules_serialize_into_body() {
        let record = SecurityGroupRecord {
            name: "office".to_string(),
            rules: vec![SecurityGroupRule {
                protocol: "tcp".to_string(),
                destination: "10.0.0.0/24".to_string(),
                ports: Some("443".to_string()),
                icmp_type: None,
                code: None,
                description: Some("office egress".to_string()),
                log: None,
            }],
            ..SecurityGroupRecord::default()
        };
        let body = record.attribute_body();
        assert_eq!(body["rules"][0]["protocol"], "tcp");
        assert!(body["rules"][0].get("code").is_none());
    }
}
