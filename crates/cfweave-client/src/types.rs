//! Serde payloads for the v3 resources the provider touches
//!
//! Response shapes carry the fields the reconcilers project into records;
//! request shapes exist for the bodies that are built in more than one
//! place. One-off bodies are assembled with `serde_json::json!` at the
//! call site.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use cfweave_core::Metadata;

// ---------------------------------------------------------------------------
// Relationship shells
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub guid: String,
}

/// `{"data": {"guid": ...}}` or `{"data": null}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToOne {
    pub data: Option<Relationship>,
}

impl ToOne {
    pub fn to(guid: impl Into<String>) -> Self {
        Self {
            data: Some(Relationship { guid: guid.into() }),
        }
    }

    pub fn guid(&self) -> Option<&str> {
        self.data.as_ref().map(|r| r.guid.as_str())
    }
}

/// `{"data": [{"guid": ...}, ...]}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToMany {
    pub data: Vec<Relationship>,
}

impl ToMany {
    pub fn from_guids<I: IntoIterator<Item = String>>(guids: I) -> Self {
        Self {
            data: guids
                .into_iter()
                .map(|guid| Relationship { guid })
                .collect(),
        }
    }

    pub fn guids(&self) -> BTreeSet<String> {
        self.data.iter().map(|r| r.guid.clone()).collect()
    }
}

fn is_default_metadata(meta: &Metadata) -> bool {
    meta.is_empty()
}

// ---------------------------------------------------------------------------
// Organizations & spaces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Organization {
    pub guid: String,
    pub name: String,
    #[serde(default)]
    pub suspended: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub relationships: OrgRelationships,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrgRelationships {
    #[serde(default)]
    pub quota: ToOne,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Space {
    pub guid: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    pub relationships: SpaceRelationships,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpaceRelationships {
    pub organization: ToOne,
    #[serde(default)]
    pub quota: ToOne,
}

// ---------------------------------------------------------------------------
// Quotas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaApps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_memory_in_mb: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_process_memory_in_mb: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_instances: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_app_tasks: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_rate_limit_in_bytes_per_second: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaServices {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_services_allowed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_service_instances: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_service_keys: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRoutes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_routes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_reserved_ports: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDomains {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_domains: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrgQuota {
    pub guid: String,
    pub name: String,
    #[serde(default)]
    pub apps: QuotaApps,
    #[serde(default)]
    pub services: QuotaServices,
    #[serde(default)]
    pub routes: QuotaRoutes,
    #[serde(default)]
    pub domains: QuotaDomains,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub relationships: OrgQuotaRelationships,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrgQuotaRelationships {
    #[serde(default)]
    pub organizations: ToMany,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpaceQuota {
    pub guid: String,
    pub name: String,
    #[serde(default)]
    pub apps: QuotaApps,
    #[serde(default)]
    pub services: QuotaServices,
    #[serde(default)]
    pub routes: QuotaRoutes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub relationships: SpaceQuotaRelationships,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpaceQuotaRelationships {
    #[serde(default)]
    pub organization: ToOne,
    #[serde(default)]
    pub spaces: ToMany,
}

// ---------------------------------------------------------------------------
// Applications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct App {
    pub guid: String,
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    pub relationships: AppRelationships,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppRelationships {
    pub space: ToOne,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Lifecycle {
    #[serde(default, rename = "type")]
    pub lifecycle_type: String,
    #[serde(default)]
    pub data: LifecycleData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LifecycleData {
    #[serde(default)]
    pub buildpacks: Vec<String>,
    #[serde(default)]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Process {
    pub guid: String,
    #[serde(rename = "type")]
    pub process_type: String,
    #[serde(default)]
    pub command: Option<String>,
    pub instances: i64,
    pub memory_in_mb: i64,
    pub disk_in_mb: i64,
    #[serde(default)]
    pub log_rate_limit_in_bytes_per_second: Option<i64>,
    #[serde(default)]
    pub health_check: HealthCheck,
    #[serde(default)]
    pub readiness_health_check: HealthCheck,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthCheck {
    #[serde(default, rename = "type")]
    pub check_type: Option<String>,
    #[serde(default)]
    pub data: HealthCheckData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthCheckData {
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub invocation_timeout: Option<i64>,
    #[serde(default)]
    pub interval: Option<i64>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessStats {
    pub resources: Vec<ProcessStat>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessStat {
    pub index: i64,
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sidecar {
    pub guid: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub process_types: Vec<String>,
    #[serde(default)]
    pub memory_in_mb: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Package {
    pub guid: String,
    #[serde(rename = "type")]
    pub package_type: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Build {
    pub guid: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub droplet: Option<Relationship>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Droplet {
    pub guid: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Deployment {
    pub guid: String,
    #[serde(default)]
    pub status: DeploymentStatus,
    #[serde(default)]
    pub strategy: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentStatus {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub reason: String,
}

/// `/v3/apps/:guid/features/ssh`
#[derive(Debug, Clone, Deserialize)]
pub struct AppFeature {
    pub name: String,
    pub enabled: bool,
}

/// `/v3/apps/:guid/environment_variables`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvVars {
    #[serde(rename = "var")]
    pub vars: BTreeMap<String, Option<String>>,
}

// ---------------------------------------------------------------------------
// Routes & domains
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Route {
    pub guid: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub port: Option<i64>,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    pub relationships: RouteRelationships,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteRelationships {
    pub space: ToOne,
    pub domain: ToOne,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationList {
    #[serde(default)]
    pub destinations: Vec<Destination>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    pub app: DestinationApp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationApp {
    pub guid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Domain {
    pub guid: String,
    pub name: String,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub router_group: Option<RouterGroup>,
    #[serde(default)]
    pub supported_protocols: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub relationships: DomainRelationships,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterGroup {
    pub guid: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainRelationships {
    #[serde(default)]
    pub organization: ToOne,
    #[serde(default)]
    pub shared_organizations: ToMany,
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LastOperation {
    #[serde(default, rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceInstance {
    pub guid: String,
    pub name: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub syslog_drain_url: Option<String>,
    #[serde(default)]
    pub route_service_url: Option<String>,
    #[serde(default)]
    pub dashboard_url: Option<String>,
    #[serde(default)]
    pub upgrade_available: Option<bool>,
    #[serde(default)]
    pub last_operation: LastOperation,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    pub relationships: ServiceInstanceRelationships,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceInstanceRelationships {
    pub space: ToOne,
    #[serde(default)]
    pub service_plan: ToOne,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicePlan {
    pub guid: String,
    pub name: String,
    #[serde(default)]
    pub free: bool,
    pub relationships: ServicePlanRelationships,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicePlanRelationships {
    pub service_offering: ToOne,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceOffering {
    pub guid: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceCredentialBinding {
    pub guid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub binding_type: String,
    #[serde(default)]
    pub last_operation: LastOperation,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    pub relationships: BindingRelationships,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindingRelationships {
    pub service_instance: ToOne,
    #[serde(default)]
    pub app: ToOne,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceBroker {
    pub guid: String,
    pub name: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub relationships: BrokerRelationships,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerRelationships {
    #[serde(default)]
    pub space: ToOne,
}

/// `/v3/service_instances/:guid/relationships/shared_spaces`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SharedSpaces {
    #[serde(default)]
    pub data: Vec<Relationship>,
}

impl SharedSpaces {
    pub fn guids(&self) -> BTreeSet<String> {
        self.data.iter().map(|r| r.guid.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Security groups, isolation segments, roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub protocol: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub icmp_type: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GloballyEnabled {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub staging: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityGroup {
    pub guid: String,
    pub name: String,
    #[serde(default)]
    pub globally_enabled: GloballyEnabled,
    #[serde(default)]
    pub rules: Vec<SecurityGroupRule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub relationships: SecurityGroupRelationships,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityGroupRelationships {
    #[serde(default)]
    pub running_spaces: ToMany,
    #[serde(default)]
    pub staging_spaces: ToMany,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IsolationSegment {
    pub guid: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// `/v3/isolation_segments/:guid/relationships/organizations`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntitledOrgs {
    #[serde(default)]
    pub data: Vec<Relationship>,
}

impl EntitledOrgs {
    pub fn guids(&self) -> BTreeSet<String> {
        self.data.iter().map(|r| r.guid.clone()).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Role {
    pub guid: String,
    #[serde(rename = "type")]
    pub role_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub relationships: RoleRelationships,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleRelationships {
    pub user: ToOne,
    #[serde(default)]
    pub organization: ToOne,
    #[serde(default)]
    pub space: ToOne,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub guid: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
}

// ---------------------------------------------------------------------------
// Request helpers shared across reconcilers
// ---------------------------------------------------------------------------

/// Serialize labels/annotations for a create body (no deletions on
/// create, so plain strings).
pub fn metadata_for_create(meta: &Metadata) -> Option<serde_json::Value> {
    if is_default_metadata(meta) {
        return None;
    }
    Some(serde_json::json!({
        "labels": meta.labels,
        "annotations": meta.annotations,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_many_round_trip() {
        let many = ToMany::from_guids(vec!["b".to_string(), "a".to_string()]);
        let guids = many.guids();
        assert!(guids.contains("a"));
        assert_eq!(guids.len(), 2);
    }

    #[test]
    fn test_org_deserializes_with_metadata() {
        let org: Organization = serde_json::from_value(json!({
            "guid": "org-1",
            "name": "prod",
            "suspended": false,
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-02-01T00:00:00Z",
            "metadata": {"labels": {"env": "prod"}, "annotations": {}},
            "relationships": {"quota": {"data": {"guid": "q-1"}}}
        }))
        .unwrap();
        assert_eq!(org.metadata.labels.get("env").map(String::as_str), Some("prod"));
        assert_eq!(org.relationships.quota.guid(), Some("q-1"));
    }

    #[test]
    fn test_process_health_check_defaults() {
        let process: Process = serde_json::from_value(json!({
            "guid": "p-1",
            "type": "web",
            "instances": 2,
            "memory_in_mb": 256,
            "disk_in_mb": 1024
        }))
        .unwrap();
        assert!(process.health_check.check_type.is_none());
        assert_eq!(process.instances, 2);
    }

    #[test]
    fn test_env_vars_null_serialization() {
        let mut vars = BTreeMap::new();
        vars.insert("KEEP".to_string(), Some("v".to_string()));
        vars.insert("DROP".to_string(), None);
        let body = serde_json::to_string(&EnvVars { vars }).unwrap();
        assert!(body.contains("\"DROP\":null"));
        assert!(body.contains("\"KEEP\":\"v\""));
    }

    #[test]
    fn test_binding_tagged_shape() {
        let binding: ServiceCredentialBinding = serde_json::from_value(json!({
            "guid": "b-1",
            "type": "key",
            "name": "my-key",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "relationships": {"service_instance": {"data": {"guid": "si-1"}}}
        }))
        .unwrap();
        assert_eq!(binding.binding_type, "key");
        assert_eq!(binding.relationships.app.guid(), None);
    }
}
