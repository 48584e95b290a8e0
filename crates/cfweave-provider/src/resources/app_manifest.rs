//! Application manifest assembly and parse-back
//!
//! The record projects into the YAML document the platform's manifest
//! push consumes. Two shapes are admissible: a top-level process shape
//! describing a single implicit `web` process, or an explicit `processes`
//! list - never both. The canonical manifest generated by the platform
//! after a push parses back through the same types to populate computed
//! fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use cfweave_core::{AttributePath, Diagnostics};

/// The twelve top-level attributes that collide with `processes`
pub const PROCESS_SHAPE_ATTRS: &[&str] = &[
    "command",
    "memory",
    "disk_quota",
    "instances",
    "health_check_type",
    "health_check_http_endpoint",
    "health_check_interval",
    "health_check_invocation_timeout",
    "readiness_health_check_type",
    "readiness_health_check_http_endpoint",
    "timeout",
    "log_rate_limit_per_second",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub applications: Vec<ManifestApp>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestApp {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub buildpacks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker: Option<ManifestDocker>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_quota: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<i64>,
    #[serde(rename = "health-check-type", skip_serializing_if = "Option::is_none")]
    pub health_check_type: Option<String>,
    #[serde(
        rename = "health-check-http-endpoint",
        skip_serializing_if = "Option::is_none"
    )]
    pub health_check_http_endpoint: Option<String>,
    #[serde(
        rename = "health-check-interval",
        skip_serializing_if = "Option::is_none"
    )]
    pub health_check_interval: Option<i64>,
    #[serde(
        rename = "health-check-invocation-timeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub health_check_invocation_timeout: Option<i64>,
    #[serde(
        rename = "readiness-health-check-type",
        skip_serializing_if = "Option::is_none"
    )]
    pub readiness_health_check_type: Option<String>,
    #[serde(
        rename = "readiness-health-check-http-endpoint",
        skip_serializing_if = "Option::is_none"
    )]
    pub readiness_health_check_http_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(
        rename = "log-rate-limit-per-second",
        skip_serializing_if = "Option::is_none"
    )]
    pub log_rate_limit_per_second: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<ManifestProcess>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sidecars: Vec<ManifestSidecar>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<ManifestRoute>,
    #[serde(rename = "no-route", skip_serializing_if = "Option::is_none")]
    pub no_route: Option<bool>,
    #[serde(rename = "random-route", skip_serializing_if = "Option::is_none")]
    pub random_route: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ManifestService>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestDocker {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestProcess {
    #[serde(rename = "type")]
    pub process_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_quota: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<i64>,
    #[serde(rename = "health-check-type", skip_serializing_if = "Option::is_none")]
    pub health_check_type: Option<String>,
    #[serde(
        rename = "health-check-http-endpoint",
        skip_serializing_if = "Option::is_none"
    )]
    pub health_check_http_endpoint: Option<String>,
    #[serde(
        rename = "health-check-interval",
        skip_serializing_if = "Option::is_none"
    )]
    pub health_check_interval: Option<i64>,
    #[serde(
        rename = "health-check-invocation-timeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub health_check_invocation_timeout: Option<i64>,
    #[serde(
        rename = "readiness-health-check-type",
        skip_serializing_if = "Option::is_none"
    )]
    pub readiness_health_check_type: Option<String>,
    #[serde(
        rename = "readiness-health-check-http-endpoint",
        skip_serializing_if = "Option::is_none"
    )]
    pub readiness_health_check_http_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(
        rename = "log-rate-limit-per-second",
        skip_serializing_if = "Option::is_none"
    )]
    pub log_rate_limit_per_second: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestSidecar {
    pub name: String,
    pub command: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub process_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestRoute {
    pub route: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestService {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl ManifestDocument {
    pub fn single(app: ManifestApp) -> Self {
        Self {
            applications: vec![app],
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn parse(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn first(&self) -> Option<&ManifestApp> {
        self.applications.first()
    }
}

/// Mutual-exclusion rules the schema cannot express on its own, checked
/// before any API call.
pub fn validate_shape(config: &Value) -> Diagnostics {
    let mut diagnostics = Diagnostics::new();

    let has = |name: &str| {
        config
            .get(name)
            .map(|v| !v.is_null() && !(v.is_array() && v.as_array().is_some_and(Vec::is_empty)))
            .unwrap_or(false)
    };

    // Exactly one package source.
    crate::reconcile::exactly_one(
        &mut diagnostics,
        ("path", has("path")),
        ("docker_image", has("docker_image")),
    );

    // Route intent is one of: explicit routes, random, none.
    let route_flags = [
        ("no_route", has("no_route") && config["no_route"] == Value::Bool(true)),
        (
            "random_route",
            has("random_route") && config["random_route"] == Value::Bool(true),
        ),
        ("routes", has("routes")),
    ];
    let set: Vec<&str> = route_flags
        .iter()
        .filter(|(_, on)| *on)
        .map(|(name, _)| *name)
        .collect();
    if set.len() > 1 {
        diagnostics.error_at(
            AttributePath::root(set[1]),
            "Conflicting attributes",
            format!("'{}' and '{}' are mutually exclusive", set[0], set[1]),
        );
    }

    // Process-level overrides are authoritative when present.
    if has("processes") {
        for attr in PROCESS_SHAPE_ATTRS {
            if has(attr) {
                diagnostics.error_at(
                    AttributePath::root(*attr),
                    "Conflicting attributes",
                    format!(
                        "'{}' cannot be combined with 'processes'; set it on the process entry",
                        attr
                    ),
                );
            }
        }
    }

    diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_with_processes() {
        let doc = ManifestDocument::single(ManifestApp {
            name: "worker".to_string(),
            processes: vec![
                ManifestProcess {
                    process_type: "web".to_string(),
                    memory: Some("256M".to_string()),
                    ..ManifestProcess::default()
                },
                ManifestProcess {
                    process_type: "scheduler".to_string(),
                    instances: Some(0),
                    memory: Some("256M".to_string()),
                    health_check_type: Some("process".to_string()),
                    ..ManifestProcess::default()
                },
            ],
            ..ManifestApp::default()
        });
        let yaml = doc.to_yaml().unwrap();
        assert!(yaml.contains("health-check-type: process"));
        let parsed = ManifestDocument::parse(&yaml).unwrap();
        assert_eq!(parsed.first().unwrap().processes.len(), 2);
        assert_eq!(parsed, doc);
    }

    #[test]
    fn test_unset_fields_stay_out_of_the_yaml() {
        let doc = ManifestDocument::single(ManifestApp {
            name: "tiny".to_string(),
            memory: Some("64M".to_string()),
            ..ManifestApp::default()
        });
        let yaml = doc.to_yaml().unwrap();
        assert!(!yaml.contains("no-route"));
        assert!(!yaml.contains("processes"));
        assert!(!yaml.contains("docker"));
    }

    #[test]
    fn test_validate_requires_one_package_source() {
        let diags = validate_shape(&json!({ "name": "a" }));
        assert!(diags.has_errors());

        let diags = validate_shape(&json!({ "name": "a", "path": "app.zip", "docker_image": "img" }));
        assert!(diags.has_errors());

        let diags = validate_shape(&json!({ "name": "a", "path": "app.zip" }));
        assert!(!diags.has_errors());
    }

    #[test]
    fn test_route_intents_are_exclusive() {
        let diags = validate_shape(&json!({
            "path": "app.zip",
            "no_route": true,
            "routes": [{ "route": "x.example.com" }]
        }));
        assert!(diags.has_errors());

        let diags = validate_shape(&json!({
            "path": "app.zip",
            "random_route": true
        }));
        assert!(!diags.has_errors());

        // no_route=false does not count as route intent
        let diags = validate_shape(&json!({
            "path": "app.zip",
            "no_route": false,
            "routes": [{ "route": "x.example.com" }]
        }));
        assert!(!diags.has_errors());
    }

    #[test]
    fn test_processes_exclude_top_level_shape() {
        let diags = validate_shape(&json!({
            "path": "app.zip",
            "memory": "256M",
            "processes": [{ "type": "web" }]
        }));
        assert!(diags.has_errors());

        let diags = validate_shape(&json!({
            "path": "app.zip",
            "processes": [{ "type": "web", "memory": "256M" }]
        }));
        assert!(!diags.has_errors());
    }
}
