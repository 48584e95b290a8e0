//! `cloudfoundry_app`
//!
//! The largest reconciler: manifest push, package staging, the deploy
//! strategy machine (none / rolling / blue-green), environment-variable
//! diffing, SSH feature, sidecar/process/route/binding children, and
//! best-effort log enrichment when a push fails.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use cfweave_client::types::{App, Organization, Space};
use cfweave_client::{poll_job, CancelToken, ClientError, Collection};
use cfweave_core::{Attribute, AttributePath, Diagnostics, Metadata, Schema};

use crate::reconcile::{
    client_diag, decode, finish_delete, ReadOutcome, ReadOutput, ReconcileOutput,
    ResourceReconciler,
};
use crate::resources::app_manifest::{
    validate_shape, ManifestApp, ManifestDocker, ManifestDocument, ManifestProcess,
    ManifestRoute, ManifestService, ManifestSidecar,
};
use crate::session::Session;

pub const BASE: &str = "/v3/apps";

const DEFAULT_BG_TIMEOUT_MIN: i64 = 5;
const DEFAULT_BG_INTERVAL_SECS: i64 = 5;
const STAGING_DEADLINE: Duration = Duration::from_secs(15 * 60);

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSpec {
    #[serde(rename = "type")]
    pub process_type: String,
    pub command: Option<String>,
    pub memory: Option<String>,
    pub disk_quota: Option<String>,
    pub instances: Option<i64>,
    pub health_check_type: Option<String>,
    pub health_check_http_endpoint: Option<String>,
    pub health_check_interval: Option<i64>,
    pub health_check_invocation_timeout: Option<i64>,
    pub readiness_health_check_type: Option<String>,
    pub readiness_health_check_http_endpoint: Option<String>,
    pub timeout: Option<i64>,
    pub log_rate_limit_per_second: Option<String>,
}

impl ProcessSpec {
    fn to_manifest(&self) -> ManifestProcess {
        ManifestProcess {
            process_type: self.process_type.clone(),
            command: self.command.clone(),
            memory: self.memory.clone(),
            disk_quota: self.disk_quota.clone(),
            instances: self.instances,
            health_check_type: self.health_check_type.clone(),
            health_check_http_endpoint: self.health_check_http_endpoint.clone(),
            health_check_interval: self.health_check_interval,
            health_check_invocation_timeout: self.health_check_invocation_timeout,
            readiness_health_check_type: self.readiness_health_check_type.clone(),
            readiness_health_check_http_endpoint: self.readiness_health_check_http_endpoint.clone(),
            timeout: self.timeout,
            log_rate_limit_per_second: self.log_rate_limit_per_second.clone(),
        }
    }

    fn from_manifest(process: &ManifestProcess) -> Self {
        Self {
            process_type: process.process_type.clone(),
            command: process.command.clone(),
            memory: process.memory.clone(),
            disk_quota: process.disk_quota.clone(),
            instances: process.instances,
            health_check_type: process.health_check_type.clone(),
            health_check_http_endpoint: process.health_check_http_endpoint.clone(),
            health_check_interval: process.health_check_interval,
            health_check_invocation_timeout: process.health_check_invocation_timeout,
            readiness_health_check_type: process.readiness_health_check_type.clone(),
            readiness_health_check_http_endpoint: process
                .readiness_health_check_http_endpoint
                .clone(),
            timeout: process.timeout,
            log_rate_limit_per_second: process.log_rate_limit_per_second.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarSpec {
    pub name: String,
    pub command: String,
    pub process_types: Vec<String>,
    pub memory: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteSpec {
    pub route: String,
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingSpec {
    pub service_instance: String,
    pub params: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppRecord {
    pub id: String,
    pub name: String,
    pub space: String,
    pub org_name: Option<String>,
    pub space_name: Option<String>,
    pub stack: Option<String>,
    pub buildpacks: Vec<String>,
    /// Filesystem archive; exactly one of this and `docker_image`
    pub path: Option<String>,
    pub docker_image: Option<String>,
    pub docker_username: Option<String>,
    pub docker_password: Option<String>,
    pub command: Option<String>,
    pub memory: Option<String>,
    pub disk_quota: Option<String>,
    pub instances: Option<i64>,
    pub health_check_type: Option<String>,
    pub health_check_http_endpoint: Option<String>,
    pub health_check_interval: Option<i64>,
    pub health_check_invocation_timeout: Option<i64>,
    pub readiness_health_check_type: Option<String>,
    pub readiness_health_check_http_endpoint: Option<String>,
    pub timeout: Option<i64>,
    pub log_rate_limit_per_second: Option<String>,
    pub processes: Vec<ProcessSpec>,
    pub sidecars: Vec<SidecarSpec>,
    pub routes: Vec<RouteSpec>,
    pub no_route: Option<bool>,
    pub random_route: Option<bool>,
    pub service_bindings: Vec<BindingSpec>,
    pub environment: BTreeMap<String, String>,
    pub enable_ssh: Option<bool>,
    pub strategy: Option<String>,
    pub app_deployed_running_timeout: Option<i64>,
    pub app_deployed_running_check_interval: Option<i64>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl AppRecord {
    pub fn metadata(&self) -> Metadata {
        Metadata {
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
        }
    }

    /// Project into the manifest document the push consumes.
    pub fn to_manifest(&self) -> Result<ManifestApp, Diagnostics> {
        let mut app = ManifestApp {
            name: self.name.clone(),
            stack: self.stack.clone(),
            buildpacks: self.buildpacks.clone(),
            env: self.environment.clone(),
            no_route: self.no_route.filter(|on| *on),
            random_route: self.random_route.filter(|on| *on),
            ..ManifestApp::default()
        };
        if let Some(image) = &self.docker_image {
            app.docker = Some(ManifestDocker {
                image: image.clone(),
                username: self.docker_username.clone(),
            });
        }
        if self.processes.is_empty() {
            app.command = self.command.clone();
            app.memory = self.memory.clone();
            app.disk_quota = self.disk_quota.clone();
            // Rolling deployments refuse an app with zero desired
            // instances, so the implicit web process defaults to one.
            app.instances = Some(self.instances.unwrap_or(1));
            app.health_check_type = self.health_check_type.clone();
            app.health_check_http_endpoint = self.health_check_http_endpoint.clone();
            app.health_check_interval = self.health_check_interval;
            app.health_check_invocation_timeout = self.health_check_invocation_timeout;
            app.readiness_health_check_type = self.readiness_health_check_type.clone();
            app.readiness_health_check_http_endpoint =
                self.readiness_health_check_http_endpoint.clone();
            app.timeout = self.timeout;
            app.log_rate_limit_per_second = self.log_rate_limit_per_second.clone();
        } else {
            app.processes = self.processes.iter().map(ProcessSpec::to_manifest).collect();
        }
        app.sidecars = self
            .sidecars
            .iter()
            .map(|s| ManifestSidecar {
                name: s.name.clone(),
                command: s.command.clone(),
                process_types: s.process_types.clone(),
                memory: s.memory.clone(),
            })
            .collect();
        app.routes = self
            .routes
            .iter()
            .map(|r| ManifestRoute {
                route: r.route.clone(),
                protocol: Some(r.protocol.clone().unwrap_or_else(|| "http1".to_string())),
            })
            .collect();
        let mut services = Vec::new();
        for binding in &self.service_bindings {
            let parameters = match &binding.params {
                Some(raw) => Some(serde_json::from_str(raw).map_err(|e| {
                    let mut diagnostics = Diagnostics::new();
                    diagnostics.error_at(
                        AttributePath::root("service_bindings"),
                        "Invalid JSON",
                        format!("params for '{}': {}", binding.service_instance, e),
                    );
                    diagnostics
                })?),
                None => None,
            };
            services.push(ManifestService {
                name: binding.service_instance.clone(),
                parameters,
            });
        }
        app.services = services;
        Ok(app)
    }

    /// Absorb the canonical manifest the platform generated, preserving
    /// the write-only inputs the manifest cannot carry.
    fn absorb_manifest(&mut self, manifest: &ManifestApp) {
        self.stack = manifest.stack.clone();
        self.buildpacks = manifest.buildpacks.clone();
        if self.processes.is_empty() {
            self.command = manifest.command.clone();
            self.memory = manifest.memory.clone();
            self.disk_quota = manifest.disk_quota.clone();
            self.instances = manifest.instances;
            self.health_check_type = manifest.health_check_type.clone();
            self.health_check_http_endpoint = manifest.health_check_http_endpoint.clone();
            self.health_check_interval = manifest.health_check_interval;
            self.health_check_invocation_timeout = manifest.health_check_invocation_timeout;
            self.readiness_health_check_type = manifest.readiness_health_check_type.clone();
            self.readiness_health_check_http_endpoint =
                manifest.readiness_health_check_http_endpoint.clone();
            self.timeout = manifest.timeout;
            self.log_rate_limit_per_second = manifest.log_rate_limit_per_second.clone();
            // A single implicit web process in the generated manifest
            // stays in the top-level shape.
            if manifest.processes.len() == 1 && manifest.processes[0].process_type == "web" {
                let web = ProcessSpec::from_manifest(&manifest.processes[0]);
                self.command = self.command.take().or(web.command);
                self.memory = self.memory.take().or(web.memory);
                self.disk_quota = self.disk_quota.take().or(web.disk_quota);
                self.instances = self.instances.take().or(web.instances);
                self.health_check_type = self.health_check_type.take().or(web.health_check_type);
                self.timeout = self.timeout.take().or(web.timeout);
            }
        } else {
            self.processes = manifest
                .processes
                .iter()
                .map(ProcessSpec::from_manifest)
                .collect();
        }
        if !manifest.sidecars.is_empty() {
            self.sidecars = manifest
                .sidecars
                .iter()
                .map(|s| SidecarSpec {
                    name: s.name.clone(),
                    command: s.command.clone(),
                    process_types: s.process_types.clone(),
                    memory: s.memory.clone(),
                })
                .collect();
        }
        if self.no_route != Some(true) && self.random_route != Some(true) {
            self.routes = manifest
                .routes
                .iter()
                .map(|r| RouteSpec {
                    route: r.route.clone(),
                    protocol: r.protocol.clone(),
                })
                .collect();
        }
        self.environment = manifest.env.clone();
    }
}

// ---------------------------------------------------------------------------
// Strategy machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Strategy {
    #[default]
    None,
    Rolling,
    BlueGreen,
}

impl Strategy {
    fn parse(raw: Option<&str>) -> Result<Self, String> {
        match raw {
            None | Some("none") => Ok(Strategy::None),
            Some("rolling") => Ok(Strategy::Rolling),
            Some("blue-green") => Ok(Strategy::BlueGreen),
            Some(other) => Err(format!(
                "'{}' is not one of 'none', 'rolling', 'blue-green'",
                other
            )),
        }
    }
}

/// Blue-green pacing; the two knobs are silently ignored for the other
/// strategies, never rejected.
fn blue_green_pacing(record: &AppRecord) -> (Duration, Duration) {
    let timeout = record
        .app_deployed_running_timeout
        .unwrap_or(DEFAULT_BG_TIMEOUT_MIN)
        .max(1);
    let interval = record
        .app_deployed_running_check_interval
        .unwrap_or(DEFAULT_BG_INTERVAL_SECS)
        .clamp(1, 30);
    (
        Duration::from_secs(timeout as u64 * 60),
        Duration::from_secs(interval as u64),
    )
}

// ---------------------------------------------------------------------------
// Push pipeline
// ---------------------------------------------------------------------------

fn apps(session: &Session) -> Collection<'_, App> {
    session.client().collection("app", BASE)
}

async fn stage(
    session: &Session,
    record: &AppRecord,
    app_guid: &str,
    cancel: &CancelToken,
) -> Result<String, ClientError> {
    let package = if let Some(image) = &record.docker_image {
        session
            .client()
            .create_docker_package(
                app_guid,
                image,
                record.docker_username.as_deref(),
                record.docker_password.as_deref(),
            )
            .await?
    } else {
        let path = record.path.as_deref().unwrap_or_default();
        let package = session.client().create_bits_package(app_guid).await?;
        session
            .client()
            .upload_package_bits(&package.guid, Path::new(path))
            .await?;
        session
            .client()
            .poll_package_ready(&package.guid, STAGING_DEADLINE, cancel)
            .await?
    };
    let build = session.client().create_build(&package.guid).await?;
    session
        .client()
        .poll_build_staged(&build.guid, STAGING_DEADLINE, cancel)
        .await
}

async fn release(
    session: &Session,
    record: &AppRecord,
    app_guid: &str,
    droplet_guid: &str,
    strategy: Strategy,
    cancel: &CancelToken,
) -> Result<(), ClientError> {
    match strategy {
        Strategy::None => {
            // Outage on release: stop everything, swap, start.
            session.client().stop_app(app_guid).await?;
            session
                .client()
                .set_current_droplet(app_guid, droplet_guid)
                .await?;
            session.client().start_app(app_guid).await?;
            Ok(())
        }
        Strategy::Rolling => {
            // Instances rotate one at a time; no completion deadline.
            session
                .client()
                .create_deployment(app_guid, droplet_guid, "rolling")
                .await?;
            Ok(())
        }
        Strategy::BlueGreen => {
            let deployment = session
                .client()
                .create_deployment(app_guid, droplet_guid, "rolling")
                .await?;
            let (deadline, interval) = blue_green_pacing(record);
            let started = std::time::Instant::now();
            loop {
                let current = session.client().get_deployment(&deployment.guid).await?;
                match (current.status.value.as_str(), current.status.reason.as_str()) {
                    ("FINALIZED", "DEPLOYED") => return Ok(()),
                    ("FINALIZED", reason) => {
                        return Err(ClientError::UnexpectedResponse {
                            message: format!("deployment ended as {}", reason),
                        })
                    }
                    _ => {}
                }
                if started.elapsed() >= deadline {
                    // Tear the parallel deployment down; the old
                    // instances keep serving.
                    let _ = session.client().cancel_deployment(&deployment.guid).await;
                    return Err(ClientError::JobTimeout {
                        phase: current.status.value,
                        waited_secs: deadline.as_secs(),
                    });
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                }
            }
        }
    }
}

/// Attach recent stderr lines to a push failure when the opt-in flag is
/// set. Log-fetch failures are swallowed.
async fn enrich_failure(
    session: &Session,
    app_guid: &str,
    since: chrono::DateTime<Utc>,
    diagnostics: &mut Diagnostics,
) {
    if !session.app_log_trace() {
        return;
    }
    match session.client().recent_error_logs(app_guid, since).await {
        Ok(lines) if !lines.is_empty() => {
            diagnostics.warning(
                "Application error logs",
                lines.join("\n"),
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::debug!(error = %e, "log enrichment unavailable");
        }
    }
}

/// Resolve space and org names for the record.
async fn resolve_names(
    session: &Session,
    space_guid: &str,
) -> Result<(String, String), ClientError> {
    let space: Space = session
        .client()
        .get_json(&format!("/v3/spaces/{}", space_guid), &[])
        .await?;
    let org_guid = space
        .relationships
        .organization
        .guid()
        .unwrap_or_default()
        .to_string();
    let org: Organization = session
        .client()
        .get_json(&format!("/v3/organizations/{}", org_guid), &[])
        .await?;
    Ok((space.name, org.name))
}

/// Post-push read-back: canonical manifest, SSH feature, names.
async fn read_back(
    session: &Session,
    mut record: AppRecord,
    app: &App,
) -> Result<AppRecord, ClientError> {
    record.id = app.guid.clone();
    record.labels = app.metadata.labels.clone();
    record.annotations = app.metadata.annotations.clone();
    record.created_at = Some(app.created_at.to_rfc3339());
    record.updated_at = Some(app.updated_at.to_rfc3339());

    let yaml = session.client().generate_manifest(&app.guid).await?;
    if let Ok(document) = ManifestDocument::parse(&yaml) {
        if let Some(manifest) = document.first() {
            record.absorb_manifest(manifest);
        }
    }

    record.enable_ssh = Some(session.client().ssh_enabled(&app.guid).await?);

    let space_guid = app
        .relationships
        .space
        .guid()
        .unwrap_or(&record.space)
        .to_string();
    record.space = space_guid.clone();
    let (space_name, org_name) = resolve_names(session, &space_guid).await?;
    record.space_name = Some(space_name);
    record.org_name = Some(org_name);
    Ok(record)
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct AppReconciler;

#[async_trait]
impl ResourceReconciler for AppReconciler {
    fn kind(&self) -> &'static str {
        "cloudfoundry_app"
    }

    fn short_kind(&self) -> &'static str {
        "app"
    }

    fn schema(&self) -> Schema {
        let mut process = indexmap::IndexMap::new();
        process.insert("type".to_string(), Attribute::required_string());
        process.insert("command".to_string(), Attribute::optional_string());
        process.insert("memory".to_string(), Attribute::optional_string());
        process.insert("disk_quota".to_string(), Attribute::optional_string());
        process.insert("instances".to_string(), Attribute::optional_int());
        process.insert("health_check_type".to_string(), Attribute::optional_string());
        process.insert(
            "health_check_http_endpoint".to_string(),
            Attribute::optional_string(),
        );
        process.insert("health_check_interval".to_string(), Attribute::optional_int());
        process.insert(
            "health_check_invocation_timeout".to_string(),
            Attribute::optional_int(),
        );
        process.insert(
            "readiness_health_check_type".to_string(),
            Attribute::optional_string(),
        );
        process.insert(
            "readiness_health_check_http_endpoint".to_string(),
            Attribute::optional_string(),
        );
        process.insert("timeout".to_string(), Attribute::optional_int());
        process.insert(
            "log_rate_limit_per_second".to_string(),
            Attribute::optional_string(),
        );

        let mut sidecar = indexmap::IndexMap::new();
        sidecar.insert("name".to_string(), Attribute::required_string());
        sidecar.insert("command".to_string(), Attribute::required_string());
        sidecar.insert("process_types".to_string(), Attribute::optional_string_set());
        sidecar.insert("memory".to_string(), Attribute::optional_string());

        let mut route = indexmap::IndexMap::new();
        route.insert("route".to_string(), Attribute::required_string());
        route.insert("protocol".to_string(), Attribute::optional_string());

        let mut binding = indexmap::IndexMap::new();
        binding.insert("service_instance".to_string(), Attribute::required_string());
        binding.insert("params".to_string(), Attribute::optional_json().sensitive());

        Schema::v0()
            .with_attribute("name", Attribute::required_string())
            .with_attribute("space", Attribute::required_string().requires_replace())
            .with_attribute("org_name", Attribute::computed_string())
            .with_attribute("space_name", Attribute::computed_string())
            .with_attribute("stack", Attribute::optional_string())
            .with_attribute("buildpacks", Attribute::optional_string_set())
            .with_attribute("path", Attribute::optional_string())
            .with_attribute("docker_image", Attribute::optional_string())
            .with_attribute("docker_username", Attribute::optional_string())
            .with_attribute("docker_password", Attribute::optional_string().sensitive())
            .with_attribute("command", Attribute::optional_string())
            .with_attribute("memory", Attribute::optional_string())
            .with_attribute("disk_quota", Attribute::optional_string())
            .with_attribute("instances", Attribute::optional_int())
            .with_attribute("health_check_type", Attribute::optional_string())
            .with_attribute("health_check_http_endpoint", Attribute::optional_string())
            .with_attribute("health_check_interval", Attribute::optional_int())
            .with_attribute(
                "health_check_invocation_timeout",
                Attribute::optional_int(),
            )
            .with_attribute(
                "readiness_health_check_type",
                Attribute::optional_string(),
            )
            .with_attribute(
                "readiness_health_check_http_endpoint",
                Attribute::optional_string(),
            )
            .with_attribute("timeout", Attribute::optional_int())
            .with_attribute("log_rate_limit_per_second", Attribute::optional_string())
            .with_attribute("processes", Attribute::object_list(process))
            .with_attribute("sidecars", Attribute::object_list(sidecar).requires_replace())
            .with_attribute("routes", Attribute::object_list(route))
            .with_attribute("no_route", Attribute::optional_bool())
            .with_attribute("random_route", Attribute::optional_bool())
            .with_attribute(
                "service_bindings",
                Attribute::object_list(binding).requires_replace(),
            )
            .with_attribute("environment", Attribute::optional_map())
            .with_attribute("enable_ssh", Attribute::optional_bool())
            .with_attribute("strategy", Attribute::optional_string())
            .with_attribute("app_deployed_running_timeout", Attribute::optional_int())
            .with_attribute(
                "app_deployed_running_check_interval",
                Attribute::optional_int(),
            )
            .with_common()
    }

    fn validate(&self, config: &Value) -> Diagnostics {
        let mut diagnostics = validate_shape(config);
        if let Some(strategy) = config.get("strategy").and_then(Value::as_str) {
            if let Err(message) = Strategy::parse(Some(strategy)) {
                diagnostics.error_at(
                    AttributePath::root("strategy"),
                    "Unknown deploy strategy",
                    message,
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
        let validation = self.validate(&desired);
        if validation.has_errors() {
            return ReconcileOutput::errors(validation);
        }
        let desired: AppRecord = match decode("app", desired) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let strategy = match Strategy::parse(desired.strategy.as_deref()) {
            Ok(strategy) => strategy,
            Err(message) => return ReconcileOutput::error("Unknown deploy strategy", message),
        };

        // Preflight: the target space must exist; never re-create it.
        if let Err(e) = resolve_names(session, &desired.space).await {
            return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Referenced space not found",
                &e,
            )]));
        }

        let manifest = match desired.to_manifest() {
            Ok(manifest) => manifest,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let yaml = match ManifestDocument::single(manifest).to_yaml() {
            Ok(yaml) => yaml,
            Err(e) => return ReconcileOutput::error("Manifest assembly failed", e.to_string()),
        };

        let push_started = Utc::now();
        let job = match session.client().apply_manifest(&desired.space, &yaml).await {
            Ok(job) => job,
            Err(e) => {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Manifest apply failed",
                    &e,
                )]))
            }
        };
        if let Err(e) = poll_job(session.client(), &job, session.poll_options(), cancel).await {
            return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Manifest apply did not complete",
                &e,
            )]));
        }

        let app = match apps(session)
            .single(&[
                ("names", desired.name.as_str()),
                ("space_guids", desired.space.as_str()),
            ])
            .await
        {
            Ok(app) => app,
            Err(e) => {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Failed to locate app after manifest apply",
                    &e,
                )]))
            }
        };

        // From here on the app exists: every failure path still returns
        // the record with its identifier so the next plan converges.
        let fail = |diagnostics: Diagnostics, record: &AppRecord| {
            let mut partial = record.clone();
            partial.id = app.guid.clone();
            ReconcileOutput::ok("app", &partial.id, &partial).with_warnings(diagnostics)
        };

        let droplet = match stage(session, &desired, &app.guid, cancel).await {
            Ok(droplet) => droplet,
            Err(e) => {
                let mut diagnostics =
                    Diagnostics::from_iter([client_diag("Staging failed", &e)]);
                enrich_failure(session, &app.guid, push_started, &mut diagnostics).await;
                return fail(diagnostics, &desired);
            }
        };
        if let Err(e) = release(session, &desired, &app.guid, &droplet, strategy, cancel).await {
            let mut diagnostics =
                Diagnostics::from_iter([client_diag("Release failed", &e)]);
            enrich_failure(session, &app.guid, push_started, &mut diagnostics).await;
            return fail(diagnostics, &desired);
        }

        let mut diagnostics = Diagnostics::new();
        if let Some(enabled) = desired.enable_ssh {
            if let Err(e) = session.client().set_ssh_enabled(&app.guid, enabled).await {
                diagnostics.push(client_diag("Failed to set SSH feature", &e));
            }
        }

        match read_back(session, desired.clone(), &app).await {
            Ok(record) => {
                ReconcileOutput::ok(self.short_kind(), &record.id, &record)
                    .with_warnings(diagnostics)
            }
            Err(e) => {
                diagnostics.push(client_diag("Post-push read failed", &e));
                fail(diagnostics, &desired)
            }
        }
    }

    async fn read(&self, session: &Session, prior: Value, _cancel: &CancelToken) -> ReadOutput {
        let prior: AppRecord = match decode("app", prior) {
            Ok(record) => record,
            Err(diags) => {
                return ReadOutput {
                    outcome: ReadOutcome::Gone,
                    identity: None,
                    diagnostics: diags,
                }
            }
        };
        let app = match apps(session).get(&prior.id).await {
            Ok(app) => app,
            Err(e) if e.is_not_found() => return ReadOutput::gone(),
            Err(e) => return ReadOutput::error("Failed to read app", e.to_string()),
        };
        match read_back(session, prior.clone(), &app).await {
            Ok(mut record) => {
                record.name = app.name.clone();
                ReadOutput::live(self.short_kind(), &record.id, &record)
            }
            Err(e) => ReadOutput::error("Failed to read app children", e.to_string()),
        }
    }

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        cancel: &CancelToken,
    ) -> ReconcileOutput {
        let validation = self.validate(&plan);
        if validation.has_errors() {
            return ReconcileOutput::errors(validation);
        }
        let plan: AppRecord = match decode("app", plan) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let prior: AppRecord = match decode("app", prior) {
            Ok(record) => record,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let strategy = match Strategy::parse(plan.strategy.as_deref()) {
            Ok(strategy) => strategy,
            Err(message) => return ReconcileOutput::error("Unknown deploy strategy", message),
        };
        let app_guid = prior.id.clone();

        // Environment diff: removed keys become explicit nulls, changed
        // and added keys carry their value, unchanged keys are omitted.
        let mut env_patch: BTreeMap<String, Option<String>> = BTreeMap::new();
        for key in prior.environment.keys() {
            if !plan.environment.contains_key(key) {
                env_patch.insert(key.clone(), None);
            }
        }
        for (key, value) in &plan.environment {
            if prior.environment.get(key) != Some(value) {
                env_patch.insert(key.clone(), Some(value.clone()));
            }
        }
        if !env_patch.is_empty() {
            if let Err(e) = session.client().update_env(&app_guid, env_patch).await {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Failed to update environment",
                    &e,
                )]));
            }
        }

        // Label/annotation diff; deletions carry the null sentinel.
        let metadata = Metadata::diff(&prior.metadata(), &plan.metadata());
        if !metadata.is_empty() {
            let body = json!({ "metadata": metadata });
            if let Err(e) = session
                .client()
                .patch_json::<App>(&format!("{}/{}", BASE, app_guid), &body)
                .await
            {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Failed to update app metadata",
                    &e,
                )]));
            }
        }

        let manifest = match plan.to_manifest() {
            Ok(manifest) => manifest,
            Err(diags) => return ReconcileOutput::errors(diags),
        };
        let yaml = match ManifestDocument::single(manifest).to_yaml() {
            Ok(yaml) => yaml,
            Err(e) => return ReconcileOutput::error("Manifest assembly failed", e.to_string()),
        };

        let push_started = Utc::now();
        let apply = session.client().apply_manifest(&plan.space, &yaml).await;
        let job = match apply {
            Ok(job) => job,
            Err(e) => {
                return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                    "Manifest apply failed",
                    &e,
                )]))
            }
        };
        if let Err(e) = poll_job(session.client(), &job, session.poll_options(), cancel).await {
            return ReconcileOutput::errors(Diagnostics::from_iter([client_diag(
                "Manifest apply did not complete",
                &e,
            )]));
        }

        let droplet = match stage(session, &plan, &app_guid, cancel).await {
            Ok(droplet) => droplet,
            Err(e) => {
                let mut diagnostics = Diagnostics::from_iter([client_diag("Staging failed", &e)]);
                enrich_failure(session, &app_guid, push_started, &mut diagnostics).await;
                return ReconcileOutput::errors(diagnostics);
            }
        };
        if let Err(e) = release(session, &plan, &app_guid, &droplet, strategy, cancel).await {
            let mut diagnostics = Diagnostics::from_iter([client_diag("Release failed", &e)]);
            enrich_failure(session, &app_guid, push_started, &mut diagnostics).await;
            return ReconcileOutput::errors(diagnostics);
        }

        let mut diagnostics = Diagnostics::new();
        if plan.enable_ssh != prior.enable_ssh {
            if let Some(enabled) = plan.enable_ssh {
                if let Err(e) = session.client().set_ssh_enabled(&app_guid, enabled).await {
                    diagnostics.push(client_diag("Failed to set SSH feature", &e));
                }
            }
        }

        let app = match apps(session).get(&app_guid).await {
            Ok(app) => app,
            Err(e) => {
                diagnostics.push(client_diag("Failed to re-read app", &e));
                return ReconcileOutput::errors(diagnostics);
            }
        };
        match read_back(session, plan, &app).await {
            Ok(record) => ReconcileOutput::ok(self.short_kind(), &record.id, &record)
                .with_warnings(diagnostics),
            Err(e) => {
                diagnostics.push(client_diag("Post-push read failed", &e));
                ReconcileOutput::errors(diagnostics)
            }
        }
    }

    async fn delete(&self, session: &Session, prior: Value, cancel: &CancelToken) -> Diagnostics {
        let prior: AppRecord = match decode("app", prior) {
            Ok(record) => record,
            Err(diags) => return diags,
        };
        let result = apps(session).delete(&prior.id).await;
        finish_delete(session, "app", result, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_record() -> AppRecord {
        AppRecord {
            name: "cf-nodejs".to_string(),
            space: "s-1".to_string(),
            path: Some("/tmp/app.zip".to_string()),
            ..AppRecord::default()
        }
    }

    #[test]
    fn test_manifest_defaults_instances_to_one() {
        let manifest = base_record().to_manifest().unwrap();
        assert_eq!(manifest.instances, Some(1));
    }

    #[test]
    fn test_manifest_keeps_explicit_instances() {
        let mut record = base_record();
        record.instances = Some(2);
        record.memory = Some("256M".to_string());
        record.disk_quota = Some("1024mB".to_string());
        let manifest = record.to_manifest().unwrap();
        assert_eq!(manifest.instances, Some(2));
        assert_eq!(manifest.memory.as_deref(), Some("256M"));
        assert_eq!(manifest.disk_quota.as_deref(), Some("1024mB"));
    }

    #[test]
    fn test_processes_take_over_from_top_level() {
        let mut record = base_record();
        record.processes = vec![
            ProcessSpec {
                process_type: "web".to_string(),
                memory: Some("256M".to_string()),
                ..ProcessSpec::default()
            },
            ProcessSpec {
                process_type: "scheduler".to_string(),
                instances: Some(0),
                memory: Some("256M".to_string()),
                health_check_type: Some("process".to_string()),
                ..ProcessSpec::default()
            },
        ];
        let manifest = record.to_manifest().unwrap();
        assert!(manifest.instances.is_none());
        assert_eq!(manifest.processes.len(), 2);
        assert_eq!(manifest.processes[1].process_type, "scheduler");
        assert_eq!(manifest.processes[1].instances, Some(0));
    }

    #[test]
    fn test_route_protocol_defaults_to_http1() {
        let mut record = base_record();
        record.routes = vec![RouteSpec {
            route: "app.example.com".to_string(),
            protocol: None,
        }];
        let manifest = record.to_manifest().unwrap();
        assert_eq!(manifest.routes[0].protocol.as_deref(), Some("http1"));
    }

    #[test]
    fn test_binding_params_must_be_json() {
        let mut record = base_record();
        record.service_bindings = vec![BindingSpec {
            service_instance: "db".to_string(),
            params: Some("{broken".to_string()),
        }];
        assert!(record.to_manifest().is_err());
    }

    #[test]
    fn test_blue_green_pacing_clamps_interval() {
        let mut record = base_record();
        record.app_deployed_running_check_interval = Some(90);
        let (_, interval) = blue_green_pacing(&record);
        assert_eq!(interval, Duration::from_secs(30));

        record.app_deployed_running_check_interval = Some(0);
        let (_, interval) = blue_green_pacing(&record);
        assert_eq!(interval, Duration::from_secs(1));

        record.app_deployed_running_check_interval = None;
        record.app_deployed_running_timeout = None;
        let (deadline, interval) = blue_green_pacing(&record);
        assert_eq!(deadline, Duration::from_secs(300));
        assert_eq!(interval, Duration::from_secs(5));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(Strategy::parse(None).unwrap(), Strategy::None);
        assert_eq!(Strategy::parse(Some("rolling")).unwrap(), Strategy::Rolling);
        assert_eq!(
            Strategy::parse(Some("blue-green")).unwrap(),
            Strategy::BlueGreen
        );
        assert!(Strategy::parse(Some("canary")).is_err());
    }

    #[test]
    fn test_absorb_manifest_keeps_shape() {
        let mut record = base_record();
        record.memory = Some("0.5gb".to_string());
        let generated = ManifestApp {
            name: "cf-nodejs".to_string(),
            memory: Some("256M".to_string()),
            disk_quota: Some("1024M".to_string()),
            instances: Some(2),
            ..ManifestApp::default()
        };
        record.absorb_manifest(&generated);
        assert_eq!(record.memory.as_deref(), Some("256M"));
        assert_eq!(record.instances, Some(2));
        assert!(record.processes.is_empty());
    }
}
