//! Application sub-APIs: manifests, environment, SSH, push pipeline,
//! deployments and log retrieval
//!
//! The push pipeline (package -> build -> droplet) and the deployment
//! endpoints are driven by the application reconciler's strategy machine;
//! everything here is a single round trip or a bounded poll.

use base64::Engine;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::client::{CfClient, Created, JobRef};
use crate::error::{ClientError, Result};
use crate::types::{
    App, AppFeature, Build, Deployment, Droplet, EnvVars, Package, Process, ProcessStats,
    Route, Sidecar,
};

const STAGE_POLL_INTERVAL: Duration = Duration::from_secs(3);

impl CfClient {
    // -- manifests ----------------------------------------------------------

    /// Apply a YAML manifest to a space; always asynchronous.
    pub async fn apply_manifest(&self, space_guid: &str, manifest_yaml: &str) -> Result<JobRef> {
        let url = self.url(&format!(
            "/v3/spaces/{}/actions/apply_manifest",
            space_guid
        ))?;
        let token = self.bearer_token().await?;
        let response = self
            .http_client()
            .post(url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/x-yaml")
            .body(manifest_yaml.to_string())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }
        self.job_from_response(&response)
            .ok_or_else(|| ClientError::UnexpectedResponse {
                message: "apply_manifest returned no job location".to_string(),
            })
    }

    /// Re-generate the canonical manifest for an app. The push response
    /// does not carry the full post-reconciliation shape; this does.
    pub async fn generate_manifest(&self, app_guid: &str) -> Result<String> {
        let url = self.url(&format!("/v3/apps/{}/manifest", app_guid))?;
        let token = self.bearer_token().await?;
        let response = self
            .http_client()
            .get(url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/x-yaml")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }
        Ok(response.text().await?)
    }

    async fn error_from(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(default)]
            errors: Vec<crate::error::ApiErrorBody>,
        }
        let errors = response
            .json::<Envelope>()
            .await
            .map(|e| e.errors)
            .unwrap_or_default();
        ClientError::Api { status, errors }
    }

    // -- environment --------------------------------------------------------

    pub async fn get_env(&self, app_guid: &str) -> Result<BTreeMap<String, String>> {
        let env: EnvVars = self
            .get_json(&format!("/v3/apps/{}/environment_variables", app_guid), &[])
            .await?;
        Ok(env
            .vars
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect())
    }

    /// Patch the app environment. `None` values erase keys on the
    /// platform; unchanged keys should be omitted by the caller.
    pub async fn update_env(
        &self,
        app_guid: &str,
        vars: BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let _: EnvVars = self
            .patch_json(
                &format!("/v3/apps/{}/environment_variables", app_guid),
                &EnvVars { vars },
            )
            .await?;
        Ok(())
    }

    // -- SSH feature --------------------------------------------------------

    pub async fn ssh_enabled(&self, app_guid: &str) -> Result<bool> {
        let feature: AppFeature = self
            .get_json(&format!("/v3/apps/{}/features/ssh", app_guid), &[])
            .await?;
        Ok(feature.enabled)
    }

    pub async fn set_ssh_enabled(&self, app_guid: &str, enabled: bool) -> Result<()> {
        let _: AppFeature = self
            .patch_json(
                &format!("/v3/apps/{}/features/ssh", app_guid),
                &json!({ "enabled": enabled }),
            )
            .await?;
        Ok(())
    }

    // -- push pipeline ------------------------------------------------------

    /// Create a bits package for an app.
    pub async fn create_bits_package(&self, app_guid: &str) -> Result<Package> {
        let body = json!({
            "type": "bits",
            "relationships": { "app": { "data": { "guid": app_guid } } }
        });
        match self.post_json("/v3/packages", &body).await? {
            Created::Resource(package) => Ok(package),
            Created::Job(_) => Err(ClientError::UnexpectedResponse {
                message: "package create answered with a job".to_string(),
            }),
        }
    }

    /// Create a docker package, with optional registry credentials.
    pub async fn create_docker_package(
        &self,
        app_guid: &str,
        image: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Package> {
        let mut data = json!({ "image": image });
        if let (Some(username), Some(password)) = (username, password) {
            data["username"] = json!(username);
            data["password"] = json!(password);
        }
        let body = json!({
            "type": "docker",
            "data": data,
            "relationships": { "app": { "data": { "guid": app_guid } } }
        });
        match self.post_json("/v3/packages", &body).await? {
            Created::Resource(package) => Ok(package),
            Created::Job(_) => Err(ClientError::UnexpectedResponse {
                message: "package create answered with a job".to_string(),
            }),
        }
    }

    /// Upload an application archive into a bits package.
    pub async fn upload_package_bits(&self, package_guid: &str, archive: &Path) -> Result<Package> {
        let bytes = tokio::fs::read(archive).await?;
        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "app.zip".to_string());
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/zip")
            .map_err(ClientError::Transport)?;
        let form = reqwest::multipart::Form::new().part("bits", part);

        let url = self.url(&format!("/v3/packages/{}/upload", package_guid))?;
        let token = self.bearer_token().await?;
        let response = self
            .http_client()
            .post(url)
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }
        Ok(response.json().await?)
    }

    /// Wait for an uploaded package to become READY.
    pub async fn poll_package_ready(
        &self,
        package_guid: &str,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<Package> {
        let started = Instant::now();
        loop {
            let package: Package = self
                .get_json(&format!("/v3/packages/{}", package_guid), &[])
                .await?;
            match package.state.as_str() {
                "READY" => return Ok(package),
                "FAILED" => {
                    return Err(ClientError::UnexpectedResponse {
                        message: format!("package {} failed processing", package_guid),
                    })
                }
                _ => {}
            }
            if started.elapsed() >= deadline {
                return Err(ClientError::JobTimeout {
                    phase: package.state,
                    waited_secs: deadline.as_secs(),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(STAGE_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            }
        }
    }

    /// Stage a package into a droplet.
    pub async fn create_build(&self, package_guid: &str) -> Result<Build> {
        let body = json!({ "package": { "guid": package_guid } });
        match self.post_json("/v3/builds", &body).await? {
            Created::Resource(build) => Ok(build),
            Created::Job(_) => Err(ClientError::UnexpectedResponse {
                message: "build create answered with a job".to_string(),
            }),
        }
    }

    /// Wait for a build to stage; returns the droplet guid.
    pub async fn poll_build_staged(
        &self,
        build_guid: &str,
        deadline: Duration,
        cancel: &CancelToken,
    ) -> Result<String> {
        let started = Instant::now();
        loop {
            let build: Build = self
                .get_json(&format!("/v3/builds/{}", build_guid), &[])
                .await?;
            match build.state.as_str() {
                "STAGED" => {
                    return build.droplet.map(|d| d.guid).ok_or_else(|| {
                        ClientError::UnexpectedResponse {
                            message: "staged build carries no droplet".to_string(),
                        }
                    })
                }
                "FAILED" => {
                    return Err(ClientError::UnexpectedResponse {
                        message: format!(
                            "staging failed: {}",
                            build.error.unwrap_or_else(|| "no detail".to_string())
                        ),
                    })
                }
                _ => {}
            }
            if started.elapsed() >= deadline {
                return Err(ClientError::JobTimeout {
                    phase: build.state,
                    waited_secs: deadline.as_secs(),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(STAGE_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            }
        }
    }

    pub async fn set_current_droplet(&self, app_guid: &str, droplet_guid: &str) -> Result<()> {
        let _: serde_json::Value = self
            .patch_json(
                &format!("/v3/apps/{}/relationships/current_droplet", app_guid),
                &json!({ "data": { "guid": droplet_guid } }),
            )
            .await?;
        Ok(())
    }

    pub async fn current_droplet(&self, app_guid: &str) -> Result<Droplet> {
        self.get_json(&format!("/v3/apps/{}/droplets/current", app_guid), &[])
            .await
    }

    // -- lifecycle actions --------------------------------------------------

    pub async fn start_app(&self, app_guid: &str) -> Result<App> {
        self.action(app_guid, "start").await
    }

    pub async fn stop_app(&self, app_guid: &str) -> Result<App> {
        self.action(app_guid, "stop").await
    }

    /// Stop-then-start; the `none` deploy strategy (outage on release).
    pub async fn restart_app(&self, app_guid: &str) -> Result<App> {
        self.action(app_guid, "restart").await
    }

    async fn action(&self, app_guid: &str, verb: &str) -> Result<App> {
        let url = self.url(&format!("/v3/apps/{}/actions/{}", app_guid, verb))?;
        let response = self.send(Method::POST, url, &[], None).await?;
        Ok(response.json().await?)
    }

    // -- deployments --------------------------------------------------------

    /// Create a deployment rotating the app onto `droplet_guid`.
    pub async fn create_deployment(
        &self,
        app_guid: &str,
        droplet_guid: &str,
        strategy: &str,
    ) -> Result<Deployment> {
        let body = json!({
            "strategy": strategy,
            "droplet": { "guid": droplet_guid },
            "relationships": { "app": { "data": { "guid": app_guid } } }
        });
        match self.post_json("/v3/deployments", &body).await? {
            Created::Resource(deployment) => Ok(deployment),
            Created::Job(_) => Err(ClientError::UnexpectedResponse {
                message: "deployment create answered with a job".to_string(),
            }),
        }
    }

    pub async fn get_deployment(&self, deployment_guid: &str) -> Result<Deployment> {
        self.get_json(&format!("/v3/deployments/{}", deployment_guid), &[])
            .await
    }

    /// Tear down a deployment that will not converge. Best-effort.
    pub async fn cancel_deployment(&self, deployment_guid: &str) -> Result<()> {
        let url = self.url(&format!("/v3/deployments/{}/actions/cancel", deployment_guid))?;
        self.send(Method::POST, url, &[], None).await?;
        Ok(())
    }

    // -- processes, sidecars, routes ----------------------------------------

    pub async fn app_processes(&self, app_guid: &str) -> Result<Vec<Process>> {
        self.list_all(&format!("/v3/apps/{}/processes", app_guid), &[])
            .await
    }

    pub async fn process_stats(&self, app_guid: &str, process_type: &str) -> Result<ProcessStats> {
        self.get_json(
            &format!("/v3/apps/{}/processes/{}/stats", app_guid, process_type),
            &[],
        )
        .await
    }

    pub async fn app_sidecars(&self, app_guid: &str) -> Result<Vec<Sidecar>> {
        self.list_all(&format!("/v3/apps/{}/sidecars", app_guid), &[])
            .await
    }

    pub async fn app_routes(&self, app_guid: &str) -> Result<Vec<Route>> {
        self.list_all(&format!("/v3/apps/{}/routes", app_guid), &[])
            .await
    }

    // -- logs ---------------------------------------------------------------

    /// Fetch log lines emitted since `start` and return those marked as
    /// stderr. Used to enrich push failures; callers swallow errors.
    pub async fn recent_error_logs(
        &self,
        app_guid: &str,
        start: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<String>> {
        let mut url = self.sibling_url("log-cache")?;
        url.set_path(&format!("/api/v1/read/{}", app_guid));
        let start_ns = start
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_string();
        let token = self.bearer_token().await?;
        let response = self
            .http_client()
            .get(url)
            .bearer_auth(token)
            .query(&[("start_time", start_ns.as_str()), ("envelope_types", "LOG")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        #[derive(Deserialize)]
        struct ReadResponse {
            envelopes: Batch,
        }
        #[derive(Deserialize)]
        struct Batch {
            #[serde(default)]
            batch: Vec<Envelope>,
        }
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(default)]
            log: Option<LogPayload>,
        }
        #[derive(Deserialize)]
        struct LogPayload {
            #[serde(default)]
            payload: String,
            #[serde(default, rename = "type")]
            log_type: String,
        }

        let parsed: ReadResponse = response.json().await?;
        let mut lines = Vec::new();
        for envelope in parsed.envelopes.batch {
            let Some(log) = envelope.log else { continue };
            if log.log_type != "ERR" {
                continue;
            }
            if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(&log.payload) {
                lines.push(String::from_utf8_lossy(&bytes).into_owned());
            }
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthScheme, ClientConfig};
    use url::Url;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> CfClient {
        let config = ClientConfig {
            api_url: Url::parse(&server.uri()).unwrap(),
            auth: AuthScheme::Token {
                access_token: "t".to_string(),
                refresh_token: None,
            },
            skip_ssl_validation: false,
            user_agent: "ua".to_string(),
            app_log_trace: false,
        };
        CfClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_apply_manifest_returns_job() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/spaces/space-1/actions/apply_manifest"))
            .and(header("content-type", "application/x-yaml"))
            .and(body_string_contains("applications:"))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("Location", "https://api.example.com/v3/jobs/job-1"),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let job = client
            .apply_manifest("space-1", "applications:\n- name: web\n")
            .await
            .unwrap();
        assert_eq!(job.guid, "job-1");
    }

    #[tokio::test]
    async fn test_update_env_sends_nulls() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/v3/apps/app-1/environment_variables"))
            .and(body_string_contains("\"GONE\":null"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "var": { "KEPT": "v" }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let mut vars = BTreeMap::new();
        vars.insert("GONE".to_string(), None);
        vars.insert("KEPT".to_string(), Some("v".to_string()));
        client.update_env("app-1", vars).await.unwrap();
    }

    #[tokio::test]
    async fn test_ssh_feature_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/v3/apps/app-1/features/ssh"))
            .and(body_string_contains("\"enabled\":false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "ssh", "enabled": false
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/apps/app-1/features/ssh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "ssh", "enabled": false
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        client.set_ssh_enabled("app-1", false).await.unwrap();
        assert!(!client.ssh_enabled("app-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_build_poll_reaches_staged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/builds/build-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "guid": "build-1",
                "state": "STAGED",
                "droplet": { "guid": "droplet-1" }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let droplet = client
            .poll_build_staged("build-1", Duration::from_secs(5), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(droplet, "droplet-1");
    }
}
