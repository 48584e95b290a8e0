//! MTA deploy-service client
//!
//! Multi-target application deployments run against the deploy service on
//! the system domain, not the v3 API. Its asynchronous unit is an
//! *operation*: a process with phases {RUNNING, FINISHED, ERROR, ABORTED}
//! and a per-action message breakdown, polled on its own endpoint rather
//! than `/v3/jobs`.

use serde::Deserialize;
use serde_json::json;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};
use url::Url;

use crate::cancel::CancelToken;
use crate::client::CfClient;
use crate::error::{ClientError, Result};

/// Identity read out of an `.mtar` before upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtaDescriptor {
    pub id: String,
    pub version: String,
}

/// Read `META-INF/mtad.yaml` out of the archive (mtar files are
/// zip-packaged) to learn the MTA identifier without deploying.
pub fn inspect_archive(path: &Path) -> Result<MtaDescriptor> {
    #[derive(Deserialize)]
    struct Mtad {
        #[serde(rename = "ID")]
        id: String,
        #[serde(default)]
        version: Option<String>,
    }

    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| ClientError::Archive {
        message: format!("{} is not a readable archive: {}", path.display(), e),
    })?;
    let mut entry = archive
        .by_name("META-INF/mtad.yaml")
        .map_err(|_| ClientError::Archive {
            message: format!("{} carries no META-INF/mtad.yaml", path.display()),
        })?;
    let mut content = String::new();
    entry.read_to_string(&mut content)?;

    let mtad: Mtad = serde_yaml::from_str(&content).map_err(|e| ClientError::Archive {
        message: format!("invalid mtad.yaml in {}: {}", path.display(), e),
    })?;
    Ok(MtaDescriptor {
        id: mtad.id,
        version: mtad.version.unwrap_or_else(|| "0.0.0".to_string()),
    })
}

/// Deploy strategy selector; the two variants route to different
/// operation process types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MtaStrategy {
    #[default]
    Deploy,
    BlueGreenDeploy,
}

impl MtaStrategy {
    pub fn process_type(self) -> &'static str {
        match self {
            MtaStrategy::Deploy => "DEPLOY",
            MtaStrategy::BlueGreenDeploy => "BLUE_GREEN_DEPLOY",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "deploy" => Some(MtaStrategy::Deploy),
            "blue-green-deploy" => Some(MtaStrategy::BlueGreenDeploy),
            _ => None,
        }
    }
}

/// A file accepted by the deploy service
#[derive(Debug, Clone, Deserialize)]
pub struct FileRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// One deploy operation
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(default)]
    pub process_id: String,
    #[serde(default)]
    pub process_type: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub messages: Vec<OperationMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMessage {
    #[serde(default)]
    pub text: String,
    #[serde(default, rename = "type")]
    pub message_type: String,
}

/// A deployed MTA as the deploy service reports it
#[derive(Debug, Clone, Deserialize)]
pub struct Mta {
    pub metadata: MtaMetadata,
    #[serde(default)]
    pub modules: Vec<MtaModule>,
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MtaMetadata {
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtaModule {
    #[serde(default)]
    pub module_name: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub uris: Vec<String>,
}

/// Parameters for one deploy submission
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    pub archive_id: String,
    pub ext_descriptor_ids: Vec<String>,
    pub namespace: Option<String>,
    pub version_rule: Option<String>,
    pub modules: Vec<String>,
}

/// Client over the deploy-service API root
pub struct MtaClient<'a> {
    cf: &'a CfClient,
    base: Url,
}

impl<'a> MtaClient<'a> {
    /// Derive the deploy-service URL from the session's API endpoint.
    pub fn new(cf: &'a CfClient) -> Result<Self> {
        let base = cf.sibling_url("deploy-service")?;
        Ok(Self { cf, base })
    }

    /// Explicit endpoint override (non-standard system domains).
    pub fn with_endpoint(cf: &'a CfClient, endpoint: &str) -> Result<Self> {
        Ok(Self {
            cf,
            base: Url::parse(endpoint)?,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    async fn error_from(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let detail = response.text().await.unwrap_or_default();
        ClientError::Api {
            status,
            errors: vec![crate::error::ApiErrorBody {
                code: 0,
                title: "DeployService".to_string(),
                detail,
            }],
        }
    }

    /// Upload an archive or extension descriptor.
    pub async fn upload_file(
        &self,
        space_guid: &str,
        path: &Path,
        namespace: Option<&str>,
    ) -> Result<FileRef> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "archive.mtar".to_string());
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(ClientError::Transport)?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let mut url = self.url(&format!("api/v1/spaces/{}/files", space_guid))?;
        if let Some(namespace) = namespace {
            url.query_pairs_mut().append_pair("namespace", namespace);
        }
        let token = self.cf.bearer_token().await?;
        let response = self
            .cf
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

    /// Submit a deploy operation; returns the operation (process) id.
    pub async fn start_deploy(
        &self,
        space_guid: &str,
        strategy: MtaStrategy,
        request: &DeployRequest,
    ) -> Result<String> {
        let mut parameters = json!({ "appArchiveId": request.archive_id });
        if !request.ext_descriptor_ids.is_empty() {
            parameters["mtaExtDescriptorId"] = json!(request.ext_descriptor_ids.join(","));
        }
        if let Some(rule) = &request.version_rule {
            parameters["versionRule"] = json!(rule);
        }
        if !request.modules.is_empty() {
            parameters["modulesForDeployment"] = json!(request.modules.join(","));
        }
        if strategy == MtaStrategy::BlueGreenDeploy {
            // Without this the operation pauses for manual confirmation
            // before switching routes.
            parameters["noConfirm"] = json!(true);
        }
        let mut body = json!({
            "processType": strategy.process_type(),
            "parameters": parameters,
        });
        if let Some(namespace) = &request.namespace {
            body["namespace"] = json!(namespace);
        }

        let url = self.url(&format!("api/v1/spaces/{}/operations", space_guid))?;
        let token = self.cf.bearer_token().await?;
        let response = self
            .cf
            .http_client()
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }

        if let Some(id) = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|location| location.trim_end_matches('/').rsplit('/').next())
            .filter(|id| !id.is_empty())
        {
            return Ok(id.to_string());
        }
        let operation: Operation = response.json().await?;
        if operation.process_id.is_empty() {
            return Err(ClientError::UnexpectedResponse {
                message: "deploy submission returned no operation id".to_string(),
            });
        }
        Ok(operation.process_id)
    }

    /// Submit an undeploy operation for a deployed MTA.
    pub async fn start_undeploy(
        &self,
        space_guid: &str,
        mta_id: &str,
        namespace: Option<&str>,
        delete_services: bool,
    ) -> Result<String> {
        let mut body = json!({
            "processType": "UNDEPLOY",
            "parameters": {
                "mtaId": mta_id,
                "deleteServices": delete_services,
            },
        });
        if let Some(namespace) = namespace {
            body["namespace"] = json!(namespace);
        }
        let url = self.url(&format!("api/v1/spaces/{}/operations", space_guid))?;
        let token = self.cf.bearer_token().await?;
        let response = self
            .cf
            .http_client()
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }
        if let Some(id) = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|location| location.trim_end_matches('/').rsplit('/').next())
            .filter(|id| !id.is_empty())
        {
            return Ok(id.to_string());
        }
        let operation: Operation = response.json().await?;
        if operation.process_id.is_empty() {
            return Err(ClientError::UnexpectedResponse {
                message: "undeploy submission returned no operation id".to_string(),
            });
        }
        Ok(operation.process_id)
    }

    pub async fn get_operation(&self, space_guid: &str, operation_id: &str) -> Result<Operation> {
        let mut url = self.url(&format!(
            "api/v1/spaces/{}/operations/{}",
            space_guid, operation_id
        ))?;
        url.query_pairs_mut().append_pair("embed", "messages");
        let token = self.cf.bearer_token().await?;
        let response = self
            .cf
            .http_client()
            .get(url)
            .bearer_auth(token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }
        Ok(response.json().await?)
    }

    /// Drive an operation to a terminal phase under a deadline.
    pub async fn poll_operation(
        &self,
        space_guid: &str,
        operation_id: &str,
        deadline: Duration,
        interval: Duration,
        cancel: &CancelToken,
    ) -> Result<Operation> {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            let operation = tokio::select! {
                result = self.get_operation(space_guid, operation_id) => result?,
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            };
            match operation.state.as_str() {
                "FINISHED" => return Ok(operation),
                "ERROR" | "ABORTED" => {
                    let detail = operation
                        .messages
                        .iter()
                        .filter(|m| m.message_type == "ERROR")
                        .map(|m| m.text.clone())
                        .collect::<Vec<_>>()
                        .join("; ");
                    return Err(ClientError::OperationFailed {
                        operation_id: operation_id.to_string(),
                        phase: operation.state,
                        detail,
                    });
                }
                // RUNNING and action-required intermediate states keep going
                _ => {}
            }
            if started.elapsed() >= deadline {
                return Err(ClientError::JobTimeout {
                    phase: operation.state,
                    waited_secs: deadline.as_secs(),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            }
        }
    }

    /// List the MTAs deployed in a space, optionally namespace-filtered.
    pub async fn deployed_mtas(
        &self,
        space_guid: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<Mta>> {
        let mut url = self.url(&format!("api/v1/spaces/{}/mtas", space_guid))?;
        if let Some(namespace) = namespace {
            url.query_pairs_mut().append_pair("namespace", namespace);
        }
        let token = self.cf.bearer_token().await?;
        let response = self
            .cf
            .http_client()
            .get(url)
            .bearer_auth(token)
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }
        Ok(response.json().await?)
    }

    /// Fetch one deployed MTA by id.
    pub async fn get_mta(
        &self,
        space_guid: &str,
        mta_id: &str,
        namespace: Option<&str>,
    ) -> Result<Mta> {
        let mut url = self.url(&format!("api/v1/spaces/{}/mtas/{}", space_guid, mta_id))?;
        if let Some(namespace) = namespace {
            url.query_pairs_mut().append_pair("namespace", namespace);
        }
        let token = self.cf.bearer_token().await?;
        let response = self
            .cf
            .http_client()
            .get(url)
            .bearer_auth(token)
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Err(ClientError::NotFound {
                kind: "mta".to_string(),
                query: format!("id={}", mta_id),
            });
        }
        if !response.status().is_success() {
            return Err(self.error_from(response).await);
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthScheme, ClientConfig};
    use std::io::Write;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn write_mtar(id: &str, version: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut archive = zip::ZipWriter::new(file.reopen().unwrap());
        archive
            .start_file::<_, ()>(
                "META-INF/mtad.yaml",
                zip::write::FileOptions::default(),
            )
            .unwrap();
        write!(
            archive,
            "_schema-version: '3.1'\nID: {}\nversion: {}\n",
            id, version
        )
        .unwrap();
        archive.finish().unwrap();
        file
    }

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

    #[test]
    fn test_inspect_archive_reads_id() {
        let file = write_mtar("my-mta", "1.2.0");
        let descriptor = inspect_archive(file.path()).unwrap();
        assert_eq!(descriptor.id, "my-mta");
        assert_eq!(descriptor.version, "1.2.0");
    }

    #[test]
    fn test_inspect_archive_without_descriptor() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut archive = zip::ZipWriter::new(file.reopen().unwrap());
        archive
            .start_file::<_, ()>("other.txt", zip::write::FileOptions::default())
            .unwrap();
        archive.write_all(b"hello").unwrap();
        archive.finish().unwrap();

        let err = inspect_archive(file.path()).unwrap_err();
        assert!(matches!(err, ClientError::Archive { .. }));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(MtaStrategy::parse("deploy"), Some(MtaStrategy::Deploy));
        assert_eq!(
            MtaStrategy::parse("blue-green-deploy"),
            Some(MtaStrategy::BlueGreenDeploy)
        );
        assert_eq!(MtaStrategy::parse("canary"), None);
        assert_eq!(MtaStrategy::BlueGreenDeploy.process_type(), "BLUE_GREEN_DEPLOY");
    }

    #[tokio::test]
    async fn test_poll_operation_error_collects_messages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/spaces/s-1/operations/op-1"))
            .and(query_param("embed", "messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "processId": "op-1",
                "processType": "DEPLOY",
                "state": "ERROR",
                "messages": [
                    {"text": "Service broker refused", "type": "ERROR"},
                    {"text": "Uploading...", "type": "INFO"}
                ]
            })))
            .mount(&server)
            .await;

        let cf = client_for(&server).await;
        let mta = MtaClient::with_endpoint(&cf, &server.uri()).unwrap();
        let err = mta
            .poll_operation(
                "s-1",
                "op-1",
                Duration::from_secs(5),
                Duration::from_millis(10),
                &CancelToken::never(),
            )
            .await
            .unwrap_err();
        match err {
            ClientError::OperationFailed { phase, detail, .. } => {
                assert_eq!(phase, "ERROR");
                assert!(detail.contains("Service broker refused"));
                assert!(!detail.contains("Uploading"));
            }
            other => panic!("expected OperationFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deployed_mtas_namespace_filter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/spaces/s-1/mtas"))
            .and(query_param("namespace", "test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"metadata": {"id": "a.cf.app", "version": "1.0.0", "namespace": "test"},
                 "modules": [], "services": []}
            ])))
            .mount(&server)
            .await;

        let cf = client_for(&server).await;
        let mta = MtaClient::with_endpoint(&cf, &server.uri()).unwrap();
        let mtas = mta.deployed_mtas("s-1", Some("test")).await.unwrap();
        assert_eq!(mtas.len(), 1);
        assert_eq!(mtas[0].metadata.id, "a.cf.app");
    }
}
