//! Authenticated Cloud Foundry v3 API client
//!
//! One `CfClient` per session, shared across reconciler tasks. The token
//! cache behind the RwLock is the only shared mutable state in the whole
//! provider; reconcilers treat it opaquely.

use chrono::{DateTime, Duration, Utc};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

use crate::config::{AuthScheme, ClientConfig};
use crate::error::{ApiErrorBody, ClientError, Result};

/// Reference to an asynchronous platform job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub guid: String,
}

impl JobRef {
    /// Parse a `Location: .../v3/jobs/<guid>` header value
    pub fn from_location(location: &str) -> Option<Self> {
        let guid = location.rsplit("/v3/jobs/").next()?;
        if guid.is_empty() || guid.contains('/') {
            return None;
        }
        Some(Self {
            guid: guid.to_string(),
        })
    }
}

/// Outcome of a create/delete on a collection: some endpoints return the
/// resource body, others a job to poll.
#[derive(Debug)]
pub enum Created<T> {
    Resource(T),
    Job(JobRef),
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn usable(&self) -> bool {
        // Refresh one minute early so a token never expires mid-request.
        Utc::now() + Duration::seconds(60) < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expiry")]
    expires_in: i64,
}

fn default_expiry() -> i64 {
    600
}

#[derive(Debug, Deserialize)]
struct RootLinks {
    links: RootLinkMap,
}

#[derive(Debug, Deserialize)]
struct RootLinkMap {
    login: Option<HrefLink>,
    uaa: Option<HrefLink>,
}

#[derive(Debug, Deserialize)]
struct HrefLink {
    href: String,
}

/// Paginated list envelope
#[derive(Debug, Deserialize)]
pub struct ListResponse<T> {
    pub pagination: Pagination,
    pub resources: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub total_results: u64,
    #[serde(default)]
    pub next: Option<PageLink>,
}

#[derive(Debug, Deserialize)]
pub struct PageLink {
    pub href: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<ApiErrorBody>,
}

/// The authenticated client façade
pub struct CfClient {
    http: reqwest::Client,
    api_url: Url,
    auth: AuthScheme,
    login_url: RwLock<Option<Url>>,
    token: RwLock<Option<CachedToken>>,
    user_agent: String,
}

impl CfClient {
    /// Build from resolved configuration. The 10-minute request timeout
    /// accommodates large archive uploads.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .user_agent(config.user_agent.clone());
        if config.skip_ssl_validation {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build()?;

        // Pre-seed the cache when the user supplied a token directly.
        let token = match &config.auth {
            AuthScheme::Token {
                access_token,
                refresh_token,
            } => {
                // Without a refresh token there is nothing to rotate to;
                // keep using the supplied token and let the platform
                // reject it when it really expires.
                let expires_at = if refresh_token.is_some() {
                    Utc::now() + Duration::minutes(10)
                } else {
                    Utc::now() + Duration::weeks(52)
                };
                Some(CachedToken {
                    access_token: access_token.clone(),
                    refresh_token: refresh_token.clone(),
                    expires_at,
                })
            }
            _ => None,
        };

        Ok(Self {
            http,
            api_url: config.api_url.clone(),
            auth: config.auth.clone(),
            login_url: RwLock::new(None),
            token: RwLock::new(token),
            user_agent: config.user_agent.clone(),
        })
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Derive a sibling system-domain URL, e.g. `api.cf.example.com` ->
    /// `deploy-service.cf.example.com`. Used by the log-cache and MTA
    /// deploy-service clients.
    pub fn sibling_url(&self, service: &str) -> Result<Url> {
        let host = self
            .api_url
            .host_str()
            .ok_or_else(|| ClientError::UnexpectedResponse {
                message: "api_url has no host".to_string(),
            })?;
        let sibling_host = match host.split_once('.') {
            Some(("api", domain)) => format!("{}.{}", service, domain),
            _ => format!("{}.{}", service, host),
        };
        let mut url = self.api_url.clone();
        url.set_host(Some(&sibling_host))?;
        url.set_path("");
        Ok(url)
    }

    async fn login_url(&self) -> Result<Url> {
        if let Some(url) = self.login_url.read().await.clone() {
            return Ok(url);
        }
        let root: RootLinks = {
            let response = self
                .http
                .get(self.api_url.clone())
                .send()
                .await?
                .error_for_status()
                .map_err(ClientError::Transport)?;
            response.json().await?
        };
        let href = root
            .links
            .uaa
            .or(root.links.login)
            .map(|l| l.href)
            .ok_or_else(|| ClientError::Auth {
                message: "platform root advertises no UAA endpoint".to_string(),
            })?;
        let url = Url::parse(&href)?;
        *self.login_url.write().await = Some(url.clone());
        Ok(url)
    }

    async fn grant(&self, params: &[(&str, &str)]) -> Result<CachedToken> {
        let mut token_url = self.login_url().await?;
        token_url.set_path("/oauth/token");
        let response = self
            .http
            .post(token_url)
            .basic_auth("cf", Some(""))
            .form(params)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Auth {
                message: format!("token grant rejected (status {}): {}", status, body),
            });
        }
        let token: TokenResponse = response.json().await?;
        Ok(CachedToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }

    /// `refresh` carries the cached refresh token; the caller holds the
    /// token lock, so this must not touch `self.token` itself.
    async fn acquire_token(&self, refresh: Option<String>) -> Result<CachedToken> {
        match &self.auth {
            AuthScheme::UserPassword {
                user,
                password,
                origin,
            } => {
                let mut params = vec![
                    ("grant_type", "password"),
                    ("username", user.as_str()),
                    ("password", password.as_str()),
                ];
                if let Some(origin) = origin {
                    params.push(("login_hint", origin.as_str()));
                }
                self.grant(&params).await
            }
            AuthScheme::ClientCredentials {
                client_id,
                client_secret,
            } => {
                self.grant(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                ])
                .await
            }
            AuthScheme::Assertion { assertion_token } => {
                self.grant(&[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    ("assertion", assertion_token.as_str()),
                ])
                .await
            }
            AuthScheme::Token { .. } => {
                // Seeded at construction; reaching here means the access
                // token expired and we must refresh.
                match refresh {
                    Some(refresh_token) => {
                        self.grant(&[
                            ("grant_type", "refresh_token"),
                            ("refresh_token", refresh_token.as_str()),
                        ])
                        .await
                    }
                    None => Err(ClientError::Auth {
                        message: "access token expired and no refresh token is configured"
                            .to_string(),
                    }),
                }
            }
        }
    }

    async fn bearer(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.usable() {
                return Ok(token.access_token.clone());
            }
        }
        let mut slot = self.token.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(token) = slot.as_ref() {
            if token.usable() {
                return Ok(token.access_token.clone());
            }
        }
        let refresh = slot.as_ref().and_then(|t| t.refresh_token.clone());
        let fresh = self.acquire_token(refresh).await?;
        let access = fresh.access_token.clone();
        *slot = Some(fresh);
        Ok(access)
    }

    pub(crate) fn url(&self, path: &str) -> Result<Url> {
        Ok(self.api_url.join(path)?)
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) async fn bearer_token(&self) -> Result<String> {
        self.bearer().await
    }

    pub(crate) async fn send(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let token = self.bearer().await?;
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        tracing::debug!(%status, url = %response.url(), "platform round trip");
        if status.is_success() || status.is_redirection() {
            return Ok(response);
        }
        let envelope: ErrorEnvelope = response.json().await.unwrap_or(ErrorEnvelope {
            errors: Vec::new(),
        });
        Err(ClientError::Api {
            status: status.as_u16(),
            errors: envelope.errors,
        })
    }

    /// GET a typed payload
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self
            .send(Method::GET, self.url(path)?, query, None)
            .await?;
        Ok(response.json().await?)
    }

    /// POST a body; returns either the created resource or a job ref
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<Created<T>> {
        let body = serde_json::to_value(body)?;
        let response = self
            .send(Method::POST, self.url(path)?, &[], Some(&body))
            .await?;
        self.resource_or_job(response).await
    }

    /// PATCH a body, expecting the updated resource back
    pub async fn patch_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T> {
        let body = serde_json::to_value(body)?;
        let response = self
            .send(Method::PATCH, self.url(path)?, &[], Some(&body))
            .await?;
        Ok(response.json().await?)
    }

    /// PATCH that may answer asynchronously (202 with a job location)
    pub async fn patch_maybe_job<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<Created<T>> {
        let body = serde_json::to_value(body)?;
        let response = self
            .send(Method::PATCH, self.url(path)?, &[], Some(&body))
            .await?;
        self.resource_or_job(response).await
    }

    /// DELETE; asynchronous endpoints answer 202 with a job location
    pub async fn delete(&self, path: &str) -> Result<Option<JobRef>> {
        let response = self
            .send(Method::DELETE, self.url(path)?, &[], None)
            .await?;
        Ok(self.job_from_response(&response))
    }

    pub(crate) async fn resource_or_job<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<Created<T>> {
        if response.status() == StatusCode::ACCEPTED {
            if let Some(job) = self.job_from_response(&response) {
                return Ok(Created::Job(job));
            }
        }
        Ok(Created::Resource(response.json().await?))
    }

    pub(crate) fn job_from_response(&self, response: &reqwest::Response) -> Option<JobRef> {
        response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(JobRef::from_location)
    }

    /// Follow pagination until exhausted
    pub async fn list_all<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>> {
        let mut page: ListResponse<T> = self.get_json(path, query).await?;
        let mut resources = std::mem::take(&mut page.resources);
        let mut next = page.pagination.next;
        while let Some(link) = next {
            let url = Url::parse(&link.href)?;
            let response = self.send(Method::GET, url, &[], None).await?;
            let mut page: ListResponse<T> = response.json().await?;
            resources.append(&mut page.resources);
            next = page.pagination.next;
        }
        Ok(resources)
    }

    /// Typed collection rooted at a v3 path
    pub fn collection<T: DeserializeOwned>(&self, kind: &'static str, base: &'static str) -> Collection<'_, T> {
        Collection {
            client: self,
            kind,
            base,
            _marker: std::marker::PhantomData,
        }
    }
}

/// Per-resource verbs over one v3 collection endpoint
pub struct Collection<'a, T> {
    client: &'a CfClient,
    kind: &'static str,
    base: &'static str,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T: DeserializeOwned> Collection<'a, T> {
    fn item_path(&self, guid: &str) -> String {
        format!("{}/{}", self.base, guid)
    }

    /// Fetch by identifier
    pub async fn get(&self, guid: &str) -> Result<T> {
        self.client.get_json(&self.item_path(guid), &[]).await
    }

    /// List every match for a filter query
    pub async fn list(&self, query: &[(&str, &str)]) -> Result<Vec<T>> {
        self.client.list_all(self.base, query).await
    }

    /// Expect exactly one match for a filter query
    pub async fn single(&self, query: &[(&str, &str)]) -> Result<T> {
        let describe = || {
            query
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("&")
        };
        let mut matches = self.list(query).await?;
        match matches.len() {
            0 => Err(ClientError::NotFound {
                kind: self.kind.to_string(),
                query: describe(),
            }),
            1 => Ok(matches.remove(0)),
            count => Err(ClientError::NotUnique {
                kind: self.kind.to_string(),
                query: describe(),
                count,
            }),
        }
    }

    pub async fn create(&self, body: &impl Serialize) -> Result<Created<T>> {
        self.client.post_json(self.base, body).await
    }

    pub async fn update(&self, guid: &str, body: &impl Serialize) -> Result<T> {
        self.client.patch_json(&self.item_path(guid), body).await
    }

    pub async fn delete(&self, guid: &str) -> Result<Option<JobRef>> {
        self.client.delete(&self.item_path(guid)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthScheme, ClientConfig};
    use crate::types::Organization;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> CfClient {
        let config = ClientConfig {
            api_url: Url::parse(&server.uri()).unwrap(),
            auth: AuthScheme::Token {
                access_token: "test-token".to_string(),
                refresh_token: None,
            },
            skip_ssl_validation: false,
            user_agent: "Terraform/1.9.0 cloudfoundry/0.3.0".to_string(),
            app_log_trace: false,
        };
        CfClient::new(&config).unwrap()
    }

    #[test]
    fn test_job_ref_from_location() {
        let job = JobRef::from_location("https://api.example.com/v3/jobs/abc-123").unwrap();
        assert_eq!(job.guid, "abc-123");
        assert!(JobRef::from_location("https://api.example.com/v3/spaces/abc").is_none());
    }

    #[test]
    fn test_sibling_url_swaps_api_prefix() {
        let config = ClientConfig {
            api_url: Url::parse("https://api.cf.example.com").unwrap(),
            auth: AuthScheme::Token {
                access_token: "t".to_string(),
                refresh_token: None,
            },
            skip_ssl_validation: false,
            user_agent: "ua".to_string(),
            app_log_trace: false,
        };
        let client = CfClient::new(&config).unwrap();
        let deploy = client.sibling_url("deploy-service").unwrap();
        assert_eq!(deploy.host_str(), Some("deploy-service.cf.example.com"));
    }

    #[tokio::test]
    async fn test_get_sends_bearer_and_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/organizations/org-1"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "guid": "org-1",
                "name": "production",
                "suspended": false,
                "created_at": "2026-01-01T00:00:00Z",
                "updated_at": "2026-01-01T00:00:00Z"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let org: Organization = client
            .collection("organization", "/v3/organizations")
            .get("org-1")
            .await
            .unwrap();
        assert_eq!(org.name, "production");
    }

    #[tokio::test]
    async fn test_api_error_payload_is_preserved() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/organizations/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "errors": [{"code": 10010, "title": "CF-ResourceNotFound", "detail": "Org not found"}]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .collection::<Organization>("organization", "/v3/organizations")
            .get("missing")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        match err {
            ClientError::Api { status, errors } => {
                assert_eq!(status, 404);
                assert_eq!(errors[0].title, "CF-ResourceNotFound");
            }
            other => panic!("expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pagination_is_followed() {
        let server = MockServer::start().await;
        let page2 = format!("{}/v3/organizations?page=2", server.uri());
        Mock::given(method("GET"))
            .and(path("/v3/organizations"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "pagination": { "total_results": 2, "next": null },
                "resources": [{
                    "guid": "org-2", "name": "two", "suspended": false,
                    "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/organizations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "pagination": { "total_results": 2, "next": { "href": page2 } },
                "resources": [{
                    "guid": "org-1", "name": "one", "suspended": false,
                    "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"
                }]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let orgs: Vec<Organization> = client
            .collection("organization", "/v3/organizations")
            .list(&[])
            .await
            .unwrap();
        assert_eq!(orgs.len(), 2);
        assert_eq!(orgs[1].name, "two");
    }

    #[tokio::test]
    async fn test_delete_returns_job_ref() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v3/organizations/org-1"))
            .respond_with(
                ResponseTemplate::new(202)
                    .insert_header("Location", "https://api.example.com/v3/jobs/job-9"),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let job = client
            .collection::<Organization>("organization", "/v3/organizations")
            .delete("org-1")
            .await
            .unwrap();
        assert_eq!(job.unwrap().guid, "job-9");
    }

    #[tokio::test]
    async fn test_single_rejects_ambiguity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/organizations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "pagination": { "total_results": 2, "next": null },
                "resources": [
                    {"guid": "a", "name": "dup", "suspended": false,
                     "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"},
                    {"guid": "b", "name": "dup", "suspended": false,
                     "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"}
                ]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client
            .collection::<Organization>("organization", "/v3/organizations")
            .single(&[("names", "dup")])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotUnique { count: 2, .. }));
    }
}
