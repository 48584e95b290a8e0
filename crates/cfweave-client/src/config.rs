//! Client configuration and credential resolution
//!
//! Precedence, lowest to highest: home-directory credential file
//! (`~/.cf/config.json`) < environment variables < explicit attributes.
//! Exactly one auth scheme is admissible per session; half-set pairs and
//! doubly-set schemes each produce a specific error naming the offending
//! attribute so the host can point at the user's configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Environment variables recognized by the provider
pub const ENV_API_URL: &str = "CF_API_URL";
pub const ENV_USER: &str = "CF_USER";
pub const ENV_PASSWORD: &str = "CF_PASSWORD";
pub const ENV_CLIENT_ID: &str = "CF_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "CF_CLIENT_SECRET";
pub const ENV_ORIGIN: &str = "CF_ORIGIN";
pub const ENV_ACCESS_TOKEN: &str = "CF_ACCESS_TOKEN";
pub const ENV_REFRESH_TOKEN: &str = "CF_REFRESH_TOKEN";
pub const ENV_ASSERTION_TOKEN: &str = "CF_ASSERTION_TOKEN";
pub const ENV_SKIP_SSL_VALIDATION: &str = "CF_SKIP_SSL_VALIDATION";
pub const ENV_APPEND_USER_AGENT: &str = "CF_APPEND_USER_AGENT";
pub const ENV_APP_LOG_TRACE: &str = "ENABLE_CF_APP_LOG_TRACE";

/// Configuration errors, attribute-pathed for the configure phase
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("api_url must be set when any credential attribute is configured")]
    MissingEndpoint,

    #[error("invalid api_url '{value}': {message}")]
    InvalidEndpoint { value: String, message: String },

    #[error("'{present}' is set but '{missing}' is not; both are required together")]
    HalfSetPair { present: String, missing: String },

    #[error("'{first}' and '{second}' are mutually exclusive auth schemes")]
    ConflictingSchemes { first: String, second: String },

    #[error("invalid boolean '{value}' in {attribute}")]
    InvalidBool { attribute: String, value: String },

    #[error("no credentials configured and no usable {path} found")]
    NoCredentials { path: String },

    #[error("failed to read credential file {path}: {message}")]
    CredentialFile { path: String, message: String },
}

/// The admissible auth schemes, exactly one per session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    UserPassword {
        user: String,
        password: String,
        origin: Option<String>,
    },
    ClientCredentials {
        client_id: String,
        client_secret: String,
    },
    Token {
        access_token: String,
        refresh_token: Option<String>,
    },
    Assertion {
        assertion_token: String,
    },
}

impl AuthScheme {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthScheme::UserPassword { .. } => "user_password",
            AuthScheme::ClientCredentials { .. } => "client_credentials",
            AuthScheme::Token { .. } => "token",
            AuthScheme::Assertion { .. } => "assertion",
        }
    }
}

/// Raw, unvalidated attributes as the host hands them over
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawConfig {
    pub api_url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub origin: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub assertion_token: Option<String>,
    pub skip_ssl_validation: Option<bool>,
    pub append_user_agent: Option<String>,
    pub app_log_trace: Option<bool>,
}

impl RawConfig {
    /// Read the `CF_*` environment. Invalid booleans are configuration
    /// errors, not silently-false.
    pub fn from_env() -> Result<Self, ConfigError> {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }
        let skip_ssl_validation = match var(ENV_SKIP_SSL_VALIDATION) {
            Some(raw) => Some(parse_bool(ENV_SKIP_SSL_VALIDATION, &raw)?),
            None => None,
        };
        let app_log_trace = match var(ENV_APP_LOG_TRACE) {
            Some(raw) => Some(parse_bool(ENV_APP_LOG_TRACE, &raw)?),
            None => None,
        };
        Ok(Self {
            api_url: var(ENV_API_URL),
            user: var(ENV_USER),
            password: var(ENV_PASSWORD),
            client_id: var(ENV_CLIENT_ID),
            client_secret: var(ENV_CLIENT_SECRET),
            origin: var(ENV_ORIGIN),
            access_token: var(ENV_ACCESS_TOKEN),
            refresh_token: var(ENV_REFRESH_TOKEN),
            assertion_token: var(ENV_ASSERTION_TOKEN),
            skip_ssl_validation,
            append_user_agent: var(ENV_APPEND_USER_AGENT),
            app_log_trace,
        })
    }

    /// Layer `self` over `fallback`: any attribute set here wins.
    pub fn over(self, fallback: RawConfig) -> RawConfig {
        RawConfig {
            api_url: self.api_url.or(fallback.api_url),
            user: self.user.or(fallback.user),
            password: self.password.or(fallback.password),
            client_id: self.client_id.or(fallback.client_id),
            client_secret: self.client_secret.or(fallback.client_secret),
            origin: self.origin.or(fallback.origin),
            access_token: self.access_token.or(fallback.access_token),
            refresh_token: self.refresh_token.or(fallback.refresh_token),
            assertion_token: self.assertion_token.or(fallback.assertion_token),
            skip_ssl_validation: self.skip_ssl_validation.or(fallback.skip_ssl_validation),
            append_user_agent: self.append_user_agent.or(fallback.append_user_agent),
            app_log_trace: self.app_log_trace.or(fallback.app_log_trace),
        }
    }

    fn any_credential_set(&self) -> bool {
        self.user.is_some()
            || self.password.is_some()
            || self.client_id.is_some()
            || self.client_secret.is_some()
            || self.access_token.is_some()
            || self.refresh_token.is_some()
            || self.assertion_token.is_some()
    }
}

fn parse_bool(attribute: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            attribute: attribute.to_string(),
            value: raw.to_string(),
        }),
    }
}

/// The CF CLI's home-directory credential file, read-only
#[derive(Debug, Clone, Default, Deserialize)]
struct HomeFile {
    #[serde(rename = "Target")]
    target: Option<String>,
    #[serde(rename = "AccessToken")]
    access_token: Option<String>,
    #[serde(rename = "RefreshToken")]
    refresh_token: Option<String>,
    #[serde(rename = "SSLDisabled")]
    ssl_disabled: Option<bool>,
}

fn default_home_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cf").join("config.json"))
}

fn read_home_file(path: &Path) -> Result<Option<RawConfig>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::CredentialFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    let file: HomeFile =
        serde_json::from_str(&content).map_err(|e| ConfigError::CredentialFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    // The CLI stores the token as "bearer <jwt>".
    let access_token = file.access_token.map(|t| {
        t.strip_prefix("bearer ")
            .map(str::to_string)
            .unwrap_or(t)
    });
    Ok(Some(RawConfig {
        api_url: file.target,
        access_token,
        refresh_token: file.refresh_token,
        skip_ssl_validation: file.ssl_disabled,
        ..RawConfig::default()
    }))
}

/// Fully resolved, validated configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: Url,
    pub auth: AuthScheme,
    pub skip_ssl_validation: bool,
    pub user_agent: String,
    pub app_log_trace: bool,
}

impl ClientConfig {
    /// Resolve the precedence chain and validate the auth-scheme rules.
    ///
    /// `explicit` comes from the provider schema attributes; the
    /// environment and the home file are consulted here. `host_version`
    /// and `provider_version` feed the user-agent string.
    pub fn resolve(
        explicit: RawConfig,
        host_version: &str,
        provider_version: &str,
    ) -> Result<Self, ConfigError> {
        let env = RawConfig::from_env()?;
        Self::resolve_with(explicit, env, default_home_file().as_deref(), host_version, provider_version)
    }

    /// Same as `resolve` but with injectable environment and home-file
    /// layers, so the chain is testable without process-global state.
    pub fn resolve_with(
        explicit: RawConfig,
        env: RawConfig,
        home_file: Option<&Path>,
        host_version: &str,
        provider_version: &str,
    ) -> Result<Self, ConfigError> {
        let configured = explicit.over(env);

        let merged = if configured.any_credential_set() || configured.api_url.is_some() {
            // Explicit or environment credentials in play: the home file
            // only ever fills gaps it is allowed to (endpoint, ssl flag),
            // never mixes its tokens into another scheme.
            if configured.any_credential_set() && configured.api_url.is_none() {
                return Err(ConfigError::MissingEndpoint);
            }
            configured
        } else {
            let path = home_file.ok_or_else(|| ConfigError::NoCredentials {
                path: "~/.cf/config.json".to_string(),
            })?;
            read_home_file(path)?.ok_or_else(|| ConfigError::NoCredentials {
                path: path.display().to_string(),
            })?
        };

        let auth = validate_scheme(&merged)?;

        let api_url_raw = merged.api_url.ok_or(ConfigError::MissingEndpoint)?;
        let api_url = Url::parse(&api_url_raw).map_err(|e| ConfigError::InvalidEndpoint {
            value: api_url_raw.clone(),
            message: e.to_string(),
        })?;

        let mut user_agent = format!(
            "Terraform/{} cloudfoundry/{}",
            host_version, provider_version
        );
        if let Some(suffix) = &merged.append_user_agent {
            user_agent.push(' ');
            user_agent.push_str(suffix);
        }

        Ok(ClientConfig {
            api_url,
            auth,
            skip_ssl_validation: merged.skip_ssl_validation.unwrap_or(false),
            user_agent,
            app_log_trace: merged.app_log_trace.unwrap_or(false),
        })
    }
}

/// Enforce the XOR rule across the four schemes and pair completeness.
fn validate_scheme(config: &RawConfig) -> Result<AuthScheme, ConfigError> {
    // Pair completeness first, so "user without password" beats the
    // cross-scheme message.
    match (&config.user, &config.password) {
        (Some(_), None) => {
            return Err(ConfigError::HalfSetPair {
                present: "user".to_string(),
                missing: "password".to_string(),
            })
        }
        (None, Some(_)) => {
            return Err(ConfigError::HalfSetPair {
                present: "password".to_string(),
                missing: "user".to_string(),
            })
        }
        _ => {}
    }
    match (&config.client_id, &config.client_secret) {
        (Some(_), None) => {
            return Err(ConfigError::HalfSetPair {
                present: "cf_client_id".to_string(),
                missing: "cf_client_secret".to_string(),
            })
        }
        (None, Some(_)) => {
            return Err(ConfigError::HalfSetPair {
                present: "cf_client_secret".to_string(),
                missing: "cf_client_id".to_string(),
            })
        }
        _ => {}
    }
    if config.refresh_token.is_some() && config.access_token.is_none() {
        return Err(ConfigError::HalfSetPair {
            present: "refresh_token".to_string(),
            missing: "access_token".to_string(),
        });
    }

    let mut schemes: Vec<(&'static str, AuthScheme)> = Vec::new();
    if let (Some(user), Some(password)) = (&config.user, &config.password) {
        schemes.push((
            "user",
            AuthScheme::UserPassword {
                user: user.clone(),
                password: password.clone(),
                origin: config.origin.clone(),
            },
        ));
    }
    if let (Some(id), Some(secret)) = (&config.client_id, &config.client_secret) {
        schemes.push((
            "cf_client_id",
            AuthScheme::ClientCredentials {
                client_id: id.clone(),
                client_secret: secret.clone(),
            },
        ));
    }
    if let Some(token) = &config.access_token {
        schemes.push((
            "access_token",
            AuthScheme::Token {
                access_token: token.clone(),
                refresh_token: config.refresh_token.clone(),
            },
        ));
    }
    if let Some(token) = &config.assertion_token {
        schemes.push((
            "assertion_token",
            AuthScheme::Assertion {
                assertion_token: token.clone(),
            },
        ));
    }

    match schemes.len() {
        0 => Err(ConfigError::NoCredentials {
            path: "~/.cf/config.json".to_string(),
        }),
        1 => Ok(schemes.remove(0).1),
        _ => Err(ConfigError::ConflictingSchemes {
            first: schemes[0].0.to_string(),
            second: schemes[1].0.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HOST: &str = "1.9.0";
    const PROVIDER: &str = "0.3.0";

    fn resolve(explicit: RawConfig, env: RawConfig) -> Result<ClientConfig, ConfigError> {
        ClientConfig::resolve_with(explicit, env, None, HOST, PROVIDER)
    }

    #[test]
    fn test_user_password_scheme() {
        let config = resolve(
            RawConfig {
                api_url: Some("https://api.cf.example.com".to_string()),
                user: Some("admin".to_string()),
                password: Some("s3cret".to_string()),
                ..RawConfig::default()
            },
            RawConfig::default(),
        )
        .unwrap();
        assert!(matches!(config.auth, AuthScheme::UserPassword { .. }));
        assert_eq!(
            config.user_agent,
            format!("Terraform/{} cloudfoundry/{}", HOST, PROVIDER)
        );
    }

    #[test]
    fn test_half_set_pair_names_missing_attribute() {
        let err = resolve(
            RawConfig {
                api_url: Some("https://api.cf.example.com".to_string()),
                user: Some("admin".to_string()),
                ..RawConfig::default()
            },
            RawConfig::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::HalfSetPair {
                present: "user".to_string(),
                missing: "password".to_string()
            }
        );
    }

    #[test]
    fn test_two_schemes_conflict() {
        let err = resolve(
            RawConfig {
                api_url: Some("https://api.cf.example.com".to_string()),
                user: Some("admin".to_string()),
                password: Some("pw".to_string()),
                access_token: Some("jwt".to_string()),
                ..RawConfig::default()
            },
            RawConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingSchemes { .. }));
    }

    #[test]
    fn test_credentials_without_endpoint() {
        let err = resolve(
            RawConfig {
                user: Some("admin".to_string()),
                password: Some("pw".to_string()),
                ..RawConfig::default()
            },
            RawConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::MissingEndpoint);
    }

    #[test]
    fn test_explicit_wins_over_env() {
        let config = resolve(
            RawConfig {
                api_url: Some("https://api.explicit.example.com".to_string()),
                access_token: Some("explicit-token".to_string()),
                ..RawConfig::default()
            },
            RawConfig {
                api_url: Some("https://api.env.example.com".to_string()),
                access_token: Some("env-token".to_string()),
                ..RawConfig::default()
            },
        )
        .unwrap();
        assert_eq!(config.api_url.as_str(), "https://api.explicit.example.com/");
        assert!(
            matches!(config.auth, AuthScheme::Token { access_token, .. } if access_token == "explicit-token")
        );
    }

    #[test]
    fn test_env_fills_gaps() {
        let config = resolve(
            RawConfig {
                access_token: Some("token".to_string()),
                ..RawConfig::default()
            },
            RawConfig {
                api_url: Some("https://api.env.example.com".to_string()),
                ..RawConfig::default()
            },
        )
        .unwrap();
        assert_eq!(config.api_url.as_str(), "https://api.env.example.com/");
    }

    #[test]
    fn test_home_file_fallback() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"Target":"https://api.home.example.com","AccessToken":"bearer home-jwt","RefreshToken":"home-refresh","SSLDisabled":true}}"#
        )
        .unwrap();

        let config = ClientConfig::resolve_with(
            RawConfig::default(),
            RawConfig::default(),
            Some(file.path()),
            HOST,
            PROVIDER,
        )
        .unwrap();

        assert_eq!(config.api_url.as_str(), "https://api.home.example.com/");
        assert!(config.skip_ssl_validation);
        match config.auth {
            AuthScheme::Token {
                access_token,
                refresh_token,
            } => {
                assert_eq!(access_token, "home-jwt");
                assert_eq!(refresh_token.as_deref(), Some("home-refresh"));
            }
            other => panic!("expected token scheme, got {:?}", other),
        }
    }

    #[test]
    fn test_all_empty_without_home_file() {
        let err = ClientConfig::resolve_with(
            RawConfig::default(),
            RawConfig::default(),
            None,
            HOST,
            PROVIDER,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::NoCredentials { .. }));
    }

    #[test]
    fn test_invalid_bool_is_an_error() {
        assert!(parse_bool(ENV_SKIP_SSL_VALIDATION, "yes-please").is_err());
        assert!(parse_bool(ENV_SKIP_SSL_VALIDATION, "1").unwrap());
        assert!(!parse_bool(ENV_SKIP_SSL_VALIDATION, "false").unwrap());
    }

    #[test]
    fn test_user_agent_suffix() {
        let config = resolve(
            RawConfig {
                api_url: Some("https://api.cf.example.com".to_string()),
                access_token: Some("jwt".to_string()),
                append_user_agent: Some("ci-pipeline/7".to_string()),
                ..RawConfig::default()
            },
            RawConfig::default(),
        )
        .unwrap();
        assert!(config.user_agent.ends_with("ci-pipeline/7"));
    }
}
