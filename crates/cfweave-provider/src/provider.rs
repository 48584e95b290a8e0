//! Provider surface: configure and the schema catalog
//!
//! `configure` resolves the credential chain into a `Session`; every
//! configuration failure is mapped to a diagnostic pointing at the
//! offending attribute, surfaced at the ConfigureProvider phase before
//! any resource work starts.

use cfweave_client::{CfClient, ClientConfig, ConfigError, RawConfig};
use cfweave_core::{Attribute, AttributePath, Diagnostics, IdentitySchema, Schema};

use crate::catalog;
use crate::session::Session;

pub const PROVIDER_NAME: &str = "cloudfoundry";
pub const PROVIDER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The full schema the host engine asks for once per session
#[derive(Debug)]
pub struct ProviderSchema {
    pub provider: Schema,
    pub resources: Vec<(&'static str, Schema)>,
    pub identities: Vec<(&'static str, IdentitySchema)>,
    pub datasources: Vec<(&'static str, Schema)>,
}

/// Entry point the host adapter holds on to
pub struct CloudFoundryProvider;

impl CloudFoundryProvider {
    /// Provider-level configuration attributes
    pub fn provider_schema() -> Schema {
        Schema::v0()
            .with_attribute("api_url", Attribute::optional_string())
            .with_attribute("user", Attribute::optional_string())
            .with_attribute("password", Attribute::optional_string().sensitive())
            .with_attribute("cf_client_id", Attribute::optional_string())
            .with_attribute("cf_client_secret", Attribute::optional_string().sensitive())
            .with_attribute("origin", Attribute::optional_string())
            .with_attribute("access_token", Attribute::optional_string().sensitive())
            .with_attribute("refresh_token", Attribute::optional_string().sensitive())
            .with_attribute("assertion_token", Attribute::optional_string().sensitive())
            .with_attribute("skip_ssl_validation", Attribute::optional_bool())
    }

    /// Assemble the catalog: provider config, every resource kind with
    /// its identity schema, and the data sources.
    pub fn schema() -> ProviderSchema {
        let reconcilers = catalog();
        ProviderSchema {
            provider: Self::provider_schema(),
            resources: reconcilers
                .iter()
                .map(|r| (r.kind(), r.schema()))
                .collect(),
            identities: reconcilers
                .iter()
                .map(|r| (r.kind(), r.identity_schema()))
                .collect(),
            datasources: crate::datasources::schemas(),
        }
    }

    /// Resolve configuration and open the session. `host_version` feeds
    /// the user-agent string.
    pub fn configure(
        explicit: RawConfig,
        host_version: &str,
    ) -> Result<Session, Diagnostics> {
        let config = ClientConfig::resolve(explicit, host_version, PROVIDER_VERSION)
            .map_err(config_diagnostics)?;
        let client = CfClient::new(&config).map_err(|e| {
            let mut diagnostics = Diagnostics::new();
            diagnostics.error("Failed to construct API client", e.to_string());
            diagnostics
        })?;
        tracing::info!(api_url = %config.api_url, auth = config.auth.kind(), "session configured");
        Ok(Session::new(client, &config))
    }
}

/// Attach the attribute path each configuration failure points at.
fn config_diagnostics(err: ConfigError) -> Diagnostics {
    let mut diagnostics = Diagnostics::new();
    let path = match &err {
        ConfigError::MissingEndpoint | ConfigError::InvalidEndpoint { .. } => {
            Some(AttributePath::root("api_url"))
        }
        ConfigError::HalfSetPair { missing, .. } => Some(AttributePath::root(missing.clone())),
        ConfigError::ConflictingSchemes { second, .. } => {
            Some(AttributePath::root(second.clone()))
        }
        ConfigError::InvalidBool { attribute, .. } => {
            Some(AttributePath::root(attribute.clone()))
        }
        ConfigError::NoCredentials { .. } | ConfigError::CredentialFile { .. } => None,
    };
    let diag = cfweave_core::Diagnostic::error("Provider configuration invalid", err.to_string());
    diagnostics.push(match path {
        Some(path) => diag.with_path(path),
        None => diag,
    });
    diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_catalog_ids_are_chain_stable() {
        let schema = CloudFoundryProvider::schema();
        for (kind, resource) in &schema.resources {
            assert!(
                resource.ids_are_chain_stable(),
                "{} has a computed id without use_state_for_unknown: {:?}",
                kind,
                resource.computed_id_attributes(),
            );
        }
    }

    #[test]
    fn test_every_resource_has_identity() {
        let schema = CloudFoundryProvider::schema();
        assert_eq!(schema.resources.len(), schema.identities.len());
        for (kind, identity) in &schema.identities {
            let short = kind.trim_start_matches("cloudfoundry_");
            assert_eq!(identity.attribute, format!("{}_guid", short));
        }
    }

    #[test]
    fn test_sensitive_provider_attributes() {
        let schema = CloudFoundryProvider::provider_schema();
        for name in ["password", "cf_client_secret", "access_token"] {
            assert!(schema.get(name).unwrap().sensitive, "{} must be sensitive", name);
        }
    }

    #[test]
    fn test_configure_rejects_half_set_pair() {
        let err = CloudFoundryProvider::configure(
            RawConfig {
                api_url: Some("https://api.cf.example.com".to_string()),
                user: Some("admin".to_string()),
                ..RawConfig::default()
            },
            "1.9.0",
        )
        .unwrap_err();
        assert!(err.has_errors());
        let rendered = err.error_summary();
        assert!(rendered.contains("password"));
    }
}
