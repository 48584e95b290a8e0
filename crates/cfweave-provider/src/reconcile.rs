//! The generic reconciler contract
//!
//! Every resource kind exposes the same five entry points over JSON
//! records; typed record structs live in each resource module and cross
//! this boundary through serde. Within one reconcile the order is always:
//! validate, preflight reads, mutation, poll, read-back, state write.
//! Partial state is still handed back on cancellation so the next plan
//! converges instead of leaking.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use cfweave_core::{
    AttributePath, Diagnostic, Diagnostics, Identity, IdentitySchema, ImportSpec, Schema,
};
use cfweave_client::{CancelToken, ClientError, JobRef};

use crate::session::Session;

/// Result of Create/Update/Import: the record to persist (when one could
/// be obtained), the identity side-channel, and any diagnostics.
#[derive(Debug, Default)]
pub struct ReconcileOutput {
    pub record: Option<Value>,
    pub identity: Option<Identity>,
    pub diagnostics: Diagnostics,
}

impl ReconcileOutput {
    pub fn ok<R: Serialize>(kind: &str, guid: &str, record: &R) -> Self {
        let mut output = Self::default();
        match serde_json::to_value(record) {
            Ok(value) => {
                output.record = Some(value);
                output.identity = Some(Identity::new(kind, guid));
            }
            Err(e) => output
                .diagnostics
                .error("Record serialization failed", e.to_string()),
        }
        output
    }

    pub fn errors(diagnostics: Diagnostics) -> Self {
        Self {
            record: None,
            identity: None,
            diagnostics,
        }
    }

    pub fn error(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        let mut diagnostics = Diagnostics::new();
        diagnostics.error(summary, detail);
        Self::errors(diagnostics)
    }

    pub fn with_warnings(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics.extend(diagnostics);
        self
    }
}

/// What Read learned about a previously-known record
#[derive(Debug)]
pub enum ReadOutcome {
    /// The entity exists; persist the refreshed record
    Live(Value),
    /// 404 from the platform: remove the record from host state so the
    /// next plan recreates it. Not an error.
    Gone,
}

#[derive(Debug)]
pub struct ReadOutput {
    pub outcome: ReadOutcome,
    pub identity: Option<Identity>,
    pub diagnostics: Diagnostics,
}

impl ReadOutput {
    pub fn live<R: Serialize>(kind: &str, guid: &str, record: &R) -> Self {
        match serde_json::to_value(record) {
            Ok(value) => Self {
                outcome: ReadOutcome::Live(value),
                identity: Some(Identity::new(kind, guid)),
                diagnostics: Diagnostics::new(),
            },
            Err(e) => {
                let mut diagnostics = Diagnostics::new();
                diagnostics.error("Record serialization failed", e.to_string());
                Self {
                    outcome: ReadOutcome::Gone,
                    identity: None,
                    diagnostics,
                }
            }
        }
    }

    pub fn gone() -> Self {
        Self {
            outcome: ReadOutcome::Gone,
            identity: None,
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn error(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        let mut diagnostics = Diagnostics::new();
        diagnostics.error(summary, detail);
        Self {
            outcome: ReadOutcome::Gone,
            identity: None,
            diagnostics,
        }
    }
}

/// The contract every resource kind implements
#[async_trait]
pub trait ResourceReconciler: Send + Sync {
    /// Full kind name, e.g. `cloudfoundry_space`
    fn kind(&self) -> &'static str;

    /// Short kind used by the identity side-channel, e.g. `space`
    fn short_kind(&self) -> &'static str;

    fn schema(&self) -> Schema;

    fn identity_schema(&self) -> IdentitySchema {
        IdentitySchema::for_kind(self.short_kind())
    }

    /// Schema-level validation before any API call. Default: accept.
    fn validate(&self, _config: &Value) -> Diagnostics {
        Diagnostics::new()
    }

    async fn create(
        &self,
        session: &Session,
        desired: Value,
        cancel: &CancelToken,
    ) -> ReconcileOutput;

    async fn read(&self, session: &Session, prior: Value, cancel: &CancelToken) -> ReadOutput;

    async fn update(
        &self,
        session: &Session,
        plan: Value,
        prior: Value,
        cancel: &CancelToken,
    ) -> ReconcileOutput;

    async fn delete(&self, session: &Session, prior: Value, cancel: &CancelToken) -> Diagnostics;

    /// Hydrate a record from a raw identifier or the identity tuple.
    async fn import(
        &self,
        session: &Session,
        spec: Value,
        cancel: &CancelToken,
    ) -> ReconcileOutput {
        let parsed = match ImportSpec::parse(self.short_kind(), &spec) {
            Ok(parsed) => parsed,
            Err(e) => return ReconcileOutput::error("Invalid import specifier", e.to_string()),
        };
        let prior = serde_json::json!({ "id": parsed.guid() });
        let read = self.read(session, prior, cancel).await;
        match read.outcome {
            ReadOutcome::Live(record) => ReconcileOutput {
                record: Some(record),
                identity: read.identity,
                diagnostics: read.diagnostics,
            },
            ReadOutcome::Gone => {
                let mut output = ReconcileOutput::errors(read.diagnostics);
                if !output.diagnostics.has_errors() {
                    output.diagnostics.error(
                        format!("Cannot import {}", self.kind()),
                        format!("no entity with identifier '{}'", parsed.guid()),
                    );
                }
                output
            }
        }
    }
}

/// Map a client error into a diagnostic with the operation as summary.
pub fn client_diag(operation: &str, err: &ClientError) -> Diagnostic {
    Diagnostic::error(operation.to_string(), err.to_string())
}

/// Parse a typed record out of the JSON boundary value.
pub fn decode<R: DeserializeOwned>(what: &str, value: Value) -> Result<R, Diagnostics> {
    serde_json::from_value(value).map_err(|e| {
        let mut diagnostics = Diagnostics::new();
        diagnostics.error(
            format!("Invalid {} data", what),
            format!("host state does not match the schema: {}", e),
        );
        diagnostics
    })
}

/// Shared delete tail: treat 404 as success (idempotent delete), poll the
/// job when the endpoint answered asynchronously.
pub async fn finish_delete(
    session: &Session,
    kind: &str,
    result: Result<Option<JobRef>, ClientError>,
    cancel: &CancelToken,
) -> Diagnostics {
    let mut diagnostics = Diagnostics::new();
    match result {
        Ok(Some(job)) => {
            if let Err(e) =
                cfweave_client::poll_job(session.client(), &job, session.poll_options(), cancel)
                    .await
            {
                diagnostics.push(client_diag(&format!("Failed to delete {}", kind), &e));
            }
        }
        Ok(None) => {}
        Err(e) if e.is_not_found() => {
            tracing::debug!(kind, "delete target already gone");
        }
        Err(e) => diagnostics.push(client_diag(&format!("Failed to delete {}", kind), &e)),
    }
    diagnostics
}

/// Validate that exactly one of two mutually-exclusive attributes is set.
pub fn exactly_one(
    diagnostics: &mut Diagnostics,
    first: (&str, bool),
    second: (&str, bool),
) {
    match (first.1, second.1) {
        (true, true) => diagnostics.error_at(
            AttributePath::root(first.0),
            "Conflicting attributes",
            format!("'{}' and '{}' are mutually exclusive", first.0, second.0),
        ),
        (false, false) => diagnostics.error_at(
            AttributePath::root(first.0),
            "Missing attribute",
            format!("exactly one of '{}' or '{}' must be set", first.0, second.0),
        ),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Rec {
        id: String,
        name: String,
    }

    #[test]
    fn test_ok_output_emits_identity() {
        let record = Rec {
            id: "abc".to_string(),
            name: "x".to_string(),
        };
        let output = ReconcileOutput::ok("org", "abc", &record);
        assert!(output.record.is_some());
        let identity = output.identity.unwrap();
        assert_eq!(identity.to_tuple().get("org_guid").map(String::as_str), Some("abc"));
        assert!(!output.diagnostics.has_errors());
    }

    #[test]
    fn test_decode_reports_schema_mismatch() {
        let err = decode::<Rec>("org", serde_json::json!({"id": 7})).unwrap_err();
        assert!(err.has_errors());
    }

    #[test]
    fn test_exactly_one() {
        let mut diags = Diagnostics::new();
        exactly_one(&mut diags, ("path", true), ("docker_image", false));
        assert!(!diags.has_errors());

        let mut diags = Diagnostics::new();
        exactly_one(&mut diags, ("path", true), ("docker_image", true));
        assert!(diags.has_errors());

        let mut diags = Diagnostics::new();
        exactly_one(&mut diags, ("path", false), ("docker_image", false));
        assert!(diags.has_errors());
    }
}
