//! Resource identity side-channel
//!
//! The host engine may construct the identity tuple lazily, so every
//! Create/Read/Update success path re-emits it; absence only shows up
//! after a host upgrade, which makes it an easy regression.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// The `{kind}_guid` single-field tuple attached to a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub kind: String,
    pub guid: String,
}

impl Identity {
    pub fn new(kind: impl Into<String>, guid: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            guid: guid.into(),
        }
    }

    /// Render as the single-attribute tuple the engine stores
    pub fn to_tuple(&self) -> BTreeMap<String, String> {
        let mut tuple = BTreeMap::new();
        tuple.insert(format!("{}_guid", self.kind), self.guid.clone());
        tuple
    }
}

/// What an Import call may hand the reconciler: a raw identifier (legacy)
/// or the identity tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportSpec {
    Raw(String),
    Identity(Identity),
}

impl ImportSpec {
    /// Parse an import payload for `kind`. Accepts either a bare GUID
    /// string or a one-entry `{kind}_guid` map.
    pub fn parse(kind: &str, payload: &serde_json::Value) -> Result<Self> {
        match payload {
            serde_json::Value::String(raw) => {
                validate_guid("id", raw)?;
                Ok(ImportSpec::Raw(raw.clone()))
            }
            serde_json::Value::Object(map) => {
                let attribute = format!("{}_guid", kind);
                let guid = map
                    .get(&attribute)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CoreError::InvalidImport {
                        message: format!("identity is missing attribute '{}'", attribute),
                    })?;
                validate_guid(&attribute, guid)?;
                Ok(ImportSpec::Identity(Identity::new(kind, guid)))
            }
            other => Err(CoreError::InvalidImport {
                message: format!("expected a GUID string or identity object, got {}", other),
            }),
        }
    }

    pub fn guid(&self) -> &str {
        match self {
            ImportSpec::Raw(guid) => guid,
            ImportSpec::Identity(identity) => &identity.guid,
        }
    }
}

/// Validate a platform GUID. CF identifiers are UUIDs.
pub fn validate_guid(attribute: &str, value: &str) -> Result<()> {
    Uuid::parse_str(value).map_err(|_| CoreError::InvalidGuid {
        attribute: attribute.to_string(),
        value: value.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const GUID: &str = "8f7d9a2e-4b3c-4f1a-9e6d-2c5b8a7f0e13";

    #[test]
    fn test_tuple_rendering() {
        let identity = Identity::new("space", GUID);
        let tuple = identity.to_tuple();
        assert_eq!(tuple.get("space_guid").map(String::as_str), Some(GUID));
        assert_eq!(tuple.len(), 1);
    }

    #[test]
    fn test_parse_raw_guid() {
        let spec = ImportSpec::parse("org", &json!(GUID)).unwrap();
        assert_eq!(spec.guid(), GUID);
        assert!(matches!(spec, ImportSpec::Raw(_)));
    }

    #[test]
    fn test_parse_identity_tuple() {
        let spec = ImportSpec::parse("org", &json!({ "org_guid": GUID })).unwrap();
        assert!(matches!(spec, ImportSpec::Identity(_)));
        assert_eq!(spec.guid(), GUID);
    }

    #[test]
    fn test_wrong_attribute_is_rejected() {
        let result = ImportSpec::parse("org", &json!({ "space_guid": GUID }));
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_guid_is_rejected() {
        assert!(ImportSpec::parse("org", &json!("not-a-guid")).is_err());
        assert!(validate_guid("id", "also-bad").is_err());
        assert!(validate_guid("id", GUID).is_ok());
    }
}
