//! Per-kind attribute schemas consumed by the host engine
//!
//! The engine uses these for plan diffing, validation and documentation.
//! The same declaration doubles as the contract for what a reconciler
//! accepts and returns, so schemas live next to the reconcilers and are
//! assembled into a catalog at provider configure time.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Attribute value type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrType {
    String,
    Bool,
    Int,
    Float,
    /// String-keyed string map (labels, annotations, environment)
    Map,
    /// Unordered set of strings (relationship sets, buildpacks)
    StringSet,
    /// Nested object list with its own attribute set (processes, sidecars)
    ObjectList(IndexMap<String, Attribute>),
    /// Single nested object (docker credentials, health check blocks)
    Object(IndexMap<String, Attribute>),
    /// Opaque normalized JSON string (credentials, parameters)
    Json,
}

/// How a plan diff on this attribute is resolved by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanModifier {
    /// In-place update (the default)
    Mutable,
    /// Any change forces destroy-then-create
    RequiresReplace,
    /// Forces replace only when the user has configured a value
    RequiresReplaceIfConfigured,
    /// Keep the known prior value during planning instead of marking the
    /// attribute unknown; required on computed identifiers so parent
    /// changes do not cascade into child replacement
    UseStateForUnknown,
}

/// A single schema attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    #[serde(rename = "type")]
    pub attr_type: AttrType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub computed: bool,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan_modifiers: Vec<PlanModifier>,
}

impl Attribute {
    fn new(attr_type: AttrType) -> Self {
        Self {
            attr_type,
            required: false,
            optional: false,
            computed: false,
            sensitive: false,
            description: None,
            plan_modifiers: Vec::new(),
        }
    }

    /// Required user-supplied string
    pub fn required_string() -> Self {
        Self {
            required: true,
            ..Self::new(AttrType::String)
        }
    }

    /// Optional user-supplied string
    pub fn optional_string() -> Self {
        Self {
            optional: true,
            ..Self::new(AttrType::String)
        }
    }

    /// Computed string set by the reconciler (timestamps, resolved names)
    pub fn computed_string() -> Self {
        Self {
            computed: true,
            ..Self::new(AttrType::String)
        }
    }

    /// Computed platform identifier. Always carries `UseStateForUnknown`:
    /// without it a benign change on a deep parent forces replacement of
    /// every child whose config references this id.
    pub fn computed_id() -> Self {
        Self {
            computed: true,
            plan_modifiers: vec![PlanModifier::UseStateForUnknown],
            ..Self::new(AttrType::String)
        }
    }

    pub fn optional_bool() -> Self {
        Self {
            optional: true,
            ..Self::new(AttrType::Bool)
        }
    }

    pub fn optional_int() -> Self {
        Self {
            optional: true,
            ..Self::new(AttrType::Int)
        }
    }

    pub fn optional_map() -> Self {
        Self {
            optional: true,
            ..Self::new(AttrType::Map)
        }
    }

    pub fn optional_string_set() -> Self {
        Self {
            optional: true,
            ..Self::new(AttrType::StringSet)
        }
    }

    pub fn optional_json() -> Self {
        Self {
            optional: true,
            ..Self::new(AttrType::Json)
        }
    }

    pub fn object_list(fields: IndexMap<String, Attribute>) -> Self {
        Self {
            optional: true,
            ..Self::new(AttrType::ObjectList(fields))
        }
    }

    pub fn object(fields: IndexMap<String, Attribute>) -> Self {
        Self {
            optional: true,
            ..Self::new(AttrType::Object(fields))
        }
    }

    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn requires_replace(mut self) -> Self {
        self.plan_modifiers.push(PlanModifier::RequiresReplace);
        self
    }

    pub fn requires_replace_if_configured(mut self) -> Self {
        self.plan_modifiers
            .push(PlanModifier::RequiresReplaceIfConfigured);
        self
    }

    pub fn use_state_for_unknown(mut self) -> Self {
        self.plan_modifiers.push(PlanModifier::UseStateForUnknown);
        self
    }

    pub fn has_modifier(&self, modifier: PlanModifier) -> bool {
        self.plan_modifiers.contains(&modifier)
    }
}

/// Declarative schema for one resource kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub version: u64,
    pub attributes: IndexMap<String, Attribute>,
}

impl Schema {
    pub fn v0() -> Self {
        Self {
            version: 0,
            attributes: IndexMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, attribute: Attribute) -> Self {
        self.attributes.insert(name.into(), attribute);
        self
    }

    /// The common tail every resource carries: id, timestamps, metadata.
    pub fn with_common(self) -> Self {
        self.with_attribute("id", Attribute::computed_id())
            .with_attribute("created_at", Attribute::computed_string())
            .with_attribute("updated_at", Attribute::computed_string())
            .with_attribute("labels", Attribute::optional_map())
            .with_attribute("annotations", Attribute::optional_map())
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    /// Attributes that look like computed identifiers. Used by the catalog
    /// sweep test that enforces `UseStateForUnknown` on all of them.
    pub fn computed_id_attributes(&self) -> Vec<&str> {
        fn walk<'a>(attrs: &'a IndexMap<String, Attribute>, out: &mut Vec<(&'a str, &'a Attribute)>) {
            for (name, attr) in attrs {
                if attr.computed && (name == "id" || name.ends_with("_guid")) {
                    out.push((name.as_str(), attr));
                }
                match &attr.attr_type {
                    AttrType::Object(fields) | AttrType::ObjectList(fields) => walk(fields, out),
                    _ => {}
                }
            }
        }
        let mut found = Vec::new();
        walk(&self.attributes, &mut found);
        found.into_iter().map(|(name, _)| name).collect()
    }

    /// True when every computed identifier attribute keeps state for
    /// unknown plans.
    pub fn ids_are_chain_stable(&self) -> bool {
        fn walk(attrs: &IndexMap<String, Attribute>) -> bool {
            attrs.iter().all(|(name, attr)| {
                let own = if attr.computed && (name == "id" || name.ends_with("_guid")) {
                    attr.has_modifier(PlanModifier::UseStateForUnknown)
                } else {
                    true
                };
                let nested = match &attr.attr_type {
                    AttrType::Object(fields) | AttrType::ObjectList(fields) => walk(fields),
                    _ => true,
                };
                own && nested
            })
        }
        walk(&self.attributes)
    }
}

/// Identity schema: the single `{kind}_guid` attribute the engine uses to
/// re-correlate records across schema evolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySchema {
    pub attribute: String,
}

impl IdentitySchema {
    pub fn for_kind(kind: &str) -> Self {
        Self {
            attribute: format!("{}_guid", kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_computed_id_keeps_state() {
        let attr = Attribute::computed_id();
        assert!(attr.computed);
        assert!(attr.has_modifier(PlanModifier::UseStateForUnknown));
    }

    #[test]
    fn test_schema_common_tail() {
        let schema = Schema::v0()
            .with_attribute("name", Attribute::required_string())
            .with_common();

        assert!(schema.get("id").unwrap().computed);
        assert!(schema.get("labels").unwrap().optional);
        assert!(schema.ids_are_chain_stable());
    }

    #[test]
    fn test_chain_stability_detects_bare_id() {
        let schema = Schema::v0().with_attribute("space_guid", Attribute {
            computed: true,
            ..Attribute::optional_string()
        });
        assert!(!schema.ids_are_chain_stable());
        assert_eq!(schema.computed_id_attributes(), vec!["space_guid"]);
    }

    #[test]
    fn test_nested_ids_are_swept() {
        let mut fields = IndexMap::new();
        fields.insert("route_guid".to_string(), Attribute::computed_id());
        let schema = Schema::v0().with_attribute("routes", Attribute::object_list(fields));
        assert!(schema.ids_are_chain_stable());
        assert_eq!(schema.computed_id_attributes(), vec!["route_guid"]);
    }

    #[test]
    fn test_identity_schema_name() {
        let identity = IdentitySchema::for_kind("org");
        assert_eq!(identity.attribute, "org_guid");
    }
}
