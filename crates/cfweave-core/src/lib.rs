//! cfweave Core - shared types for the Cloud Foundry provider
//!
//! This crate provides the foundational pieces used by every reconciler:
//! - `Schema`: per-kind declarative attribute schema for the host engine
//! - `Metadata`: label/annotation bag and its update-payload differ
//! - `SetDiff`: membership diff for relationship-set fields
//! - `Diagnostics`: attribute-pathed errors and warnings
//! - `Identity`: the `{kind}_guid` side-channel attached to every record

pub mod diag;
pub mod error;
pub mod identity;
pub mod metadata;
pub mod relations;
pub mod schema;

pub use diag::{AttributePath, Diagnostic, Diagnostics, Severity};
pub use error::CoreError;
pub use identity::{Identity, ImportSpec};
pub use metadata::{Metadata, MetadataPatch};
pub use relations::{diff_sets, SetDiff};
pub use schema::{AttrType, Attribute, IdentitySchema, PlanModifier, Schema};
