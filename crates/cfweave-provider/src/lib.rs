//! cfweave Provider - Cloud Foundry resource reconcilers
//!
//! The host engine drives a plan/apply lifecycle; this crate supplies the
//! provider side of it:
//! - `provider`: configure (session construction) and the schema catalog
//! - `session`: the process-wide authenticated handle
//! - `reconcile`: the generic Create/Read/Update/Delete/Import contract
//! - `resources`: one reconciler per `cloudfoundry_<kind>`
//! - `datasources`: read-only lookups
//!
//! The gRPC plugin handshake lives with the host; this crate is the
//! in-process API surface it calls into.

pub mod catalog;
pub mod datasources;
pub mod provider;
pub mod reconcile;
pub mod resources;
pub mod session;

pub use catalog::{catalog, reconciler_for};
pub use provider::{CloudFoundryProvider, ProviderSchema, PROVIDER_NAME, PROVIDER_VERSION};
pub use reconcile::{ReadOutcome, ReadOutput, ReconcileOutput, ResourceReconciler};
pub use session::Session;
