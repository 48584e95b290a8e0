//! One module per `cloudfoundry_<kind>`

pub mod app;
pub mod app_manifest;
pub mod domain;
pub mod isolation_segment;
pub mod mta;
pub mod org;
pub mod org_quota;
pub mod role;
pub mod route;
pub mod security_group;
pub mod service_binding;
pub mod service_broker;
pub mod service_instance;
pub mod service_sharing;
pub mod space;
pub mod space_quota;
