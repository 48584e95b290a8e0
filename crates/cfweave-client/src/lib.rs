//! cfweave Client - typed access to the Cloud Foundry v3 API
//!
//! This crate owns everything between a reconciler and the wire:
//! - `config`: credential precedence (explicit > environment > home file)
//!   and the exclusive auth-scheme rules
//! - `client`: the authenticated reqwest wrapper with token cache,
//!   pagination and per-resource collections
//! - `jobs`: the async job poller shared by all asynchronous resources
//! - `apps`: manifest, environment, SSH, deployment and log sub-APIs
//! - `mta`: the deploy-service client with its own operation poller
//! - `types`: serde payloads for the v3 resources the provider touches

pub mod apps;
pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod jobs;
pub mod mta;
pub mod types;

pub use cancel::CancelToken;
pub use client::{CfClient, Collection, Created, JobRef};
pub use config::{AuthScheme, ClientConfig, ConfigError, RawConfig};
pub use error::{ApiErrorBody, ClientError, Result};
pub use jobs::{poll_job, PollOptions};
