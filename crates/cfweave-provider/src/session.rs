//! Process-wide authenticated session
//!
//! Created once at provider configure time and never mutated afterwards.
//! Reconcilers borrow the client for the duration of one operation; the
//! token cache inside the client is the only shared mutable state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cfweave_client::{CfClient, ClientConfig, PollOptions};

/// The handle every reconciler reads
#[derive(Clone)]
pub struct Session {
    client: Arc<CfClient>,
    app_log_trace: bool,
    job_deadline: Duration,
}

impl Session {
    pub fn new(client: CfClient, config: &ClientConfig) -> Self {
        Self {
            client: Arc::new(client),
            app_log_trace: config.app_log_trace,
            job_deadline: Duration::from_secs(10 * 60),
        }
    }

    pub fn client(&self) -> &CfClient {
        &self.client
    }

    /// Whether failed pushes should be enriched with recent error logs
    pub fn app_log_trace(&self) -> bool {
        self.app_log_trace
    }

    /// Default pacing for generic job polls
    pub fn poll_options(&self) -> PollOptions {
        PollOptions::with_deadline(self.job_deadline)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("app_log_trace", &self.app_log_trace)
            .field("job_deadline", &self.job_deadline)
            .finish_non_exhaustive()
    }
}
