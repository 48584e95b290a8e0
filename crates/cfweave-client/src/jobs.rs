//! Async job poller
//!
//! Drives a `/v3/jobs/<guid>` identifier to a terminal state under a
//! deadline. Reaching the deadline returns a timeout without cancelling
//! the remote job; callers treat both failure and timeout as terminal and
//! never retry the same mutation.

use serde::Deserialize;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::client::{CfClient, JobRef};
use crate::error::{ApiErrorBody, ClientError, Result};

const MIN_INTERVAL: Duration = Duration::from_secs(1);
const MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Poll pacing and deadline
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub deadline: Duration,
    pub interval: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(10 * 60),
            interval: Duration::from_secs(2),
        }
    }
}

impl PollOptions {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline,
            ..Self::default()
        }
    }

    /// Clamp the interval into the supported [1s, 30s] band.
    pub fn clamped(mut self) -> Self {
        self.interval = self.interval.clamp(MIN_INTERVAL, MAX_INTERVAL);
        self
    }
}

#[derive(Debug, Deserialize)]
struct Job {
    #[serde(default)]
    state: String,
    #[serde(default)]
    errors: Vec<ApiErrorBody>,
}

/// Drive `job` to a terminal state.
///
/// Terminal transitions: COMPLETE is Ok; FAILED surfaces the platform's
/// error payload verbatim; the deadline maps to `JobTimeout` carrying the
/// last observed phase.
pub async fn poll_job(
    client: &CfClient,
    job: &JobRef,
    options: PollOptions,
    cancel: &CancelToken,
) -> Result<()> {
    let options = options.clamped();
    let started = Instant::now();
    let path = format!("/v3/jobs/{}", job.guid);

    loop {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let fetched: Job = tokio::select! {
            result = client.get_json(&path, &[]) => result?,
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
        };

        match fetched.state.as_str() {
            "COMPLETE" => return Ok(()),
            "FAILED" => {
                return Err(ClientError::JobFailed {
                    phase: fetched.state.clone(),
                    errors: fetched.errors,
                })
            }
            // PROCESSING / POLLING keep going
            _ => {}
        }

        if started.elapsed() >= options.deadline {
            return Err(ClientError::JobTimeout {
                phase: fetched.state,
                waited_secs: options.deadline.as_secs(),
            });
        }

        tokio::select! {
            _ = tokio::time::sleep(options.interval) => {}
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
        }
    }
}
