//! Gantry control-plane API client.
//!
//! The observer makes exactly two calls into the control plane: updating a
//! job's status and requesting cleanup of a finished job. Both are idempotent
//! on the server side and carry a bounded per-call timeout. This crate
//! isolates the wire protocol behind the [`ControlPlane`] trait so the
//! observer core never sees HTTP.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use tracing::debug;

use gantry_core::JobStatus;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid API endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("API returned {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

/// The two control-plane operations the observer performs.
///
/// Repeated calls with the same arguments are server-side no-ops, so callers
/// may freely redeliver.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn update_job_status(
        &self,
        event_id: &str,
        job_name: &str,
        status: &JobStatus,
    ) -> Result<(), ApiError>;

    async fn cleanup_job(&self, event_id: &str, job_name: &str) -> Result<(), ApiError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Base URL of the control-plane API, e.g. `https://gantry.example.com`.
    pub endpoint: String,
    /// Bearer token presented on every call.
    pub token: Option<String>,
    /// Bounded per-call timeout (the "API request timeout").
    pub request_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            token: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// REST implementation of [`ControlPlane`]. Stateless apart from the
/// connection pool inside the HTTP client.
#[derive(Debug)]
pub struct HttpControlPlane {
    base: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(config: HttpClientConfig) -> Result<Self, ApiError> {
        let base = config.endpoint.trim_end_matches('/').to_string();
        Url::parse(&base).map_err(|e| ApiError::InvalidEndpoint {
            endpoint: config.endpoint.clone(),
            reason: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self { base, token: config.token, client })
    }

    fn job_url(&self, event_id: &str, job_name: &str, verb: &str) -> String {
        format!(
            "{}/v2/events/{}/worker/jobs/{}/{}",
            self.base, event_id, job_name, verb
        )
    }

    async fn put(
        &self,
        url: &str,
        body: Option<&JobStatus>,
    ) -> Result<reqwest::Response, ApiError> {
        let mut req = self.client.put(url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        req.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Transport(format!("request to {} timed out", url))
            } else {
                ApiError::Transport(e.to_string())
            }
        })
    }
}

async fn reject(response: reqwest::Response) -> ApiError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message: String = body.trim().chars().take(512).collect();
    ApiError::Http { status, message }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn update_job_status(
        &self,
        event_id: &str,
        job_name: &str,
        status: &JobStatus,
    ) -> Result<(), ApiError> {
        let url = self.job_url(event_id, job_name, "status");
        debug!(url = %url, phase = ?status.phase, "updating job status");
        let response = self.put(&url, Some(status)).await?;
        if !response.status().is_success() {
            return Err(reject(response).await);
        }
        Ok(())
    }

    async fn cleanup_job(&self, event_id: &str, job_name: &str) -> Result<(), ApiError> {
        let url = self.job_url(event_id, job_name, "cleanup");
        debug!(url = %url, "requesting job cleanup");
        let response = self.put(&url, None).await?;
        // The underlying pod may already be gone; that's still a success.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(reject(response).await);
        }
        Ok(())
    }
}

/// A recorded control-plane call, for assertions in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    UpdateJobStatus {
        event_id: String,
        job_name: String,
        status: JobStatus,
    },
    CleanupJob {
        event_id: String,
        job_name: String,
    },
}

/// In-memory [`ControlPlane`] that records calls and can inject failures.
#[derive(Debug, Default)]
pub struct MockControlPlane {
    calls: Mutex<Vec<RecordedCall>>,
    fail_updates: AtomicBool,
    fail_cleanups: AtomicBool,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_updates(&self, on: bool) {
        self.fail_updates.store(on, Ordering::SeqCst);
    }

    pub fn fail_cleanups(&self, on: bool) {
        self.fail_cleanups.store(on, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Statuses passed to `update_job_status`, in call order.
    pub fn statuses_reported(&self) -> Vec<JobStatus> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RecordedCall::UpdateJobStatus { status, .. } => Some(status),
                RecordedCall::CleanupJob { .. } => None,
            })
            .collect()
    }

    pub fn cleanup_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, RecordedCall::CleanupJob { .. }))
            .count()
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn update_job_status(
        &self,
        event_id: &str,
        job_name: &str,
        status: &JobStatus,
    ) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(RecordedCall::UpdateJobStatus {
            event_id: event_id.to_string(),
            job_name: job_name.to_string(),
            status: status.clone(),
        });
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(ApiError::Transport("injected update failure".to_string()));
        }
        Ok(())
    }

    async fn cleanup_job(&self, event_id: &str, job_name: &str) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(RecordedCall::CleanupJob {
            event_id: event_id.to_string(),
            job_name: job_name.to_string(),
        });
        if self.fail_cleanups.load(Ordering::SeqCst) {
            return Err(ApiError::Transport("injected cleanup failure".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::JobPhase;

    #[test]
    fn job_urls_are_built_from_a_trimmed_base() {
        let api = HttpControlPlane::new(HttpClientConfig {
            endpoint: "https://gantry.example.com/".to_string(),
            ..Default::default()
        })
        .expect("valid endpoint");
        assert_eq!(
            api.job_url("evt-1", "build", "status"),
            "https://gantry.example.com/v2/events/evt-1/worker/jobs/build/status"
        );
        assert_eq!(
            api.job_url("evt-1", "build", "cleanup"),
            "https://gantry.example.com/v2/events/evt-1/worker/jobs/build/cleanup"
        );
    }

    #[test]
    fn invalid_endpoint_is_rejected_at_construction() {
        let err = HttpControlPlane::new(HttpClientConfig {
            endpoint: "not a url".to_string(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, ApiError::InvalidEndpoint { .. }));
    }

    #[test]
    fn job_status_wire_format() {
        let status = JobStatus {
            phase: JobPhase::TimedOut,
            started: Some("2024-03-01T10:00:00Z".parse().unwrap()),
            ended: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "phase": "TIMED_OUT",
                "started": "2024-03-01T10:00:00Z"
            })
        );
    }

    #[tokio::test]
    async fn mock_records_calls_and_injects_failures() {
        let mock = MockControlPlane::new();
        let status = JobStatus::with_phase(JobPhase::Succeeded);
        mock.update_job_status("e", "j", &status).await.unwrap();
        mock.cleanup_job("e", "j").await.unwrap();
        assert_eq!(mock.statuses_reported(), vec![status]);
        assert_eq!(mock.cleanup_count(), 1);

        mock.fail_updates(true);
        let err = mock
            .update_job_status("e", "j", &JobStatus::with_phase(JobPhase::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)));
    }
}
