//! Gantry core types – job phases, statuses, and the pod label contract.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

mod derive;

pub use derive::derive;

/// Platform-level phase of a job, as reported to the control plane.
///
/// `TimedOut` is never produced by [`derive`]; it originates solely from the
/// observer's timeout supervisor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Unknown,
}

impl JobPhase {
    /// Phases that stop the per-pod timeout timer.
    pub fn cancels_timer(self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed | JobPhase::Unknown)
    }

    /// Phases that schedule deletion of the pod's resources.
    pub fn triggers_cleanup(self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed | JobPhase::TimedOut)
    }
}

/// Status value sent to the control plane for a single job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub phase: JobPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn with_phase(phase: JobPhase) -> Self {
        Self { phase, started: None, ended: None }
    }
}

/// Label and annotation schema stamped on job pods by the launcher.
/// The launcher owns this contract; the observer only reads it.
pub mod labels {
    /// Selector matching every job pod, across all namespaces.
    pub const JOB_POD_SELECTOR: &str = "gantry.io/component=job";
    /// Label carrying the event ID the job belongs to.
    pub const EVENT: &str = "gantry.io/event";
    /// Label carrying the job name within its event.
    pub const JOB: &str = "gantry.io/job";
    /// Annotation bounding total job wall-clock, integer seconds as a string.
    pub const TIMEOUT_SECONDS: &str = "timeoutSeconds";
}

/// Stable per-pod key: `namespace + "/" + name`.
pub fn fingerprint(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Fingerprint of a pod object. Missing metadata fields map to empty strings.
pub fn pod_fingerprint(pod: &Pod) -> String {
    fingerprint(
        pod.metadata.namespace.as_deref().unwrap_or(""),
        pod.metadata.name.as_deref().unwrap_or(""),
    )
}

pub fn pod_label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata.labels.as_ref().and_then(|l| l.get(key)).map(String::as_str)
}

pub fn pod_annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str)
}

/// Lifecycle event for a job pod, as delivered by the watch loop.
/// Delivery is at-least-once; consumers must tolerate duplicates.
#[derive(Debug, Clone)]
pub enum PodEvent {
    Applied(Pod),
    Deleted(Pod),
}

pub mod prelude {
    pub use super::{fingerprint, pod_fingerprint, JobPhase, JobStatus, PodEvent};
}
