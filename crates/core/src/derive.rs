//! Derivation of a platform job status from a raw pod object.

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

use crate::{JobPhase, JobStatus};

/// Waiting reasons that count as terminal failures even though the substrate
/// keeps the pod in `Pending`.
const IMAGE_PULL_FAILURES: [&str; 2] = ["ImagePullBackOff", "ErrImagePull"];

/// Derive the job status a pod currently represents.
///
/// Pure function of the pod: equal inputs produce equal outputs. Returns
/// `None` when the pod is already being torn down (deletion timestamp set),
/// in which case the caller must take no further action.
pub fn derive(pod: &Pod) -> Option<JobStatus> {
    // Job pods are only deleted once the platform is fully done with them, so
    // a deletion timestamp means the job is already in a terminal state.
    if pod.metadata.deletion_timestamp.is_some() {
        return None;
    }

    let pod_status = pod.status.as_ref();
    let container_statuses = pod_status
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or(&[]);

    let mut phase = match pod_status.and_then(|s| s.phase.as_deref()) {
        Some("Pending") => {
            // Pending counts as running, unless an image pull is backing off.
            if container_statuses.iter().any(is_image_pull_failure) {
                JobPhase::Failed
            } else {
                JobPhase::Running
            }
        }
        Some("Running") => JobPhase::Running,
        Some("Succeeded") => JobPhase::Succeeded,
        Some("Failed") => JobPhase::Failed,
        // "Unknown", anything unrecognized, or no status at all.
        _ => JobPhase::Unknown,
    };

    let started = pod_status.and_then(|s| s.start_time.as_ref()).map(|t| t.0);

    // Pods have no end time of their own. The primary container (first in the
    // spec) is what the platform cares about, so its exit is the job's end.
    let primary = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| c.name.as_str());

    let mut ended = None;
    if let Some(primary) = primary {
        let terminated = container_statuses
            .iter()
            .find(|cs| cs.name == primary)
            .and_then(|cs| cs.state.as_ref())
            .and_then(|state| state.terminated.as_ref());
        if let Some(terminated) = terminated {
            ended = terminated.finished_at.as_ref().map(|t| t.0);
            // The substrate reports Running while sidecars are still alive;
            // the primary container's exit code decides success.
            if phase == JobPhase::Running {
                phase = if terminated.exit_code == 0 {
                    JobPhase::Succeeded
                } else {
                    JobPhase::Failed
                };
            }
        }
    }

    Some(JobStatus { phase, started, ended })
}

fn is_image_pull_failure(cs: &ContainerStatus) -> bool {
    cs.state
        .as_ref()
        .and_then(|s| s.waiting.as_ref())
        .and_then(|w| w.reason.as_deref())
        .map(|reason| IMAGE_PULL_FAILURES.contains(&reason))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FINISHED: &str = "2024-03-01T10:15:00Z";

    fn pod(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).expect("valid pod fixture")
    }

    fn base_pod(phase: &str) -> serde_json::Value {
        json!({
            "metadata": { "namespace": "gantry", "name": "job-abc" },
            "spec": { "containers": [{ "name": "primary" }, { "name": "sidecar" }] },
            "status": { "phase": phase }
        })
    }

    #[test]
    fn pending_without_backoff_is_running() {
        let status = derive(&pod(base_pod("Pending"))).unwrap();
        assert_eq!(status.phase, JobPhase::Running);
        assert!(status.ended.is_none());
    }

    #[test]
    fn pending_with_image_pull_backoff_is_failed() {
        let mut value = base_pod("Pending");
        value["status"]["containerStatuses"] = json!([
            { "name": "primary", "ready": false, "restartCount": 0, "image": "img", "imageID": "",
              "state": { "waiting": { "reason": "ImagePullBackOff" } } }
        ]);
        assert_eq!(derive(&pod(value)).unwrap().phase, JobPhase::Failed);
    }

    #[test]
    fn pending_with_err_image_pull_is_failed() {
        let mut value = base_pod("Pending");
        value["status"]["containerStatuses"] = json!([
            { "name": "primary", "ready": false, "restartCount": 0, "image": "img", "imageID": "",
              "state": { "waiting": { "reason": "ErrImagePull" } } }
        ]);
        assert_eq!(derive(&pod(value)).unwrap().phase, JobPhase::Failed);
    }

    #[test]
    fn running_with_primary_exit_zero_is_succeeded() {
        let mut value = base_pod("Running");
        value["status"]["containerStatuses"] = json!([
            { "name": "primary", "ready": false, "restartCount": 0, "image": "img", "imageID": "",
              "state": { "terminated": { "exitCode": 0, "finishedAt": FINISHED } } },
            { "name": "sidecar", "ready": true, "restartCount": 0, "image": "img", "imageID": "",
              "state": { "running": {} } }
        ]);
        let status = derive(&pod(value)).unwrap();
        assert_eq!(status.phase, JobPhase::Succeeded);
        assert_eq!(status.ended.unwrap().to_rfc3339(), "2024-03-01T10:15:00+00:00");
    }

    #[test]
    fn running_with_primary_nonzero_exit_is_failed() {
        let mut value = base_pod("Running");
        value["status"]["containerStatuses"] = json!([
            { "name": "primary", "ready": false, "restartCount": 0, "image": "img", "imageID": "",
              "state": { "terminated": { "exitCode": 1, "finishedAt": FINISHED } } }
        ]);
        let status = derive(&pod(value)).unwrap();
        assert_eq!(status.phase, JobPhase::Failed);
        assert!(status.ended.is_some());
    }

    #[test]
    fn succeeded_pod_without_terminated_primary_has_no_end() {
        let mut value = base_pod("Succeeded");
        value["status"]["containerStatuses"] = json!([
            { "name": "primary", "ready": true, "restartCount": 0, "image": "img", "imageID": "",
              "state": { "running": {} } }
        ]);
        let status = derive(&pod(value)).unwrap();
        assert_eq!(status.phase, JobPhase::Succeeded);
        assert!(status.ended.is_none());
    }

    #[test]
    fn deletion_timestamp_short_circuits() {
        let mut value = base_pod("Succeeded");
        value["metadata"]["deletionTimestamp"] = json!("2024-03-01T10:20:00Z");
        assert!(derive(&pod(value)).is_none());
    }

    #[test]
    fn sidecar_exit_does_not_override_running() {
        let mut value = base_pod("Running");
        value["status"]["containerStatuses"] = json!([
            { "name": "sidecar", "ready": false, "restartCount": 0, "image": "img", "imageID": "",
              "state": { "terminated": { "exitCode": 1, "finishedAt": FINISHED } } }
        ]);
        let status = derive(&pod(value)).unwrap();
        assert_eq!(status.phase, JobPhase::Running);
        assert!(status.ended.is_none());
    }

    #[test]
    fn unrecognized_phase_is_unknown() {
        assert_eq!(derive(&pod(base_pod("Evicted"))).unwrap().phase, JobPhase::Unknown);
        assert_eq!(derive(&pod(base_pod("Unknown"))).unwrap().phase, JobPhase::Unknown);
    }

    #[test]
    fn started_comes_from_pod_start_time() {
        let mut value = base_pod("Running");
        value["status"]["startTime"] = json!("2024-03-01T10:00:00Z");
        let status = derive(&pod(value)).unwrap();
        assert_eq!(status.started.unwrap().to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }

    #[test]
    fn derivation_is_pure() {
        let mut value = base_pod("Running");
        value["status"]["containerStatuses"] = json!([
            { "name": "primary", "ready": false, "restartCount": 0, "image": "img", "imageID": "",
              "state": { "terminated": { "exitCode": 0, "finishedAt": FINISHED } } }
        ]);
        let p = pod(value);
        assert_eq!(derive(&p), derive(&p));
    }
}
