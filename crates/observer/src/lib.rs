//! Gantry observer – per-pod lifecycle controller.
//!
//! For every job pod the watch loop reports, the observer derives a platform
//! job phase, posts it to the control plane, enforces the pod's timeout
//! annotation, and schedules deferred cleanup once the job goes terminal.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gantry_api::ControlPlane;
use gantry_core::{
    derive, fingerprint, labels, pod_annotation, pod_fingerprint, pod_label, JobPhase, JobStatus,
    PodEvent,
};

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Grace window between a job going terminal and the cleanup request,
    /// giving log collectors time to drain the pod.
    pub delay_before_cleanup: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self { delay_before_cleanup: Duration::from_secs(60) }
    }
}

/// Cancellation handle for a pod's timeout task.
///
/// `cancel` may be called any number of times, from any task; only the first
/// call signals the timer. Cancel-after-fire is a no-op.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl TimerHandle {
    fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Arc::new(Mutex::new(Some(tx))) }, rx)
    }

    pub fn cancel(&self) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

/// Registries keyed by pod fingerprint (`namespace/name`).
///
/// Entries are never removed while the process runs; growth is bounded by the
/// number of distinct job pods observed during the process lifetime.
#[derive(Default)]
struct Registries {
    /// One timeout task per fingerprint; the handle stays after firing.
    timer_cancels: HashMap<String, TimerHandle>,
    /// Fingerprints whose cleanup is already in flight (or done, or failed).
    deleting: HashSet<String>,
}

struct Inner {
    api: Arc<dyn ControlPlane>,
    config: ObserverConfig,
    shutdown: CancellationToken,
    // Guards both registries. Critical sections are O(1) map operations;
    // nothing awaits while holding it.
    registries: Mutex<Registries>,
}

impl Inner {
    /// Deferred, deduplicated deletion of a terminal pod's resources.
    fn spawn_cleanup(
        self: &Arc<Self>,
        namespace: String,
        pod_name: String,
        event_id: String,
        job_name: String,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let pod_key = fingerprint(&namespace, &pod_name);
            {
                let mut registries = inner.registries.lock().unwrap();
                if !registries.deleting.insert(pod_key.clone()) {
                    debug!(pod = %pod_key, "cleanup already in flight");
                    return;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(inner.config.delay_before_cleanup) => {}
                _ = inner.shutdown.cancelled() => {
                    debug!(pod = %pod_key, "shutdown during cleanup grace delay");
                    return;
                }
            }

            if let Err(e) = inner.api.cleanup_job(&event_id, &job_name).await {
                counter!("job_cleanup_errors_total", 1u64);
                // The fingerprint stays in the deleting set, so a failed
                // cleanup is never retried.
                warn!(event = %event_id, job = %job_name, error = %e, "error cleaning up job");
            } else {
                counter!("job_cleanups_total", 1u64);
                info!(pod = %pod_key, event = %event_id, job = %job_name, "job resources cleaned up");
            }
        });
    }
}

pub struct Observer {
    inner: Arc<Inner>,
}

impl Observer {
    pub fn new(
        api: Arc<dyn ControlPlane>,
        config: ObserverConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                config,
                shutdown,
                registries: Mutex::new(Registries::default()),
            }),
        }
    }

    /// Consume pod events until the channel closes or shutdown is requested.
    pub async fn run(&self, mut rx: mpsc::Receiver<PodEvent>) {
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(PodEvent::Applied(pod)) => self.sync_job_pod(&pod).await,
                        Some(PodEvent::Deleted(pod)) => self.sync_deleted_pod(&pod),
                        None => {
                            debug!("pod event channel closed; stopping observer loop");
                            break;
                        }
                    }
                }
                _ = self.inner.shutdown.cancelled() => {
                    info!("shutdown requested; stopping observer loop");
                    break;
                }
            }
        }
    }

    /// Reconcile one job pod event. Idempotent with respect to redelivery.
    pub async fn sync_job_pod(&self, pod: &Pod) {
        let pod_key = pod_fingerprint(pod);

        // First sighting starts the timeout task. Insertion and task start
        // happen atomically under the registry lock so a concurrent reconcile
        // for the same fingerprint cannot start a second timer.
        let timer = {
            let mut registries = self.inner.registries.lock().unwrap();
            if let Some(handle) = registries.timer_cancels.get(&pod_key) {
                handle.clone()
            } else {
                let (handle, cancelled) = TimerHandle::new();
                registries.timer_cancels.insert(pod_key.clone(), handle.clone());
                gauge!("job_pods_tracked", registries.timer_cancels.len() as f64);
                self.start_timer(pod, cancelled);
                handle
            }
        };

        // Job pods are only deleted after the platform is fully done with
        // them, so a deletion timestamp means the job already went terminal.
        if pod.metadata.deletion_timestamp.is_some() {
            return;
        }

        let Some(status) = derive(pod) else { return };

        if status.phase.cancels_timer() {
            timer.cancel();
        }

        let event_id = pod_label(pod, labels::EVENT).unwrap_or("").to_string();
        let job_name = pod_label(pod, labels::JOB).unwrap_or("").to_string();
        if event_id.is_empty() || job_name.is_empty() {
            warn!(pod = %pod_key, "job pod is missing event/job labels; skipping status update");
            return;
        }

        debug!(pod = %pod_key, event = %event_id, job = %job_name, phase = ?status.phase, "reporting job status");
        if let Err(e) = self.inner.api.update_job_status(&event_id, &job_name, &status).await {
            counter!("job_status_update_errors_total", 1u64);
            // No inline retry: the next watch event redelivers.
            warn!(event = %event_id, job = %job_name, error = %e, "error updating job status");
        } else {
            counter!("job_status_updates_total", 1u64);
        }

        if status.phase.triggers_cleanup() {
            let namespace = pod.metadata.namespace.clone().unwrap_or_default();
            let pod_name = pod.metadata.name.clone().unwrap_or_default();
            self.inner.spawn_cleanup(namespace, pod_name, event_id, job_name);
        }
    }

    /// Hook for pods removed from the substrate. The lifecycle work is done
    /// by then; this only updates per-pod accounting.
    pub fn sync_deleted_pod(&self, pod: &Pod) {
        counter!("job_pods_deleted_total", 1u64);
        debug!(pod = %pod_fingerprint(pod), "job pod deleted from the substrate");
    }

    /// Start the timeout task for a pod's first sighting.
    ///
    /// The wait is relative to task start rather than the pod's start time;
    /// that tolerates a missing `startTime` and the substrate's own
    /// scheduling delays.
    fn start_timer(&self, pod: &Pod, cancelled: oneshot::Receiver<()>) {
        let pod_key = pod_fingerprint(pod);

        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or("");
        if phase != "Pending" && phase != "Running" {
            return;
        }
        let Some(raw) = pod_annotation(pod, labels::TIMEOUT_SECONDS) else { return };
        let timeout = match raw.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(e) => {
                warn!(pod = %pod_key, value = %raw, error = %e, "unparseable timeout annotation; no timeout enforced");
                return;
            }
        };

        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let event_id = pod_label(pod, labels::EVENT).unwrap_or("").to_string();
        let job_name = pod_label(pod, labels::JOB).unwrap_or("").to_string();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = cancelled => return,
                _ = inner.shutdown.cancelled() => return,
            }

            counter!("job_timeouts_fired_total", 1u64);
            if event_id.is_empty() || job_name.is_empty() {
                warn!(pod = %pod_key, "timed-out job pod is missing event/job labels; skipping status update");
                return;
            }

            info!(pod = %pod_key, event = %event_id, job = %job_name, timeout_secs = timeout.as_secs(), "job timed out");
            let status = JobStatus::with_phase(JobPhase::TimedOut);
            if let Err(e) = inner.api.update_job_status(&event_id, &job_name, &status).await {
                counter!("job_status_update_errors_total", 1u64);
                warn!(event = %event_id, job = %job_name, error = %e, "error updating status for timed-out job");
            } else {
                counter!("job_status_updates_total", 1u64);
            }

            inner.spawn_cleanup(namespace, pod_name, event_id, job_name);
        });
    }
}
