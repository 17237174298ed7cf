//! Gantry podwatch – list+watch wiring for job pods.

#![forbid(unsafe_code)]

use anyhow::Result;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gantry_core::PodEvent;

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(default)
}

/// Relist interval with ±10% jitter so replicas don't relist in lockstep.
fn relist_with_jitter(base_secs: u64) -> u64 {
    let jitter = ((base_secs as f64) * 0.1) as i64;
    let jval = if jitter > 0 {
        // Fast, dependency-free pseudo-random using time
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as i64;
        let sign = if (now & 1) == 0 { 1 } else { -1 };
        (now % (jitter + 1)) * sign
    } else {
        0
    };
    (base_secs as i64 + jval).max(1) as u64
}

/// Flatten a raw watcher event into pod events. A watch restart replays the
/// full list as applies; the reconciler absorbs the duplicates.
fn pod_events(event: Event<Pod>) -> Vec<PodEvent> {
    match event {
        Event::Applied(pod) => vec![PodEvent::Applied(pod)],
        Event::Deleted(pod) => vec![PodEvent::Deleted(pod)],
        Event::Restarted(pods) => pods.into_iter().map(PodEvent::Applied).collect(),
    }
}

/// Perform a paginated list of job pods and replay each item as `Applied`.
/// Used to prime the observer before the long-running watch, and to repair
/// drift after an expired watch.
pub async fn prime_list(
    client: &Client,
    selector: &str,
    tx: &mpsc::Sender<PodEvent>,
) -> Result<usize> {
    let api: Api<Pod> = Api::all(client.clone());
    let page_limit = env_u64("GANTRY_SNAPSHOT_PAGE_LIMIT", 500) as u32;

    let mut sent = 0usize;
    let mut continue_token: Option<String> = None;
    loop {
        let mut params = ListParams::default().labels(selector);
        if page_limit > 0 {
            params = params.limit(page_limit);
        }
        if let Some(ref token) = continue_token {
            params = params.continue_token(token.as_str());
        }
        let list = api.list(&params).await?;
        let page_items = list.items.len();
        continue_token = list.metadata.continue_.clone();
        for pod in list.items {
            if tx.send(PodEvent::Applied(pod)).await.is_ok() {
                sent += 1;
            }
        }
        counter!("snapshot_pages_total", 1u64);
        histogram!("snapshot_page_items", page_items as f64);
        if continue_token.is_none() {
            break;
        }
        tokio::task::yield_now().await;
    }
    Ok(sent)
}

/// Watch job pods across all namespaces and forward lifecycle events.
///
/// Restarts the watch with exponential backoff on stream errors, relists
/// periodically to repair drift, and recovers from expired resource versions
/// (HTTP 410) with a full relist. Exits cleanly when `shutdown` fires or the
/// receiving side closes the channel.
pub async fn run_watcher(
    client: Client,
    selector: String,
    tx: mpsc::Sender<PodEvent>,
    shutdown: CancellationToken,
) -> Result<()> {
    let relist_secs = env_u64("GANTRY_RELIST_SECS", 300);
    let backoff_max = env_u64("GANTRY_WATCH_BACKOFF_MAX_SECS", 30);

    info!(selector = %selector, relist_secs, "job pod watcher starting");

    let mut backoff: u64 = 1;
    loop {
        let api: Api<Pod> = Api::all(client.clone());
        let cfg = watcher::Config::default().labels(&selector);
        let stream = watcher::watcher(api, cfg);
        futures::pin_mut!(stream);

        let relist_actual = relist_with_jitter(relist_secs);
        let relist_timer = tokio::time::sleep(std::time::Duration::from_secs(relist_actual));
        tokio::pin!(relist_timer);
        info!(relist_actual, "watch stream opened");

        // Read until the stream ends, errors, or the relist timer fires
        let ended = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested; stopping job pod watcher");
                    return Ok(());
                }
                maybe_ev = stream.try_next() => {
                    match maybe_ev {
                        Ok(Some(event)) => {
                            if let Event::Restarted(pods) = &event {
                                debug!(count = pods.len(), "watch restart");
                            }
                            for ev in pod_events(event) {
                                if tx.send(ev).await.is_err() {
                                    info!("pod event channel closed; stopping watcher");
                                    return Ok(());
                                }
                            }
                        }
                        Ok(None) => break true, // stream ended
                        Err(e) => {
                            counter!("watch_errors_total", 1u64);
                            let es = e.to_string();
                            if es.contains("410") || es.to_ascii_lowercase().contains("expired") {
                                warn!(error = %es, "watch stream expired (410); relisting to recover");
                                match prime_list(&client, &selector, &tx).await {
                                    Ok(n) => {
                                        counter!("relist_total", 1u64);
                                        debug!(count = n, "relist after 410 complete");
                                    }
                                    Err(pe) => warn!(error = %pe, "relist after 410 failed"),
                                }
                            } else {
                                warn!(error = %e, "watch stream error; will backoff and restart");
                            }
                            break true;
                        }
                    }
                }
                _ = &mut relist_timer => {
                    info!("periodic relist interval reached; restarting watch");
                    counter!("relist_total", 1u64);
                    break false;
                }
            }
        };

        if ended {
            let dur = std::time::Duration::from_secs(backoff.min(backoff_max));
            histogram!("watch_backoff_ms", dur.as_millis() as f64);
            tokio::select! {
                _ = tokio::time::sleep(dur) => {}
                _ = shutdown.cancelled() => {
                    info!("shutdown requested during watch backoff");
                    return Ok(());
                }
            }
            backoff = (backoff * 2).min(backoff_max).max(1);
            counter!("watch_restarts_total", 1u64);
            continue;
        }
        // else: fallthrough and recreate stream (periodic relist)
        backoff = 1;
        counter!("watch_restarts_total", 1u64);
    }
}
