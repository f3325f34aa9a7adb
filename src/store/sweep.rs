//! Background sweeper: TTL reclamation and staleness detection.

use std::sync::Arc;

use chrono::Utc;

use crate::error::FailureCode;
use crate::store::JobStore;

/// Run one sweep pass: purge expired entries, stale-mark abandoned RUNNING
/// jobs, and drop idle lock cells. Returns how many jobs were stale-marked.
pub async fn sweep_once(store: &JobStore) -> usize {
    match store.backend_purge_expired().await {
        Ok(purged) if purged > 0 => tracing::debug!(purged, "expired kv entries purged"),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "kv purge failed"),
    }

    let now = Utc::now();
    let max_age = store.config().running_max_age;
    let mut marked = 0;

    for job in store.running_jobs().await {
        let updated_age = job.updated_age(now);
        let age = job.age(now);

        let code = if updated_age > max_age {
            FailureCode::StaleRunningNoHeartbeat
        } else if age > max_age {
            FailureCode::StaleRunningTooOld
        } else {
            continue;
        };

        match store.mark_stale(&job.request_id, code).await {
            Ok(true) => marked += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(request_id = %job.request_id, error = %e, "sweep stale-mark failed");
            }
        }
    }

    store.prune_locks().await;
    marked
}

/// Spawn the sweeper loop. Stops when the store is dropped by the engine
/// shutting down the task handle.
pub fn spawn_sweeper(store: Arc<JobStore>) -> tokio::task::JoinHandle<()> {
    let interval = store.config().sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately; skip it so startup isn't a sweep.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let marked = sweep_once(&store).await;
            if marked > 0 {
                tracing::info!(marked, "sweep stale-marked abandoned jobs");
            }
        }
    })
}
