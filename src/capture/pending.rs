//! Pending body tracker
//!
//! Tracks in-flight body fetches (and masking passes) per tab so a stopping
//! session can wait for them with a hard deadline.

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::models::TabId;

/// Default bound for [`PendingBodyTracker::drain`]
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct TrackerInner {
    jobs: DashMap<TabId, HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl TrackerInner {
    fn remove(&self, tab_id: TabId, job_id: u64) {
        if let Some(mut jobs) = self.jobs.get_mut(&tab_id) {
            jobs.remove(&job_id);
        }
    }
}

/// Outcome of a bounded drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub settled: usize,
    pub abandoned: usize,
}

#[derive(Clone, Default)]
pub struct PendingBodyTracker {
    inner: Arc<TrackerInner>,
}

impl PendingBodyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `job` and track it until it settles. The job removes itself from
    /// the set whether it succeeded or not.
    pub fn register<F>(&self, tab_id: TabId, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        // hold the entry so the job cannot remove itself before it is inserted
        let mut jobs = self.inner.jobs.entry(tab_id).or_default();
        let handle = tokio::spawn(async move {
            job.await;
            inner.remove(tab_id, job_id);
        });
        jobs.insert(job_id, handle);
    }

    pub fn pending_count(&self, tab_id: TabId) -> usize {
        self.inner
            .jobs
            .get(&tab_id)
            .map(|jobs| jobs.len())
            .unwrap_or(0)
    }

    /// Wait until every job registered for `tab_id` settles or `timeout`
    /// elapses. Jobs still running afterwards keep running but are no longer
    /// tracked.
    pub async fn drain(&self, tab_id: TabId, timeout: Duration) -> DrainReport {
        let Some((_, jobs)) = self.inner.jobs.remove(&tab_id) else {
            return DrainReport::default();
        };
        let total = jobs.len();
        if total == 0 {
            return DrainReport::default();
        }

        let mut outstanding = jobs.into_values().collect::<FuturesUnordered<_>>();
        let mut settled = 0;
        let wait_all = async {
            while outstanding.next().await.is_some() {
                settled += 1;
            }
        };
        if tokio::time::timeout(timeout, wait_all).await.is_err() {
            tracing::warn!(
                tab_id,
                settled,
                abandoned = total - settled,
                "body drain deadline reached"
            );
        }
        DrainReport {
            settled,
            abandoned: total - settled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[tokio::test]
    async fn drain_with_no_jobs_returns_immediately() {
        let tracker = PendingBodyTracker::new();
        let report = tracker.drain(1, Duration::from_secs(5)).await;
        assert_eq!(report, DrainReport::default());
    }

    #[tokio::test]
    async fn drain_waits_for_settled_jobs() {
        let tracker = PendingBodyTracker::new();
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..5u64 {
            let done = done.clone();
            tracker.register(1, async move {
                tokio::time::sleep(Duration::from_millis(5 * i)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        let report = tracker.drain(1, Duration::from_secs(5)).await;
        assert_eq!(report.settled, 5);
        assert_eq!(report.abandoned, 0);
        assert_eq!(done.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn drain_is_bounded_by_timeout() {
        let tracker = PendingBodyTracker::new();
        tracker.register(2, futures::future::pending::<()>());
        tracker.register(2, async {});

        let started = Instant::now();
        let report = tracker.drain(2, Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(report.settled + report.abandoned, 2);
        assert!(report.abandoned >= 1);
        assert_eq!(tracker.pending_count(2), 0);
    }

    #[tokio::test]
    async fn settled_jobs_leave_the_set() {
        let tracker = PendingBodyTracker::new();
        tracker.register(3, async {});
        for _ in 0..50 {
            if tracker.pending_count(3) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(tracker.pending_count(3), 0);
    }

    #[tokio::test]
    async fn tabs_are_tracked_independently() {
        let tracker = PendingBodyTracker::new();
        tracker.register(4, futures::future::pending::<()>());
        tracker.register(5, async {});
        let report = tracker.drain(5, Duration::from_millis(200)).await;
        assert_eq!(report.settled, 1);
        assert_eq!(tracker.pending_count(4), 1);
    }
}
