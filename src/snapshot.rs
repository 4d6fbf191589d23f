//! Short-TTL memoization for discovery probes
//!
//! Probes shell out or talk to the container runtime and can take hundreds
//! of milliseconds; this cache makes them safe to consult on every request.
//! The refresh runs under the write lock, so concurrent callers inside one
//! TTL window trigger at most one probe.

use anyhow::Result;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(5);

struct Slot<T> {
    value: Option<T>,
    refreshed_at: Option<Instant>,
}

/// TTL-bounded memo of a probe result.
pub struct SnapshotCache<T> {
    slot: RwLock<Slot<T>>,
    ttl: Duration,
    label: &'static str,
}

impl<T: Clone> SnapshotCache<T> {
    pub fn new(label: &'static str, ttl: Duration) -> Self {
        Self {
            slot: RwLock::new(Slot {
                value: None,
                refreshed_at: None,
            }),
            ttl,
            label,
        }
    }

    /// Return the cached value, refreshing through `probe` when stale.
    ///
    /// A failed refresh degrades to the previous value if one exists; only
    /// a failure with no prior data is surfaced to the caller.
    pub async fn get<F, Fut>(&self, probe: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let slot = self.slot.read().await;
            if let (Some(value), Some(at)) = (&slot.value, slot.refreshed_at) {
                if at.elapsed() < self.ttl {
                    return Ok(value.clone());
                }
            }
        }

        let mut slot = self.slot.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let (Some(value), Some(at)) = (&slot.value, slot.refreshed_at) {
            if at.elapsed() < self.ttl {
                return Ok(value.clone());
            }
        }

        match probe().await {
            Ok(value) => {
                slot.value = Some(value.clone());
                slot.refreshed_at = Some(Instant::now());
                Ok(value)
            }
            Err(e) => match &slot.value {
                Some(stale) => {
                    warn!(cache = self.label, error = %e, "probe failed, serving stale snapshot");
                    Ok(stale.clone())
                }
                None => Err(e),
            },
        }
    }

    /// Force the next `get` to refresh.
    pub async fn invalidate(&self) {
        self.slot.write().await.refreshed_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_probe_runs_once_per_ttl_window() {
        let cache = Arc::new(SnapshotCache::<Vec<u16>>::new(
            "test",
            Duration::from_secs(60),
        ));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get(|| async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(vec![5173])
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), vec![5173]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_value_returned_on_probe_failure() {
        let cache = SnapshotCache::<u32>::new("test", Duration::from_millis(1));

        assert_eq!(cache.get(|| async { Ok(7) }).await.unwrap(), 7);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let got = cache
            .get(|| async { anyhow::bail!("probe broke") })
            .await
            .unwrap();
        assert_eq!(got, 7);
    }

    #[tokio::test]
    async fn test_failure_with_no_prior_data_is_an_error() {
        let cache = SnapshotCache::<u32>::new("test", Duration::from_secs(5));
        assert!(cache
            .get(|| async { anyhow::bail!("probe broke") })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let cache = SnapshotCache::<u32>::new("test", Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for expected in [1, 1] {
            cache
                .get(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await
                .unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), expected);
        }

        cache.invalidate().await;
        cache
            .get(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
