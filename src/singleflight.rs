//! Per-key coalescing of resolution work
//!
//! A cold hostname under load would otherwise trigger one judge call per
//! concurrent request. The group guarantees a single in-flight resolution
//! per key; late arrivals subscribe to the leader's result instead of
//! starting their own.

use crate::store::RouteMapping;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use tokio::sync::broadcast;
use tracing::debug;

type FlightResult = Result<RouteMapping, String>;

/// Keyed single-flight group over the `hostname ∪ composite-key` keyspace.
#[derive(Default)]
pub struct ResolveGroup {
    inflight: DashMap<String, broadcast::Sender<FlightResult>>,
}

impl ResolveGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, or join an in-flight run of it.
    ///
    /// The leader removes the key before broadcasting, so a caller that
    /// arrives after completion starts fresh (and will typically find the
    /// mapping in the store, which `work` re-checks first).
    pub async fn resolve<F, Fut>(&self, key: &str, work: F) -> anyhow::Result<RouteMapping>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<RouteMapping>>,
    {
        let mut rx = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(entry) => entry.get().subscribe(),
            Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(1);
                entry.insert(tx.clone());

                let result = work().await;
                self.inflight.remove(key);

                let shared = match &result {
                    Ok(mapping) => Ok(mapping.clone()),
                    Err(e) => Err(format!("{e:#}")),
                };
                // No receivers just means nobody joined this flight.
                let _ = tx.send(shared);
                return result;
            }
        };

        debug!(key, "joining in-flight resolution");
        match rx.recv().await {
            Ok(Ok(mapping)) => Ok(mapping),
            Ok(Err(message)) => Err(anyhow::anyhow!(message)),
            // The leader died without broadcasting; report rather than
            // stampede the judge from every waiter.
            Err(_) => Err(anyhow::anyhow!("resolution for {key} was interrupted")),
        }
    }
}
