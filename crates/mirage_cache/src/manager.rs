use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::{task::JoinHandle, time::interval};
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    replication::{NoopReplicator, ReplicationBatch, Replicator},
    store::{BackstopPolicy, ReplicatedCacheStore},
};

/// Owns every cache store of the process, one per scope name.
///
/// Built once at startup and handed to whatever needs a store. Asking for the
/// same scope twice, from any number of threads, yields the same instance.
#[derive(Debug)]
pub struct CacheManager {
    stores: DashMap<String, Arc<ReplicatedCacheStore>>,
    backstop: BackstopPolicy,
    cluster: Arc<dyn Replicator>,
    clock: Arc<dyn Clock>,
}

impl CacheManager {
    /// A manager whose replicated stores have no peers until [`with_cluster`](Self::with_cluster).
    pub fn new(backstop: BackstopPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            stores: DashMap::new(),
            backstop,
            cluster: Arc::new(NoopReplicator),
            clock,
        }
    }

    pub fn with_cluster(mut self, replicator: Arc<dyn Replicator>) -> Self {
        self.cluster = replicator;
        self
    }

    /// Returns the store for `scope`, creating it on first use.
    ///
    /// `replicated` selects the cluster replicator for a newly created store;
    /// local stores never leave this node. `capacity_hint` presizes the map.
    pub fn store(&self, scope: &str, replicated: bool, capacity_hint: usize) -> Arc<ReplicatedCacheStore> {
        let store = self
            .stores
            .entry(scope.to_string())
            .or_insert_with(|| {
                let replicator: Arc<dyn Replicator> = if replicated {
                    Arc::clone(&self.cluster)
                } else {
                    Arc::new(NoopReplicator)
                };
                info!(
                    target: "mirage::store",
                    scope = %scope,
                    replicated,
                    capacity_hint,
                    "Initializing cache store"
                );
                Arc::new(ReplicatedCacheStore::new(
                    scope,
                    self.backstop,
                    capacity_hint,
                    replicator,
                    Arc::clone(&self.clock),
                ))
            });
        Arc::clone(store.value())
    }

    pub fn get(&self, scope: &str) -> Option<Arc<ReplicatedCacheStore>> {
        self.stores.get(scope).map(|s| Arc::clone(s.value()))
    }

    pub fn stores(&self) -> Vec<Arc<ReplicatedCacheStore>> {
        self.stores.iter().map(|s| Arc::clone(s.value())).collect()
    }

    /// Routes a peer's batch to the matching store. Peers only ever send
    /// replicated scopes, so an unknown scope is created as replicated.
    pub fn apply_replica(&self, batch: ReplicationBatch) -> usize {
        if batch.scope.is_empty() {
            warn!(target: "mirage::replication", "Ignoring replication batch without scope");
            return 0;
        }
        self.store(&batch.scope, true, batch.entries.len())
            .apply_replica(batch)
    }

    /// Runs the backstop sweep over all stores once.
    pub fn sweep(&self) -> usize {
        self.stores().iter().map(|store| store.sweep()).sum()
    }

    /// Starts the background backstop sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let every = every.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                let removed = manager.sweep();
                debug!(target: "mirage::store", removed, "Backstop sweep finished");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use bytes::Bytes;

    use super::*;
    use crate::{clock::ManualClock, entry::CacheEntry, key::Fingerprint};

    fn manager(clock: Arc<ManualClock>) -> CacheManager {
        CacheManager::new(
            BackstopPolicy {
                since_write: Duration::from_secs(30),
                since_access: Duration::ZERO,
            },
            clock,
        )
    }

    #[test]
    fn same_scope_yields_same_store() {
        let manager = manager(Arc::new(ManualClock::new(0)));
        let a = manager.store("mediation.cache_key", false, 10);
        let b = manager.store("mediation.cache_key", true, 99);
        assert!(Arc::ptr_eq(&a, &b));
        let other = manager.store("mediation.cache_key_orders", false, 10);
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn concurrent_first_access_converges() {
        let manager = Arc::new(manager(Arc::new(ManualClock::new(0))));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager.store("shared", true, 4)
                })
            })
            .collect();
        let stores: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();
        assert!(stores.iter().all(|s| Arc::ptr_eq(s, &stores[0])));
        assert_eq!(manager.stores().len(), 1);
    }

    #[test]
    fn apply_replica_routes_by_scope() {
        let manager = manager(Arc::new(ManualClock::new(0)));
        let mut entry = CacheEntry::new(Fingerprint::from("abc"), Duration::from_secs(5));
        entry.populate(Bytes::from_static(b"hello"), None, 0);
        let applied = manager.apply_replica(ReplicationBatch {
            scope: "remote".into(),
            entries: vec![entry],
        });
        assert_eq!(applied, 1);
        let store = manager.get("remote").expect("created");
        assert!(store.get(&Fingerprint::from("abc")).is_some());
    }

    #[test]
    fn sweep_covers_every_store() {
        let clock = Arc::new(ManualClock::new(0));
        let manager = manager(clock.clone());
        for scope in ["a", "b"] {
            manager
                .store(scope, false, 1)
                .put(CacheEntry::new(Fingerprint::from("k"), Duration::from_secs(1)));
        }
        clock.advance(Duration::from_secs(31));
        assert_eq!(manager.sweep(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_reaps_in_background() {
        let clock = Arc::new(ManualClock::new(0));
        let manager = Arc::new(manager(clock.clone()));
        let store = manager.store("a", false, 1);
        store.put(CacheEntry::new(Fingerprint::from("k"), Duration::from_secs(1)));
        clock.advance(Duration::from_secs(31));

        let handle = manager.spawn_sweeper(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.is_empty());
        handle.abort();
    }
}
