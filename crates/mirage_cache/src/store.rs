use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, DashSet};
use tracing::{debug, trace};

use crate::{
    clock::{Clock, millis},
    entry::CacheEntry,
    error::CacheError,
    key::Fingerprint,
    replication::{ReplicationBatch, Replicator},
};

/// Store-level eviction, independent of each entry's own expiry.
///
/// A slot is reaped once it has gone `since_write` without a put or
/// `since_access` without a get. `Duration::ZERO` disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackstopPolicy {
    pub since_write: Duration,
    pub since_access: Duration,
}

impl Default for BackstopPolicy {
    fn default() -> Self {
        Self {
            since_write: Duration::from_secs(24 * 60 * 60),
            since_access: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl BackstopPolicy {
    fn is_stale(&self, slot: &Slot, now: u64) -> bool {
        exceeded(self.since_write, slot.written_at, now)
            || exceeded(self.since_access, slot.accessed_at, now)
    }
}

fn exceeded(limit: Duration, since: u64, now: u64) -> bool {
    !limit.is_zero() && now.saturating_sub(since) > millis(limit)
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    written_at: u64,
    accessed_at: u64,
}

/// Fingerprint → entry map shared by every mediator of one scope.
///
/// Entries go in and come out by value: `get` hands back a copy and `put`
/// replaces the stored entry wholesale. Mutations are remembered until the
/// next [`replicate`](Self::replicate).
#[derive(Debug)]
pub struct ReplicatedCacheStore {
    scope: String,
    slots: DashMap<Fingerprint, Slot>,
    dirty: DashSet<Fingerprint>,
    backstop: BackstopPolicy,
    replicator: Arc<dyn Replicator>,
    clock: Arc<dyn Clock>,
}

impl ReplicatedCacheStore {
    pub fn new(
        scope: impl Into<String>,
        backstop: BackstopPolicy,
        capacity_hint: usize,
        replicator: Arc<dyn Replicator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            scope: scope.into(),
            slots: DashMap::with_capacity(capacity_hint),
            dirty: DashSet::new(),
            backstop,
            replicator,
            clock,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn get(&self, key: &Fingerprint) -> Option<CacheEntry> {
        let now = self.clock.now_millis();
        let mut slot = self.slots.get_mut(key)?;
        if self.backstop.is_stale(&slot, now) {
            drop(slot);
            self.slots
                .remove_if(key, |_, slot| self.backstop.is_stale(slot, now));
            debug!(target: "mirage::store", scope = %self.scope, fingerprint = %key, "Backstop expired entry on read");
            return None;
        }
        slot.accessed_at = now;
        Some(slot.entry.clone())
    }

    /// Upserts `entry` under its own fingerprint. Last write wins.
    pub fn put(&self, entry: CacheEntry) {
        let now = self.clock.now_millis();
        let key = entry.fingerprint().clone();
        trace!(target: "mirage::store", scope = %self.scope, fingerprint = %key, "Storing cache entry");
        self.dirty.insert(key.clone());
        self.slots.insert(
            key,
            Slot {
                entry,
                written_at: now,
                accessed_at: now,
            },
        );
    }

    /// Flags the stored entry as being served. Returns false if it is gone.
    pub fn set_in_use(&self, key: &Fingerprint, in_use: bool) -> bool {
        match self.slots.get(key) {
            Some(slot) => {
                slot.entry.set_in_use(in_use);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Removes every slot past its backstop limits. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| !self.backstop.is_stale(slot, now));
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            debug!(target: "mirage::store", scope = %self.scope, removed, "Backstop sweep evicted entries");
        }
        removed
    }

    /// Pushes entries mutated since the last call to the replicator.
    ///
    /// On failure the keys stay marked so the next trigger retries them.
    pub fn replicate(&self) -> Result<usize, CacheError> {
        let keys: Vec<Fingerprint> = self.dirty.iter().map(|k| k.key().clone()).collect();
        if keys.is_empty() {
            return Ok(0);
        }
        for key in &keys {
            self.dirty.remove(key);
        }

        let entries: Vec<CacheEntry> = keys
            .iter()
            .filter_map(|key| self.slots.get(key).map(|slot| slot.entry.clone()))
            .collect();
        let batch = ReplicationBatch {
            scope: self.scope.clone(),
            entries,
        };

        if let Err(err) = self.replicator.replicate(&batch) {
            for key in keys {
                self.dirty.insert(key);
            }
            return Err(err);
        }
        Ok(batch.entries.len())
    }

    /// Installs entries received from a peer without re-marking them for replication.
    pub fn apply_replica(&self, batch: ReplicationBatch) -> usize {
        let now = self.clock.now_millis();
        let applied = batch.entries.len();
        for entry in batch.entries {
            self.slots.insert(
                entry.fingerprint().clone(),
                Slot {
                    entry,
                    written_at: now,
                    accessed_at: now,
                },
            );
        }
        applied
    }
}
