use crate::clock::{Clock, SweepSchedule};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::{hash::Hash, sync::Arc, time::Duration};

struct Slot<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// Concurrent map whose entries expire a fixed TTL after insertion.
///
/// A zero TTL disables the cache: nothing is stored and every lookup misses.
/// Expired entries are dropped on lookup and swept at most once per TTL on
/// insert, so keys that are never read again do not pile up.
pub(crate) struct TtlCache<K, V> {
    clock: Arc<dyn Clock>,
    ttl: Duration,
    slots: DashMap<K, Slot<V>>,
    sweep: SweepSchedule,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub(crate) fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            clock,
            ttl,
            slots: DashMap::new(),
            sweep: SweepSchedule::new(ttl),
        }
    }

    #[inline]
    pub(crate) fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        if !self.enabled() {
            return None;
        }
        let now = self.clock.now();
        let hit = self
            .slots
            .get(key)
            .and_then(|s| (s.expires_at > now).then(|| s.value.clone()));
        if hit.is_none() {
            self.slots.remove_if(key, |_, s| s.expires_at <= now);
        }
        hit
    }

    pub(crate) fn insert(&self, key: K, value: V) {
        if !self.enabled() {
            return;
        }
        let now = self.clock.now();
        if self.sweep.due(now) {
            self.slots.retain(|_, s| s.expires_at > now);
        }
        let ttl = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        self.slots.insert(
            key,
            Slot {
                value,
                expires_at: now + ttl,
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn invalidate_where(&self, pred: impl Fn(&K) -> bool) {
        self.slots.retain(|k, _| !pred(k));
    }
}
