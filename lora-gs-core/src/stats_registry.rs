//! Gateway connection stats storage shared across server instances.

use crate::{
    clock::{Clock, SweepSchedule},
    context::RequestContext,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lora_gs_error::{GSError, GSResult};
use lora_gs_models::{GatewayConnectionStats, GatewayIdentifiers};
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Storage of connection stats that outlives a connection.
///
/// Lets any server instance of the cluster answer stats requests, including for
/// gateways that recently disconnected.
#[async_trait]
pub trait GatewayConnectionStatsRegistry: Send + Sync + 'static {
    /// Stats of one gateway; `NotFound` when absent or expired.
    async fn get(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
    ) -> GSResult<GatewayConnectionStats>;

    /// Overwrites the fields named by `paths` and refreshes the TTL.
    async fn set(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        stats: &GatewayConnectionStats,
        paths: &[&str],
        ttl: Duration,
    ) -> GSResult<()>;

    /// Present entries keyed by gateway id.
    async fn batch_get(
        &self,
        ctx: &RequestContext,
        ids: &[GatewayIdentifiers],
    ) -> GSResult<HashMap<String, GatewayConnectionStats>>;
}

struct Entry {
    stats: GatewayConnectionStats,
    expires_at: DateTime<Utc>,
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Process-local registry with TTL expiry.
///
/// Expired entries are dropped on read, and swept from the whole map at most
/// once a minute on write.
pub struct InMemoryStatsRegistry {
    clock: Arc<dyn Clock>,
    entries: DashMap<String, Entry>,
    sweep: SweepSchedule,
}

impl InMemoryStatsRegistry {
    /// Empty registry expiring entries by `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: DashMap::new(),
            sweep: SweepSchedule::new(SWEEP_INTERVAL),
        }
    }

    fn lookup(&self, uid: &str) -> Option<GatewayConnectionStats> {
        let now = self.clock.now();
        let live = self
            .entries
            .get(uid)
            .and_then(|e| (e.expires_at > now).then(|| e.stats.clone()));
        if live.is_none() {
            self.entries.remove_if(uid, |_, e| e.expires_at <= now);
        }
        live
    }
}

#[async_trait]
impl GatewayConnectionStatsRegistry for InMemoryStatsRegistry {
    async fn get(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
    ) -> GSResult<GatewayConnectionStats> {
        let uid = ids.unique_id(ctx.tenant_id());
        self.lookup(&uid)
            .ok_or_else(|| GSError::NotFound(format!("connection stats of `{uid}`")))
    }

    async fn set(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        stats: &GatewayConnectionStats,
        paths: &[&str],
        ttl: Duration,
    ) -> GSResult<()> {
        let uid = ids.unique_id(ctx.tenant_id());
        let now = self.clock.now();
        if self.sweep.due(now) {
            self.entries.retain(|_, e| e.expires_at > now);
        }
        let ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let expires_at = now + ttl;
        let mut entry = self.entries.entry(uid).or_insert_with(|| Entry {
            stats: GatewayConnectionStats::default(),
            expires_at,
        });
        if entry.expires_at <= now {
            entry.stats = GatewayConnectionStats::default();
        }
        entry.stats.set_fields(stats, paths);
        entry.expires_at = expires_at;
        Ok(())
    }

    async fn batch_get(
        &self,
        ctx: &RequestContext,
        ids: &[GatewayIdentifiers],
    ) -> GSResult<HashMap<String, GatewayConnectionStats>> {
        Ok(ids
            .iter()
            .filter_map(|ids| {
                self.lookup(&ids.unique_id(ctx.tenant_id()))
                    .map(|stats| (ids.gateway_id.clone(), stats))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use lora_gs_models::stats::paths;

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let clock = Arc::new(MockClock::default());
        let registry = InMemoryStatsRegistry::new(clock.clone());
        let ctx = RequestContext::background();
        let ids = GatewayIdentifiers::new("gtw-1");
        let stats = GatewayConnectionStats {
            connected_at: Some(clock.now()),
            protocol: "udp".into(),
            ..Default::default()
        };

        let fields = [paths::CONNECTED_AT, paths::PROTOCOL];
        registry
            .set(&ctx, &ids, &stats, &fields, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(registry.get(&ctx, &ids).await.unwrap().protocol, "udp");

        clock.advance(Duration::from_secs(11));
        assert!(registry.get(&ctx, &ids).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn set_merges_masked_fields() {
        let clock = Arc::new(MockClock::default());
        let registry = InMemoryStatsRegistry::new(clock.clone());
        let ctx = RequestContext::background();
        let ids = GatewayIdentifiers::new("gtw-1");
        let ttl = Duration::from_secs(60);

        let connected = GatewayConnectionStats {
            connected_at: Some(clock.now()),
            protocol: "ws".into(),
            ..Default::default()
        };
        registry
            .set(&ctx, &ids, &connected, &[paths::CONNECTED_AT, paths::PROTOCOL], ttl)
            .await
            .unwrap();
        let disconnected = GatewayConnectionStats {
            disconnected_at: Some(clock.now()),
            ..Default::default()
        };
        registry
            .set(
                &ctx,
                &ids,
                &disconnected,
                &[paths::CONNECTED_AT, paths::DISCONNECTED_AT],
                ttl,
            )
            .await
            .unwrap();

        let got = registry.get(&ctx, &ids).await.unwrap();
        assert_eq!(got.connected_at, None);
        assert!(got.disconnected_at.is_some());
        assert_eq!(got.protocol, "ws");

        let batch = registry
            .batch_get(&ctx, &[ids.clone(), GatewayIdentifiers::new("gtw-2")])
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch.contains_key("gtw-1"));
    }

    #[tokio::test]
    async fn expired_entries_of_idle_gateways_are_swept() {
        let clock = Arc::new(MockClock::default());
        let registry = InMemoryStatsRegistry::new(clock.clone());
        let ctx = RequestContext::background();
        let stats = GatewayConnectionStats::default();
        let ttl = Duration::from_secs(1);

        for i in 0..1_000 {
            let ids = GatewayIdentifiers::new(format!("gtw-{i}"));
            registry.set(&ctx, &ids, &stats, &[paths::PROTOCOL], ttl).await.unwrap();
        }
        assert_eq!(registry.entries.len(), 1_000);

        clock.advance(Duration::from_secs(3600));
        let ids = GatewayIdentifiers::new("gtw-live");
        registry.set(&ctx, &ids, &stats, &[paths::PROTOCOL], ttl).await.unwrap();
        assert_eq!(registry.entries.len(), 1);
    }
}
