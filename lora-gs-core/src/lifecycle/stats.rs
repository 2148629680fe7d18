use crate::{
    clock::Clock, connection::Connection, context::RequestContext,
    stats_registry::GatewayConnectionStatsRegistry,
};
use lora_gs_error::GSResult;
use lora_gs_models::stats::paths;
use std::{sync::Arc, time::Duration};
use tracing::{trace, warn};

pub(crate) struct StatsParams {
    pub registry: Arc<dyn GatewayConnectionStatsRegistry>,
    pub clock: Arc<dyn Clock>,
    pub debounce: Duration,
    pub ttl: Duration,
    pub disconnect_ttl: Duration,
}

/// Mirrors the connection stats into the stats registry.
///
/// The full record is written on start, then only the changed fields, at
/// most once per debounce period. On exit the record is marked disconnected
/// with the disconnect TTL.
pub(crate) async fn update_connection_stats(
    ctx: RequestContext,
    conn: Arc<Connection>,
    params: Arc<StatsParams>,
) -> GSResult<()> {
    let ids = &conn.gateway().ids;
    let uid = conn.unique_id();

    let (stats, _) = conn.stats();
    if let Err(e) = params.registry.set(&ctx, ids, &stats, paths::ALL, params.ttl).await {
        warn!(gateway_uid = %uid, error = %e, "Failed to store initial connection stats");
    }

    loop {
        tokio::select! {
            _ = ctx.done() => break,
            _ = conn.stats_changed() => {}
        }
        let (stats, changed) = conn.stats();
        if !changed.is_empty() {
            match params.registry.set(&ctx, ids, &stats, &changed, params.ttl).await {
                Ok(()) => {
                    trace!(gateway_uid = %uid, fields = changed.len(), "Connection stats stored")
                }
                Err(e) => {
                    warn!(gateway_uid = %uid, error = %e, "Failed to store connection stats")
                }
            }
        }
        tokio::select! {
            _ = ctx.done() => break,
            _ = tokio::time::sleep(params.debounce) => {}
        }
    }

    // The connection context is done; the last write must still go through.
    let bg = RequestContext::decouple(&RequestContext::background(), &ctx);
    let mut stats = conn.snapshot_stats();
    stats.connected_at = None;
    stats.disconnected_at = Some(params.clock.now());
    params
        .registry
        .set(&bg, ids, &stats, paths::ALL, params.disconnect_ttl)
        .await
}
