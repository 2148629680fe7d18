use crate::{connection::Connection, context::RequestContext, entity::EntityRegistry};
use lora_gs_error::GSResult;
use lora_gs_models::{GatewayAntenna, Location, LocationSource};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

/// Registry antennas with the reported locations applied, one slot per index.
pub(crate) fn merge_antennas(
    registry: &[GatewayAntenna],
    reported: &[Location],
) -> Vec<GatewayAntenna> {
    let n = registry.len().max(reported.len());
    (0..n)
        .map(|i| {
            let mut antenna = registry.get(i).cloned().unwrap_or_default();
            if let Some(loc) = reported.get(i) {
                antenna.location = Some(Location {
                    source: LocationSource::Gps,
                    ..loc.clone()
                });
            }
            antenna
        })
        .collect()
}

/// Pushes antenna locations reported in status messages to the registry.
pub(crate) async fn update_location(
    ctx: RequestContext,
    conn: Arc<Connection>,
    entity_registry: Arc<EntityRegistry>,
    debounce: Duration,
) -> GSResult<()> {
    let ids = &conn.gateway().ids;
    let mut last: Option<Vec<GatewayAntenna>> = None;
    loop {
        tokio::select! {
            _ = ctx.done() => return Ok(()),
            _ = conn.location_changed() => {}
        }
        let Some((status, _)) = conn.status_stats() else {
            continue;
        };
        if status.antenna_locations.is_empty() {
            continue;
        }
        let antennas = merge_antennas(&conn.gateway().antennas, &status.antenna_locations);
        if last.as_ref() == Some(&antennas) {
            continue;
        }
        match entity_registry.update_antennas(&ctx, ids, antennas.clone()).await {
            Ok(()) => {
                info!(
                    gateway_uid = %conn.unique_id(),
                    antennas = antennas.len(),
                    "Gateway location updated"
                );
                last = Some(antennas);
            }
            Err(e) => warn!(
                gateway_uid = %conn.unique_id(),
                error = %e,
                "Failed to update gateway location"
            ),
        }
        tokio::select! {
            _ = ctx.done() => return Ok(()),
            _ = tokio::time::sleep(debounce) => {}
        }
    }
}
