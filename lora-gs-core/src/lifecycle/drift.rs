use crate::{connection::Connection, context::RequestContext, entity::EntityRegistry, random};
use lora_gs_error::{GSError, GSResult};
use lora_gs_models::{
    gateway::CONNECT_FIELD_MASK, Gateway, GatewayAntenna, Location, LocationSource,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

const LOCATION_TOLERANCE: f64 = 1e-5;

fn same_location(a: Option<&Location>, b: Option<&Location>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            (a.latitude - b.latitude).abs() <= LOCATION_TOLERANCE
                && (a.longitude - b.longitude).abs() <= LOCATION_TOLERANCE
                && a.altitude == b.altitude
                && a.accuracy == b.accuracy
        }
        _ => false,
    }
}

fn same_antenna_locations(a: &[GatewayAntenna], b: &[GatewayAntenna]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(a, b)| same_location(a.location.as_ref(), b.location.as_ref()))
}

/// Whether a connection made with the `connected` record has to be dropped
/// now that the registry holds `current`.
///
/// Antenna differences are ignored when the first antenna of `current` was
/// located by GPS: such locations come from the gateway's own status messages.
pub fn require_disconnect(connected: &Gateway, current: &Gateway) -> bool {
    if connected.downlink_path_constraint != current.downlink_path_constraint
        || connected.disable_packet_broker_forwarding != current.disable_packet_broker_forwarding
        || connected.enforce_duty_cycle != current.enforce_duty_cycle
        || connected.location_public != current.location_public
        || connected.require_authenticated_connection != current.require_authenticated_connection
        || connected.schedule_anytime_delay != current.schedule_anytime_delay
        || connected.schedule_downlink_late != current.schedule_downlink_late
        || connected.status_public != current.status_public
        || connected.update_location_from_status != current.update_location_from_status
        || connected.frequency_plan_id != current.frequency_plan_id
        || connected.frequency_plan_ids != current.frequency_plan_ids
    {
        return true;
    }
    let gps_located = current
        .antennas
        .first()
        .and_then(|a| a.location.as_ref())
        .is_some_and(|l| l.source == LocationSource::Gps);
    !gps_located && !same_antenna_locations(&connected.antennas, &current.antennas)
}

/// One drift check: waits a jittered interval, then compares the registry
/// record with the one the connection was made with.
///
/// The record is always fetched past the lookup cache.
///
/// Revoked access and changed records disconnect the gateway. Other fetch
/// errors are returned so the runner retries with backoff.
pub(crate) async fn detect_drift(
    ctx: RequestContext,
    conn: Arc<Connection>,
    entity_registry: Arc<EntityRegistry>,
    interval: Duration,
    jitter: f64,
) -> GSResult<()> {
    tokio::select! {
        _ = ctx.done() => return Ok(()),
        _ = tokio::time::sleep(random::jitter(interval, jitter)) => {}
    }

    let ids = &conn.gateway().ids;
    let current = match entity_registry.refresh(&ctx, ids, CONNECT_FIELD_MASK).await {
        Ok(gtw) => gtw,
        Err(e) if e.is_access_revoked() => {
            info!(gateway_uid = %conn.unique_id(), error = %e, "Gateway access revoked");
            conn.disconnect(e);
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    if require_disconnect(conn.gateway(), &current) {
        conn.disconnect(GSError::GatewayChanged);
    } else {
        debug!(gateway_uid = %conn.unique_id(), "Gateway record unchanged");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lora_gs_models::{DownlinkPathConstraint, GatewayIdentifiers};

    fn gateway() -> Gateway {
        Gateway {
            ids: GatewayIdentifiers::new("gtw"),
            frequency_plan_id: "EU_863_870".into(),
            antennas: vec![GatewayAntenna {
                gain: 3.0,
                location: Some(Location {
                    latitude: 52.37,
                    longitude: 4.89,
                    altitude: 10,
                    accuracy: 5,
                    source: LocationSource::RegistrySetByUser,
                }),
            }],
            ..Default::default()
        }
    }

    fn moved(source: LocationSource, d: f64) -> Gateway {
        let mut g = gateway();
        let loc = g.antennas[0].location.as_mut().unwrap();
        loc.latitude += d;
        loc.source = source;
        g
    }

    #[test]
    fn watched_fields_trigger_disconnect() {
        let a = gateway();
        assert!(!require_disconnect(&a, &a.clone()));

        let mut b = a.clone();
        b.downlink_path_constraint = DownlinkPathConstraint::Never;
        assert!(require_disconnect(&a, &b));

        let mut b = a.clone();
        b.schedule_anytime_delay = Some(Duration::from_millis(530));
        assert!(require_disconnect(&a, &b));

        let mut b = a.clone();
        b.frequency_plan_ids = vec!["US_902_928_FSB_2".into()];
        assert!(require_disconnect(&a, &b));
    }

    #[test]
    fn unwatched_fields_are_ignored() {
        let a = gateway();
        let mut b = a.clone();
        b.attributes.insert("model".into(), "x".into());
        b.antennas[0].gain = 6.0;
        assert!(!require_disconnect(&a, &b));
    }

    #[test]
    fn antenna_locations_use_tolerance() {
        let a = gateway();
        let src = LocationSource::RegistrySetByUser;
        assert!(!require_disconnect(&a, &moved(src, 1e-6)));
        assert!(require_disconnect(&a, &moved(src, 1e-3)));

        let mut b = a.clone();
        b.antennas[0].location.as_mut().unwrap().altitude = 11;
        assert!(require_disconnect(&a, &b));

        let mut b = a.clone();
        b.antennas.push(GatewayAntenna::default());
        assert!(require_disconnect(&a, &b));
    }

    #[test]
    fn gps_located_antennas_are_ignored() {
        let a = gateway();
        assert!(!require_disconnect(&a, &moved(LocationSource::Gps, 1.0)));

        let mut b = moved(LocationSource::Gps, 1.0);
        b.antennas.push(GatewayAntenna::default());
        assert!(!require_disconnect(&a, &b));
    }
}
