mod common;

use common::{eventually, gateway_ctx, registered_gateway, setup, test_config, MockFrontend};
use lora_gs_core::lifecycle::version_info::KICKSTARTER_MODEL;
use lora_gs_error::ErrorKind;
use lora_gs_models::{
    Gateway, GatewayAntenna, GatewayIdentifiers, GatewayServerConfig, GatewayStatus, Location,
    LocationSource,
};
use std::{collections::HashMap, time::Duration};

fn kickstarter_status(firmware: &str) -> GatewayStatus {
    GatewayStatus {
        platform: format!(
            "The Things Gateway v1 - BL r9-12345678 (2006-01-02T15:04:05Z) - \
             Firmware {firmware} (2006-01-02T15:04:05Z)"
        ),
        ..Default::default()
    }
}

#[tokio::test]
async fn version_info_is_stored_once() {
    let env = setup(test_config(), false).await;
    env.registry.add_gateway(registered_gateway("kickstarter"));
    let conn = env
        .server
        .connect(
            &gateway_ctx(),
            MockFrontend::new("udp"),
            GatewayIdentifiers::new("kickstarter"),
        )
        .await
        .unwrap();

    conn.handle_status(kickstarter_status("v1.2.3-12345678")).unwrap();
    eventually("attributes update", || env.registry.updates().len() == 1).await;

    let (gtw, mask) = env.registry.updates().remove(0);
    assert_eq!(mask, vec!["attributes".to_string()]);
    assert_eq!(
        gtw.attributes,
        HashMap::from([
            ("model".to_string(), KICKSTARTER_MODEL.to_string()),
            ("firmware".to_string(), "v1.2.3-12345678".to_string()),
        ])
    );

    conn.handle_status(kickstarter_status("v2.0.0-00000000")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(env.registry.updates().len(), 1);
}

#[tokio::test]
async fn matching_version_info_is_not_rewritten() {
    let env = setup(test_config(), false).await;
    env.registry.add_gateway(Gateway {
        attributes: HashMap::from([
            ("model".to_string(), KICKSTARTER_MODEL.to_string()),
            ("firmware".to_string(), "v1.2.3-12345678".to_string()),
        ]),
        ..registered_gateway("kickstarter")
    });
    let conn = env
        .server
        .connect(
            &gateway_ctx(),
            MockFrontend::new("udp"),
            GatewayIdentifiers::new("kickstarter"),
        )
        .await
        .unwrap();

    conn.handle_status(kickstarter_status("v1.2.3-12345678")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(env.registry.updates().is_empty());
}

#[tokio::test]
async fn deleted_gateway_is_disconnected() {
    let env = setup(
        GatewayServerConfig {
            fetch_gateway_interval_ms: 50,
            fetch_gateway_jitter: 0.0,
            ..test_config()
        },
        false,
    )
    .await;
    env.registry.add_gateway(registered_gateway("gtw"));
    let ctx = gateway_ctx();
    let ids = GatewayIdentifiers::new("gtw");
    let conn = env
        .server
        .connect(&ctx, MockFrontend::new("udp"), ids.clone())
        .await
        .unwrap();
    env.server.get_gateway_connection_stats(&ctx, &ids).await.unwrap();

    env.registry.delete_gateway("gtw");
    tokio::time::timeout(Duration::from_millis(500), conn.context().done())
        .await
        .expect("disconnected within the fetch interval");
    assert_eq!(
        conn.disconnect_cause().map(|e| e.kind()),
        Some(ErrorKind::PermissionDenied)
    );

    eventually("entry removed", || env.server.connection_count() == 0).await;
    let err = env
        .server
        .get_gateway_connection_stats(&ctx, &ids)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn changed_gateway_is_disconnected() {
    let env = setup(
        GatewayServerConfig {
            fetch_gateway_interval_ms: 50,
            fetch_gateway_jitter: 0.0,
            ..test_config()
        },
        false,
    )
    .await;
    env.registry.add_gateway(registered_gateway("gtw"));
    let conn = env
        .server
        .connect(&gateway_ctx(), MockFrontend::new("udp"), GatewayIdentifiers::new("gtw"))
        .await
        .unwrap();

    env.registry.add_gateway(Gateway {
        status_public: true,
        ..registered_gateway("gtw")
    });
    tokio::time::timeout(Duration::from_millis(500), conn.context().done())
        .await
        .expect("disconnected within the fetch interval");
    assert_eq!(
        conn.disconnect_cause(),
        Some(&lora_gs_error::GSError::GatewayChanged)
    );
}

#[tokio::test]
async fn reported_location_updates_registry_without_drift() {
    let env = setup(
        GatewayServerConfig {
            fetch_gateway_interval_ms: 50,
            fetch_gateway_jitter: 0.0,
            ..test_config()
        },
        false,
    )
    .await;
    env.registry.add_gateway(Gateway {
        update_location_from_status: true,
        antennas: vec![GatewayAntenna {
            gain: 3.0,
            location: Some(Location {
                latitude: 52.0,
                longitude: 4.0,
                source: LocationSource::RegistrySetByUser,
                ..Default::default()
            }),
        }],
        ..registered_gateway("gtw")
    });
    let conn = env
        .server
        .connect(&gateway_ctx(), MockFrontend::new("udp"), GatewayIdentifiers::new("gtw"))
        .await
        .unwrap();

    conn.handle_status(GatewayStatus {
        antenna_locations: vec![Location {
            latitude: 52.1,
            longitude: 4.1,
            altitude: 12,
            ..Default::default()
        }],
        ..Default::default()
    })
    .unwrap();
    eventually("antennas update", || {
        env.registry.updates().iter().any(|(_, mask)| mask == &["antennas".to_string()])
    })
    .await;

    let stored = env.registry.gateway("gtw").unwrap();
    assert_eq!(stored.antennas[0].gain, 3.0);
    let loc = stored.antennas[0].location.as_ref().unwrap();
    assert_eq!(loc.latitude, 52.1);
    assert_eq!(loc.source, LocationSource::Gps);

    // Outlast the next drift check, which sees the GPS-located record.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!conn.context().is_done());
}
