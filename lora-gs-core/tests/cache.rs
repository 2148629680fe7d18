mod common;

use common::{
    gateway_ctx, registered_gateway, setup_with_clock, test_config, MockFrontend, TestEnv,
};
use lora_gs_core::{Clock, MockClock};
use lora_gs_error::{ErrorKind, GSError};
use lora_gs_models::{Gateway, GatewayIdentifiers, GatewayServerConfig};
use std::{sync::Arc, time::Duration};

const CACHE_TTL: Duration = Duration::from_secs(60);

async fn cached_env(config: GatewayServerConfig) -> (TestEnv, Arc<MockClock>) {
    let clock = Arc::new(MockClock::default());
    let env = setup_with_clock(
        GatewayServerConfig {
            entity_registry_cache_ttl_ms: CACHE_TTL.as_millis() as u64,
            ..config
        },
        false,
        Some(clock.clone() as Arc<dyn Clock>),
    )
    .await;
    env.registry.add_gateway(registered_gateway("gtw"));
    (env, clock)
}

fn drift_config() -> GatewayServerConfig {
    GatewayServerConfig {
        fetch_gateway_interval_ms: 50,
        fetch_gateway_jitter: 0.0,
        ..test_config()
    }
}

#[tokio::test]
async fn gateway_lookups_are_cached_until_ttl() {
    let (env, clock) = cached_env(test_config()).await;
    let ctx = gateway_ctx();
    let ids = GatewayIdentifiers::new("gtw");

    env.server
        .connect(&ctx, MockFrontend::new("udp"), ids.clone())
        .await
        .unwrap();
    assert_eq!(env.registry.gets(), 1);

    env.server.get_frequency_plans(&ctx, &ids).await.unwrap();
    assert_eq!(env.registry.gets(), 2);
    env.server.get_frequency_plans(&ctx, &ids).await.unwrap();
    env.server
        .connect(&ctx, MockFrontend::new("udp"), ids.clone())
        .await
        .unwrap();
    assert_eq!(env.registry.gets(), 2);

    clock.advance(CACHE_TTL);
    env.server.get_frequency_plans(&ctx, &ids).await.unwrap();
    assert_eq!(env.registry.gets(), 3);
}

#[tokio::test]
async fn deleted_gateway_is_disconnected_with_warm_cache() {
    let (env, _clock) = cached_env(drift_config()).await;
    let ctx = gateway_ctx();
    let ids = GatewayIdentifiers::new("gtw");
    let conn = env
        .server
        .connect(&ctx, MockFrontend::new("udp"), ids.clone())
        .await
        .unwrap();

    env.registry.delete_gateway("gtw");
    tokio::time::timeout(Duration::from_millis(500), conn.context().done())
        .await
        .expect("disconnected within the fetch interval");
    assert_eq!(
        conn.disconnect_cause().map(|e| e.kind()),
        Some(ErrorKind::PermissionDenied)
    );

    // The failed fetch evicted the cached connect record.
    let err = env
        .server
        .connect(&ctx, MockFrontend::new("udp"), ids)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn changed_gateway_is_disconnected_with_warm_cache() {
    let (env, _clock) = cached_env(drift_config()).await;
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
    assert_eq!(conn.disconnect_cause(), Some(&GSError::GatewayChanged));
}
