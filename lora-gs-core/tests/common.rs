#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use lora_gs_core::{
    context::RequestValues, Clock, EntityRegistryClient, Frontend,
    GatewayConnectionStatsRegistry, GatewayServer, GatewayServerParams, InMemoryFrequencyPlans,
    InMemoryStatsRegistry, NetworkServerClient, PacketBrokerClient, RequestContext, SystemClock,
};
use lora_gs_error::{GSError, GSResult};
use lora_gs_models::{
    settings::Inner, DataRate, DownlinkMessage, Eui64, Gateway, GatewayIdentifiers,
    GatewayServerConfig, GatewayStatus, GatewayUplinkMessage, Right, Settings, TxAcknowledgment,
    TxSettings, UplinkMessage,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, Once,
    },
    time::Duration,
};
use tracing::Level;

pub const API_KEY: &str = "NNSXS.GATEWAY-KEY";
pub const EU_PLAN: &str = "EU_863_870";

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_target(false)
            .without_time()
            .with_test_writer()
            .try_init();
    });
}

/// Polls `f` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, f: impl Fn() -> bool) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Context of a gateway presenting [`API_KEY`].
pub fn gateway_ctx() -> RequestContext {
    RequestContext::new(RequestValues {
        credentials: Some(API_KEY.into()),
        ..Default::default()
    })
}

/// Context of an unauthenticated transport that vouches for its gateways.
pub fn unauthenticated_ctx(fallback_plan: Option<&str>) -> RequestContext {
    RequestContext::new(RequestValues {
        granted_rights: vec![Right::GatewayLink, Right::GatewayStatusRead],
        fallback_frequency_plan_id: fallback_plan.map(Into::into),
        ..Default::default()
    })
}

pub fn cluster_ctx() -> RequestContext {
    RequestContext::new(RequestValues {
        cluster_peer: true,
        ..Default::default()
    })
}

pub fn registered_gateway(gateway_id: &str) -> Gateway {
    Gateway {
        ids: GatewayIdentifiers::new(gateway_id),
        frequency_plan_id: EU_PLAN.into(),
        enforce_duty_cycle: true,
        ..Default::default()
    }
}

/// Unconfirmed data uplink from `dev_addr` with an empty FRMPayload.
pub fn data_uplink(dev_addr: u32) -> GatewayUplinkMessage {
    let mut raw = vec![0x40];
    raw.extend_from_slice(&dev_addr.to_le_bytes());
    raw.extend_from_slice(&[0x00, 0x01, 0x00]);
    raw.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    uplink(raw)
}

pub fn uplink(raw_payload: Vec<u8>) -> GatewayUplinkMessage {
    GatewayUplinkMessage {
        message: UplinkMessage {
            raw_payload,
            payload: None,
            settings: lora_settings(868_100_000),
            rx_metadata: vec![],
            received_at: Utc::now(),
            correlation_ids: vec![],
        },
        band_id: EU_PLAN.into(),
    }
}

pub fn lora_settings(frequency: u64) -> TxSettings {
    TxSettings {
        data_rate: DataRate::Lora {
            spreading_factor: 7,
            bandwidth: 125_000,
            coding_rate: "4/5".into(),
        },
        frequency,
        time: None,
        timestamp: None,
        enable_crc: true,
    }
}

pub struct MockFrontend {
    protocol: &'static str,
    claims_downlink: bool,
    pub sent: Mutex<Vec<DownlinkMessage>>,
}

impl MockFrontend {
    pub fn new(protocol: &'static str) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            claims_downlink: false,
            sent: Mutex::new(vec![]),
        })
    }

    pub fn sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Frontend for MockFrontend {
    fn protocol(&self) -> &str {
        self.protocol
    }

    fn supports_downlink_claim(&self) -> bool {
        self.claims_downlink
    }

    async fn send_down(&self, msg: &DownlinkMessage) -> GSResult<()> {
        self.sent.lock().unwrap().push(msg.clone());
        Ok(())
    }
}

/// Entity registry keeping gateways and API keys in memory.
#[derive(Default)]
pub struct MockEntityRegistry {
    gateways: DashMap<String, Gateway>,
    euis: DashMap<Eui64, GatewayIdentifiers>,
    keys: DashMap<String, Vec<Right>>,
    pub gets: AtomicUsize,
    pub updates: Mutex<Vec<(Gateway, Vec<String>)>>,
}

impl MockEntityRegistry {
    pub fn new() -> Arc<Self> {
        let registry = Self::default();
        registry.keys.insert(API_KEY.into(), vec![Right::GatewayAll]);
        Arc::new(registry)
    }

    pub fn add_gateway(&self, gtw: Gateway) {
        if let Some(eui) = gtw.ids.eui {
            self.euis.insert(eui, gtw.ids.clone());
        }
        self.gateways.insert(gtw.ids.gateway_id.clone(), gtw);
    }

    pub fn delete_gateway(&self, gateway_id: &str) {
        self.gateways.remove(gateway_id);
        self.euis.retain(|_, ids| ids.gateway_id != gateway_id);
    }

    pub fn gateway(&self, gateway_id: &str) -> Option<Gateway> {
        self.gateways.get(gateway_id).map(|g| g.clone())
    }

    /// Number of `get_gateway` calls that reached the registry.
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> Vec<(Gateway, Vec<String>)> {
        self.updates.lock().unwrap().clone()
    }

    fn rights(&self, ctx: &RequestContext) -> GSResult<Vec<Right>> {
        let key = ctx.values().credentials.as_deref().ok_or(GSError::Unauthenticated)?;
        self.keys
            .get(key)
            .map(|r| r.clone())
            .ok_or(GSError::Unauthenticated)
    }
}

#[async_trait]
impl EntityRegistryClient for MockEntityRegistry {
    async fn get_gateway(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        field_mask: &[&str],
    ) -> GSResult<Gateway> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        match self.gateways.get(&ids.gateway_id) {
            Some(gtw) => Ok(gtw.masked(field_mask)),
            // Authenticated callers cannot tell a missing gateway from a forbidden one.
            None if ctx.is_authenticated() => Err(GSError::PermissionDenied(format!(
                "gateway `{}`",
                ids.gateway_id
            ))),
            None => Err(GSError::NotFound(format!("gateway `{}`", ids.gateway_id))),
        }
    }

    async fn get_identifiers_for_eui(
        &self,
        _ctx: &RequestContext,
        eui: &Eui64,
    ) -> GSResult<GatewayIdentifiers> {
        self.euis
            .get(eui)
            .map(|ids| ids.clone())
            .ok_or_else(|| GSError::NotFound(format!("EUI `{eui}`")))
    }

    async fn update_gateway(
        &self,
        _ctx: &RequestContext,
        gateway: &Gateway,
        field_mask: &[&str],
    ) -> GSResult<Gateway> {
        let mut stored = self
            .gateways
            .get_mut(&gateway.ids.gateway_id)
            .ok_or_else(|| GSError::NotFound(format!("gateway `{}`", gateway.ids.gateway_id)))?;
        for field in field_mask {
            match *field {
                "antennas" => stored.antennas = gateway.antennas.clone(),
                "attributes" => stored.attributes = gateway.attributes.clone(),
                other => return Err(GSError::InvalidArgument(format!("field `{other}`"))),
            }
        }
        self.updates.lock().unwrap().push((
            gateway.clone(),
            field_mask.iter().map(|f| f.to_string()).collect(),
        ));
        Ok(stored.clone())
    }

    async fn list_rights(
        &self,
        ctx: &RequestContext,
        _ids: &GatewayIdentifiers,
    ) -> GSResult<Vec<Right>> {
        self.rights(ctx)
    }

    async fn assert_batch_rights(
        &self,
        ctx: &RequestContext,
        _ids: &[GatewayIdentifiers],
        required: &[Right],
    ) -> GSResult<()> {
        let held = self.rights(ctx)?;
        if required.iter().all(|r| held.iter().any(|h| h.implies(*r))) {
            Ok(())
        } else {
            Err(GSError::PermissionDenied("batch".into()))
        }
    }
}

#[derive(Default)]
pub struct RecordingNetworkServer {
    pub uplinks: Mutex<Vec<UplinkMessage>>,
    pub tx_acks: Mutex<Vec<TxAcknowledgment>>,
    pub claims: AtomicUsize,
    pub unclaims: AtomicUsize,
    /// Returned by `handle_uplink` when set.
    pub uplink_error: Mutex<Option<GSError>>,
}

impl RecordingNetworkServer {
    pub fn uplinks(&self) -> usize {
        self.uplinks.lock().unwrap().len()
    }
}

#[async_trait]
impl NetworkServerClient for RecordingNetworkServer {
    async fn handle_uplink(&self, _ctx: &RequestContext, msg: &UplinkMessage) -> GSResult<()> {
        self.uplinks.lock().unwrap().push(msg.clone());
        match self.uplink_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn report_tx_acknowledgment(
        &self,
        _ctx: &RequestContext,
        ack: &TxAcknowledgment,
    ) -> GSResult<()> {
        self.tx_acks.lock().unwrap().push(ack.clone());
        Ok(())
    }

    async fn claim_downlink(
        &self,
        _ctx: &RequestContext,
        _ids: &GatewayIdentifiers,
    ) -> GSResult<()> {
        self.claims.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unclaim_downlink(
        &self,
        _ctx: &RequestContext,
        _ids: &GatewayIdentifiers,
    ) -> GSResult<()> {
        self.unclaims.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPacketBroker {
    pub uplinks: Mutex<Vec<UplinkMessage>>,
    pub statuses: Mutex<Vec<GatewayStatus>>,
    /// Online flags in the order they were reported.
    pub online: Mutex<Vec<bool>>,
}

impl RecordingPacketBroker {
    pub fn uplinks(&self) -> usize {
        self.uplinks.lock().unwrap().len()
    }
}

#[async_trait]
impl PacketBrokerClient for RecordingPacketBroker {
    async fn publish_uplink(
        &self,
        _ctx: &RequestContext,
        _ids: &GatewayIdentifiers,
        msg: &UplinkMessage,
    ) -> GSResult<()> {
        self.uplinks.lock().unwrap().push(msg.clone());
        Ok(())
    }

    async fn update_gateway(
        &self,
        _ctx: &RequestContext,
        _ids: &GatewayIdentifiers,
        online: bool,
        status: Option<&GatewayStatus>,
    ) -> GSResult<()> {
        match status {
            Some(status) => self.statuses.lock().unwrap().push(status.clone()),
            None => self.online.lock().unwrap().push(online),
        }
        Ok(())
    }
}

pub struct TestEnv {
    pub server: GatewayServer,
    pub registry: Arc<MockEntityRegistry>,
    pub ns: Arc<RecordingNetworkServer>,
    pub pb: Arc<RecordingPacketBroker>,
}

/// Settings tuned for tests: no registry cache and no version-info delay.
pub fn test_config() -> GatewayServerConfig {
    GatewayServerConfig {
        entity_registry_cache_ttl_ms: 0,
        update_version_info_delay_ms: 0,
        update_connection_stats_debounce_time_ms: 0,
        forward: HashMap::from([
            (String::new(), vec!["00000000/0".to_string()]),
            ("packetbroker".to_string(), vec!["00000000/0".to_string()]),
        ]),
        ..Default::default()
    }
}

pub async fn setup(config: GatewayServerConfig, with_stats_registry: bool) -> TestEnv {
    setup_with_clock(config, with_stats_registry, None).await
}

pub async fn setup_with_clock(
    config: GatewayServerConfig,
    with_stats_registry: bool,
    clock: Option<Arc<dyn Clock>>,
) -> TestEnv {
    init_tracing();
    let registry = MockEntityRegistry::new();
    let ns = Arc::new(RecordingNetworkServer::default());
    let pb = Arc::new(RecordingPacketBroker::default());
    let server = GatewayServer::new(GatewayServerParams {
        settings: Settings::from_inner(Inner {
            gateway_server: config,
        }),
        entity_registry: registry.clone(),
        stats_registry: with_stats_registry
            .then(|| {
                Arc::new(InMemoryStatsRegistry::new(Arc::new(SystemClock)))
                    as Arc<dyn GatewayConnectionStatsRegistry>
            }),
        frequency_plans: Arc::new(InMemoryFrequencyPlans::with_defaults()),
        network_server: Some(ns.clone()),
        packet_broker: Some(pb.clone()),
        clock,
    })
    .await
    .expect("server starts");
    TestEnv {
        server,
        registry,
        ns,
        pb,
    }
}
