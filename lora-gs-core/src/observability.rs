//! Gateway events and counters.
//!
//! Every `register_*` helper emits a `tracing` event, bumps an atomic counter
//! and publishes a [`GatewayEvent`] on a broadcast hub. Slow subscribers lag
//! and skip events; publishers never block.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lora_gs_error::GSError;
use lora_gs_models::{GatewayStatus, GatewayUplinkMessage, TxAckResult, TxAcknowledgment};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::broadcast;
use tracing::{debug, info, trace};
use uuid::Uuid;

pub const EVT_GATEWAY_CONNECT: &str = "gs.gateway.connect";
pub const EVT_GATEWAY_DISCONNECT: &str = "gs.gateway.disconnect";
pub const EVT_UP_RECEIVE: &str = "gs.up.receive";
pub const EVT_UP_FORWARD: &str = "gs.up.forward";
pub const EVT_UP_DROP: &str = "gs.up.drop";
pub const EVT_STATUS_RECEIVE: &str = "gs.status.receive";
pub const EVT_STATUS_FORWARD: &str = "gs.status.forward";
pub const EVT_STATUS_DROP: &str = "gs.status.drop";
pub const EVT_TXACK_RECEIVE: &str = "gs.txack.receive";
pub const EVT_TXACK_FORWARD: &str = "gs.txack.forward";
pub const EVT_TXACK_DROP: &str = "gs.txack.drop";
pub const EVT_DOWN_TX_SUCCESS: &str = "gs.down.tx.success";
pub const EVT_DOWN_TX_FAIL: &str = "gs.down.tx.fail";

const EVENT_BUFFER: usize = 1024;

/// Unique correlation id with a component prefix, e.g. `gs:uplink:<uuid>`.
pub fn new_correlation_id(prefix: &str) -> String {
    format!("{prefix}:{}", Uuid::new_v4())
}

/// Event published for subscribers of [`Observability::subscribe`].
///
/// Serializes to JSON for event sinks; `data` carries event-specific details such
/// as a disconnect cause or a drop reason.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayEvent {
    pub name: &'static str,
    pub gateway_uid: String,
    pub time: DateTime<Utc>,
    pub correlation_ids: Vec<String>,
    pub data: Option<Value>,
}

/// Event hub and counters of the gateway server.
pub struct Observability {
    events: broadcast::Sender<Arc<GatewayEvent>>,
    /// Counters keyed by event name and label (host, protocol or reason).
    counters: DashMap<(&'static str, String), AtomicU64>,
}

impl Default for Observability {
    fn default() -> Self {
        Self::new()
    }
}

impl Observability {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(EVENT_BUFFER);
        Self {
            events,
            counters: DashMap::new(),
        }
    }

    /// New receiver of every event published from now on.
    ///
    /// A receiver falling more than 1024 events behind skips the oldest ones.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<GatewayEvent>> {
        self.events.subscribe()
    }

    /// Current value of the counter for `name` and `label`.
    pub fn counter(&self, name: &'static str, label: &str) -> u64 {
        self.counters
            .get(&(name, label.to_string()))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn record(
        &self,
        name: &'static str,
        label: &str,
        gateway_uid: &str,
        correlation_ids: &[String],
        data: Option<Value>,
    ) {
        self.counters
            .entry((name, label.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(Arc::new(GatewayEvent {
            name,
            gateway_uid: gateway_uid.to_string(),
            time: Utc::now(),
            correlation_ids: correlation_ids.to_vec(),
            data,
        }));
    }

    pub fn register_gateway_connect(&self, gateway_uid: &str, protocol: &str) {
        info!(gateway_uid, protocol, "Gateway connected");
        self.record(EVT_GATEWAY_CONNECT, protocol, gateway_uid, &[], None);
    }

    pub fn register_gateway_disconnect(
        &self,
        gateway_uid: &str,
        protocol: &str,
        cause: Option<&GSError>,
    ) {
        let cause = cause.map(ToString::to_string);
        info!(gateway_uid, protocol, cause = cause.as_deref(), "Gateway disconnected");
        let data = cause.map(|c| json!({ "cause": c }));
        self.record(EVT_GATEWAY_DISCONNECT, protocol, gateway_uid, &[], data);
    }

    pub fn register_receive_uplink(
        &self,
        gateway_uid: &str,
        msg: &GatewayUplinkMessage,
        protocol: &str,
    ) {
        trace!(gateway_uid, protocol, "Uplink received");
        let cids = &msg.message.correlation_ids;
        self.record(EVT_UP_RECEIVE, protocol, gateway_uid, cids, None);
    }

    pub fn register_forward_uplink(
        &self,
        gateway_uid: &str,
        msg: &GatewayUplinkMessage,
        host: &str,
    ) {
        debug!(gateway_uid, host, "Uplink forwarded");
        let cids = &msg.message.correlation_ids;
        self.record(EVT_UP_FORWARD, host, gateway_uid, cids, None);
    }

    /// `host` is the upstream name, or the drop reason when no host was involved.
    pub fn register_drop_uplink(
        &self,
        gateway_uid: &str,
        msg: &GatewayUplinkMessage,
        host: &str,
        err: &GSError,
    ) {
        debug!(gateway_uid, host, error = %err, "Uplink dropped");
        let cids = &msg.message.correlation_ids;
        let data = json!({ "error": err.to_string(), "kind": err.kind().to_string() });
        self.record(EVT_UP_DROP, host, gateway_uid, cids, Some(data));
    }

    pub fn register_receive_status(
        &self,
        gateway_uid: &str,
        status: &GatewayStatus,
        protocol: &str,
    ) {
        trace!(gateway_uid, protocol, "Status received");
        self.record(EVT_STATUS_RECEIVE, protocol, gateway_uid, &status.correlation_ids, None);
    }

    pub fn register_forward_status(&self, gateway_uid: &str, status: &GatewayStatus, host: &str) {
        debug!(gateway_uid, host, "Status forwarded");
        self.record(EVT_STATUS_FORWARD, host, gateway_uid, &status.correlation_ids, None);
    }

    pub fn register_drop_status(
        &self,
        gateway_uid: &str,
        status: &GatewayStatus,
        host: &str,
        err: &GSError,
    ) {
        debug!(gateway_uid, host, error = %err, "Status dropped");
        let data = json!({ "error": err.to_string(), "kind": err.kind().to_string() });
        self.record(EVT_STATUS_DROP, host, gateway_uid, &status.correlation_ids, Some(data));
    }

    pub fn register_receive_tx_ack(
        &self,
        gateway_uid: &str,
        ack: &TxAcknowledgment,
        protocol: &str,
    ) {
        trace!(gateway_uid, protocol, "Tx acknowledgment received");
        self.record(EVT_TXACK_RECEIVE, protocol, gateway_uid, &ack.correlation_ids, None);
    }

    pub fn register_forward_tx_ack(&self, gateway_uid: &str, ack: &TxAcknowledgment, host: &str) {
        debug!(gateway_uid, host, "Tx acknowledgment forwarded");
        self.record(EVT_TXACK_FORWARD, host, gateway_uid, &ack.correlation_ids, None);
    }

    pub fn register_drop_tx_ack(
        &self,
        gateway_uid: &str,
        ack: &TxAcknowledgment,
        host: &str,
        err: &GSError,
    ) {
        debug!(gateway_uid, host, error = %err, "Tx acknowledgment dropped");
        let data = json!({ "error": err.to_string(), "kind": err.kind().to_string() });
        self.record(EVT_TXACK_DROP, host, gateway_uid, &ack.correlation_ids, Some(data));
    }

    pub fn register_success_downlink(
        &self,
        gateway_uid: &str,
        ack: &TxAcknowledgment,
        protocol: &str,
    ) {
        debug!(gateway_uid, protocol, "Downlink transmitted");
        self.record(EVT_DOWN_TX_SUCCESS, protocol, gateway_uid, &ack.correlation_ids, None);
    }

    pub fn register_fail_downlink(
        &self,
        gateway_uid: &str,
        ack: &TxAcknowledgment,
        protocol: &str,
    ) {
        debug!(gateway_uid, protocol, result = ?ack.result, "Downlink transmission failed");
        let data = json!({ "result": format!("{:?}", ack.result) });
        self.record(EVT_DOWN_TX_FAIL, protocol, gateway_uid, &ack.correlation_ids, Some(data));
    }

    /// Routes a tx acknowledgment to the success or failure counter.
    pub fn register_tx_ack_result(
        &self,
        gateway_uid: &str,
        ack: &TxAcknowledgment,
        protocol: &str,
    ) {
        if ack.result == TxAckResult::Success {
            self.register_success_downlink(gateway_uid, ack, protocol)
        } else {
            self.register_fail_downlink(gateway_uid, ack, protocol)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registrations_count_and_publish() {
        let obs = Observability::new();
        let mut rx = obs.subscribe();
        let ack = TxAcknowledgment {
            result: TxAckResult::TooLate,
            correlation_ids: vec!["gs:txack:1".into()],
            ..Default::default()
        };
        obs.register_tx_ack_result("gtw", &ack, "udp");
        obs.register_gateway_connect("gtw", "udp");

        assert_eq!(obs.counter(EVT_DOWN_TX_FAIL, "udp"), 1);
        assert_eq!(obs.counter(EVT_DOWN_TX_SUCCESS, "udp"), 0);
        assert_eq!(obs.counter(EVT_GATEWAY_CONNECT, "udp"), 1);

        let evt = rx.recv().await.unwrap();
        assert_eq!(evt.name, EVT_DOWN_TX_FAIL);
        assert_eq!(evt.correlation_ids, vec!["gs:txack:1".to_string()]);
        assert_eq!(rx.recv().await.unwrap().name, EVT_GATEWAY_CONNECT);
    }

    #[test]
    fn correlation_ids_are_prefixed_and_unique() {
        let a = new_correlation_id("gs:uplink");
        let b = new_correlation_id("gs:uplink");
        assert!(a.starts_with("gs:uplink:"));
        assert_ne!(a, b);
    }
}
