use async_trait::async_trait;
use lora_gs_error::GSResult;
use lora_gs_models::DownlinkMessage;

/// Transport adapter owning the link to one gateway (UDP packet forwarder,
/// MQTT, Basics Station, gRPC stream).
#[async_trait]
pub trait Frontend: Send + Sync + 'static {
    /// Short protocol name used in stats and metrics, e.g. `udp`.
    fn protocol(&self) -> &str;

    /// Whether the transport claims the downlink path of its gateways itself.
    fn supports_downlink_claim(&self) -> bool;

    /// Writes an admitted downlink to the gateway.
    async fn send_down(&self, msg: &DownlinkMessage) -> GSResult<()>;
}
