//! Packet Broker upstream: uplinks and gateway online state go to a federated peer.

use super::{PacketBrokerClient, UpstreamHandler};
use crate::{connection::Connection, context::RequestContext};
use async_trait::async_trait;
use lora_gs_error::GSResult;
use lora_gs_models::{
    DevAddrPrefix, EndDeviceIdentifiers, GatewayIdentifiers, GatewayStatus, TxAcknowledgment,
    UplinkMessage,
};
use std::sync::Arc;
use tracing::warn;

pub struct PacketBrokerHandler {
    client: Arc<dyn PacketBrokerClient>,
    prefixes: Vec<DevAddrPrefix>,
}

impl PacketBrokerHandler {
    pub fn new(client: Arc<dyn PacketBrokerClient>, prefixes: Vec<DevAddrPrefix>) -> Self {
        Self { client, prefixes }
    }
}

#[async_trait]
impl UpstreamHandler for PacketBrokerHandler {
    fn dev_addr_prefixes(&self) -> Vec<DevAddrPrefix> {
        self.prefixes.clone()
    }

    async fn setup(&self, ctx: &RequestContext) -> GSResult<()> {
        self.client.setup(ctx).await
    }

    /// Reports the gateway online while `ctx` lives.
    async fn connect_gateway(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        conn: Arc<Connection>,
    ) -> GSResult<()> {
        self.client.update_gateway(ctx, ids, true, None).await?;
        ctx.done().await;

        let bg = RequestContext::decouple(&RequestContext::background(), ctx);
        if let Err(e) = self.client.update_gateway(&bg, ids, false, None).await {
            warn!(gateway_uid = %conn.unique_id(), error = %e, "Failed to report gateway offline");
        }
        Ok(())
    }

    async fn handle_uplink(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        _end_device_ids: &EndDeviceIdentifiers,
        msg: &UplinkMessage,
    ) -> GSResult<()> {
        self.client.publish_uplink(ctx, ids, msg).await
    }

    async fn handle_status(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        status: &GatewayStatus,
    ) -> GSResult<()> {
        self.client.update_gateway(ctx, ids, true, Some(status)).await
    }

    async fn handle_tx_ack(
        &self,
        _ctx: &RequestContext,
        _ids: &GatewayIdentifiers,
        _ack: &TxAcknowledgment,
    ) -> GSResult<()> {
        Ok(())
    }
}
