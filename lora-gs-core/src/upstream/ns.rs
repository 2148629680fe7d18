//! Cluster Network Server upstream.

use super::{NetworkServerClient, UpstreamHandler};
use crate::{connection::Connection, context::RequestContext};
use async_trait::async_trait;
use lora_gs_error::GSResult;
use lora_gs_models::{
    DevAddrPrefix, EndDeviceIdentifiers, GatewayIdentifiers, GatewayStatus, TxAcknowledgment,
    UplinkMessage,
};
use std::sync::Arc;
use tracing::{info, warn};

pub struct NsHandler {
    client: Arc<dyn NetworkServerClient>,
    prefixes: Vec<DevAddrPrefix>,
}

impl NsHandler {
    pub fn new(client: Arc<dyn NetworkServerClient>, prefixes: Vec<DevAddrPrefix>) -> Self {
        Self { client, prefixes }
    }
}

#[async_trait]
impl UpstreamHandler for NsHandler {
    fn dev_addr_prefixes(&self) -> Vec<DevAddrPrefix> {
        self.prefixes.clone()
    }

    async fn setup(&self, _ctx: &RequestContext) -> GSResult<()> {
        Ok(())
    }

    /// Claims the downlink path for the lifetime of `ctx`, unless the
    /// frontend manages claims itself.
    async fn connect_gateway(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        conn: Arc<Connection>,
    ) -> GSResult<()> {
        if conn.frontend().supports_downlink_claim() {
            return Ok(());
        }
        self.client.claim_downlink(ctx, ids).await?;
        info!(gateway_uid = %conn.unique_id(), "Downlink path claimed");

        ctx.done().await;

        // The connection context is gone by now.
        let bg = RequestContext::decouple(&RequestContext::background(), ctx);
        match self.client.unclaim_downlink(&bg, ids).await {
            Ok(()) => info!(gateway_uid = %conn.unique_id(), "Downlink path unclaimed"),
            Err(e) => warn!(
                gateway_uid = %conn.unique_id(),
                error = %e,
                "Failed to unclaim downlink path"
            ),
        }
        Ok(())
    }

    async fn handle_uplink(
        &self,
        ctx: &RequestContext,
        _ids: &GatewayIdentifiers,
        _end_device_ids: &EndDeviceIdentifiers,
        msg: &UplinkMessage,
    ) -> GSResult<()> {
        self.client.handle_uplink(ctx, msg).await
    }

    async fn handle_status(
        &self,
        _ctx: &RequestContext,
        _ids: &GatewayIdentifiers,
        _status: &GatewayStatus,
    ) -> GSResult<()> {
        Ok(())
    }

    async fn handle_tx_ack(
        &self,
        ctx: &RequestContext,
        _ids: &GatewayIdentifiers,
        ack: &TxAcknowledgment,
    ) -> GSResult<()> {
        self.client.report_tx_acknowledgment(ctx, ack).await
    }
}
