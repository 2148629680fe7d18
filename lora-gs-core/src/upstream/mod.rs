//! Upstream hosts: the handlers frames are fanned out to.

pub(crate) mod fanout;
pub mod ns;
pub mod packetbroker;
pub mod pool;

use crate::{connection::Connection, context::RequestContext};
use async_trait::async_trait;
use lora_gs_error::{ErrorKind, GSError, GSResult};
use lora_gs_models::{
    DevAddrPrefix, EndDeviceIdentifiers, GatewayIdentifiers, GatewayStatus, TxAcknowledgment,
    UplinkMessage,
};
use std::{collections::HashMap, sync::Arc};
use tracing::info;

/// Forward table name of the cluster Network Server.
pub const CLUSTER_HOST: &str = "";
/// Forward table name of the Packet Broker peer.
pub const PACKET_BROKER_HOST: &str = "packetbroker";

/// Destination of gateway traffic: the cluster Network Server or the Packet
/// Broker.
///
/// Every connection feeds each configured handler through its own worker pool,
/// so a slow handler does not delay the others.
#[async_trait]
pub trait UpstreamHandler: Send + Sync + 'static {
    /// Uplinks with a DevAddr outside these prefixes are not handled.
    fn dev_addr_prefixes(&self) -> Vec<DevAddrPrefix>;

    /// Called once when the host is constructed.
    async fn setup(&self, ctx: &RequestContext) -> GSResult<()>;

    /// Per-connection work living as long as `ctx`.
    async fn connect_gateway(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        conn: Arc<Connection>,
    ) -> GSResult<()>;

    /// Forwards an uplink the gateway received.
    ///
    /// # Arguments
    /// * `ctx` - Context of the connection
    /// * `ids` - Gateway that received the uplink
    /// * `end_device_ids` - Identifiers parsed from the PHY payload, used for
    ///   DevAddr routing
    /// * `msg` - The uplink with the gateway's own correlation ids
    ///
    /// # Returns
    /// Errors of the drop kinds, see [`is_drop`], account the uplink as dropped.
    async fn handle_uplink(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        end_device_ids: &EndDeviceIdentifiers,
        msg: &UplinkMessage,
    ) -> GSResult<()>;

    /// Forwards a gateway status message.
    async fn handle_status(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        status: &GatewayStatus,
    ) -> GSResult<()>;

    /// Forwards the acknowledgment of a downlink transmission.
    async fn handle_tx_ack(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        ack: &TxAcknowledgment,
    ) -> GSResult<()>;
}

/// Cluster-local Network Server, reached over the cluster RPC.
#[async_trait]
pub trait NetworkServerClient: Send + Sync + 'static {
    /// Delivers an uplink to the Network Server.
    async fn handle_uplink(&self, ctx: &RequestContext, msg: &UplinkMessage) -> GSResult<()>;

    /// Reports the outcome of a downlink the Network Server scheduled.
    async fn report_tx_acknowledgment(
        &self,
        ctx: &RequestContext,
        ack: &TxAcknowledgment,
    ) -> GSResult<()>;

    /// Routes downlinks for the gateway to this server instance.
    async fn claim_downlink(&self, ctx: &RequestContext, ids: &GatewayIdentifiers) -> GSResult<()>;

    /// Releases the claim of [`NetworkServerClient::claim_downlink`].
    async fn unclaim_downlink(&self, ctx: &RequestContext, ids: &GatewayIdentifiers)
        -> GSResult<()>;
}

/// Federated forwarder peer.
#[async_trait]
pub trait PacketBrokerClient: Send + Sync + 'static {
    /// Prepares the peer session; a no-op by default.
    async fn setup(&self, _ctx: &RequestContext) -> GSResult<()> {
        Ok(())
    }

    /// Publishes an uplink to the peer, which routes it to its home network.
    async fn publish_uplink(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        msg: &UplinkMessage,
    ) -> GSResult<()>;

    /// Reports the gateway online state, with its latest status when known.
    async fn update_gateway(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        online: bool,
        status: Option<&GatewayStatus>,
    ) -> GSResult<()>;
}

/// Configured upstream: a named handler and its DevAddr prefixes.
pub struct UpstreamHost {
    pub name: String,
    pub handler: Arc<dyn UpstreamHandler>,
    pub prefixes: Vec<DevAddrPrefix>,
}

impl UpstreamHost {
    /// Display name; the cluster host has an empty name.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "cluster"
        } else {
            &self.name
        }
    }

    /// Whether the handler is given an uplink with these identifiers.
    ///
    /// Frames without DevAddr, such as join-requests, always pass.
    pub fn accepts(&self, ids: &EndDeviceIdentifiers) -> bool {
        match ids.dev_addr {
            Some(addr) => addr.has_prefix(&self.prefixes),
            None => true,
        }
    }
}

/// Error kinds that account a publication as dropped instead of forwarded.
pub fn is_drop(err: &GSError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Canceled
            | ErrorKind::DeadlineExceeded
            | ErrorKind::Unknown
            | ErrorKind::Internal
            | ErrorKind::Unimplemented
            | ErrorKind::Unavailable
    )
}

fn parse_prefixes(name: &str, prefixes: &[String]) -> GSResult<Vec<DevAddrPrefix>> {
    prefixes
        .iter()
        .map(|p| p.parse::<DevAddrPrefix>())
        .collect::<GSResult<Vec<_>>>()
        .map_err(|e| GSError::UpstreamSetup {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

/// Builds the hosts of the forward table and runs their setup.
///
/// Hosts are ordered by name. An unknown name, or a known name whose client
/// is not configured, fails construction.
pub async fn build_hosts(
    ctx: &RequestContext,
    forward: &HashMap<String, Vec<String>>,
    network_server: Option<Arc<dyn NetworkServerClient>>,
    packet_broker: Option<Arc<dyn PacketBrokerClient>>,
) -> GSResult<Vec<Arc<UpstreamHost>>> {
    let mut names: Vec<&String> = forward.keys().collect();
    names.sort();

    let mut hosts = Vec::with_capacity(names.len());
    for name in names {
        let prefixes = parse_prefixes(name, &forward[name])?;
        let handler: Arc<dyn UpstreamHandler> = match name.as_str() {
            CLUSTER_HOST => {
                let client = network_server.clone().ok_or_else(|| GSError::UpstreamSetup {
                    name: name.clone(),
                    reason: "no Network Server client configured".into(),
                })?;
                Arc::new(ns::NsHandler::new(client, prefixes))
            }
            PACKET_BROKER_HOST => {
                let client = packet_broker.clone().ok_or_else(|| GSError::UpstreamSetup {
                    name: name.clone(),
                    reason: "no Packet Broker client configured".into(),
                })?;
                Arc::new(packetbroker::PacketBrokerHandler::new(client, prefixes))
            }
            other => return Err(GSError::UnknownUpstreamHost(other.to_string())),
        };
        handler.setup(ctx).await.map_err(|e| GSError::UpstreamSetup {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        let host = UpstreamHost {
            name: name.clone(),
            prefixes: handler.dev_addr_prefixes(),
            handler,
        };
        info!(host = host.display_name(), prefixes = host.prefixes.len(), "Upstream host ready");
        hosts.push(Arc::new(host));
    }
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_partition_follows_error_kind() {
        assert!(is_drop(&GSError::Canceled));
        assert!(is_drop(&GSError::DeadlineExceeded));
        assert!(is_drop(&GSError::Unavailable("ns".into())));
        assert!(is_drop(&GSError::Panic("x".into())));
        assert!(is_drop(&GSError::Msg("opaque".into())));
        assert!(!is_drop(&GSError::NotFound("device".into())));
        assert!(!is_drop(&GSError::InvalidArgument("mic".into())));
    }

    #[tokio::test]
    async fn unknown_host_names_are_rejected() {
        let forward = HashMap::from([("elsewhere".to_string(), vec!["00000000/0".to_string()])]);
        let err = build_hosts(&RequestContext::background(), &forward, None, None)
            .await
            .err()
            .unwrap();
        assert_eq!(err, GSError::UnknownUpstreamHost("elsewhere".into()));
    }

    #[tokio::test]
    async fn missing_client_fails_setup() {
        let forward = HashMap::from([(String::new(), vec!["00000000/0".to_string()])]);
        let err = build_hosts(&RequestContext::background(), &forward, None, None)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    }
}
