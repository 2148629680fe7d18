//! Per-connection loop forwarding received frames to every upstream host.

use super::{
    is_drop,
    pool::{WorkerPool, MAX_WORKERS},
    UpstreamHost, PACKET_BROKER_HOST,
};
use crate::{
    connection::Connection,
    context::RequestContext,
    observability::{new_correlation_id, Observability},
};
use futures::FutureExt;
use lora_gs_error::{GSError, GSResult};
use lora_gs_models::{
    lorawan::parse_message, GatewayIdentifiers, GatewayStatus, GatewayUplinkMessage,
    TxAcknowledgment,
};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Drop label of uplinks whose payload cannot be decoded.
const VALIDATION: &str = "validation";

#[derive(Clone)]
enum Frame {
    Uplink(Arc<GatewayUplinkMessage>),
    Status(Arc<GatewayStatus>),
    TxAck(Arc<TxAcknowledgment>),
}

/// One upstream host as seen from a single connection.
struct HostWorker {
    host: Arc<UpstreamHost>,
    ctx: RequestContext,
    ids: GatewayIdentifiers,
    uid: String,
    obs: Arc<Observability>,
}

impl HostWorker {
    fn name(&self) -> &str {
        self.host.display_name()
    }

    async fn handle(&self, frame: Frame, host_cid: String) {
        let handler = &self.host.handler;
        match frame {
            Frame::Uplink(msg) => {
                let Some(payload) = msg.message.payload.as_ref() else {
                    return;
                };
                let end_device_ids = payload.uplink_identifiers();
                if !self.host.accepts(&end_device_ids) {
                    trace!(
                        gateway_uid = %self.uid,
                        host = self.name(),
                        "Uplink outside host prefixes"
                    );
                    return;
                }
                let mut up = msg.message.clone();
                up.correlation_ids.push(host_cid);
                match handler
                    .handle_uplink(&self.ctx, &self.ids, &end_device_ids, &up)
                    .await
                {
                    Err(e) if is_drop(&e) => {
                        self.obs.register_drop_uplink(&self.uid, &msg, self.name(), &e)
                    }
                    res => {
                        if let Err(e) = res {
                            debug!(
                                gateway_uid = %self.uid,
                                host = self.name(),
                                error = %e,
                                "Uplink rejected by host"
                            );
                        }
                        self.obs.register_forward_uplink(&self.uid, &msg, self.name())
                    }
                }
            }
            Frame::Status(status) => {
                let mut st = (*status).clone();
                st.correlation_ids.push(host_cid);
                match handler.handle_status(&self.ctx, &self.ids, &st).await {
                    Err(e) if is_drop(&e) => {
                        self.obs.register_drop_status(&self.uid, &status, self.name(), &e)
                    }
                    _ => self.obs.register_forward_status(&self.uid, &status, self.name()),
                }
            }
            Frame::TxAck(ack) => {
                let mut a = (*ack).clone();
                a.correlation_ids.push(host_cid);
                match handler.handle_tx_ack(&self.ctx, &self.ids, &a).await {
                    Err(e) if is_drop(&e) => {
                        self.obs.register_drop_tx_ack(&self.uid, &ack, self.name(), &e)
                    }
                    _ => self.obs.register_forward_tx_ack(&self.uid, &ack, self.name()),
                }
            }
        }
    }

    fn register_drop(&self, frame: &Frame, err: &GSError) {
        match frame {
            Frame::Uplink(m) => self.obs.register_drop_uplink(&self.uid, m, self.name(), err),
            Frame::Status(s) => self.obs.register_drop_status(&self.uid, s, self.name(), err),
            Frame::TxAck(a) => self.obs.register_drop_tx_ack(&self.uid, a, self.name(), err),
        }
    }
}

struct HostPool {
    worker: Arc<HostWorker>,
    pool: WorkerPool<(Frame, String)>,
}

impl HostPool {
    fn new(
        ctx: &RequestContext,
        conn: &Connection,
        host: &Arc<UpstreamHost>,
        obs: &Arc<Observability>,
    ) -> Self {
        let worker = Arc::new(HostWorker {
            host: Arc::clone(host),
            ctx: ctx.clone(),
            ids: conn.gateway().ids.clone(),
            uid: conn.unique_id().to_string(),
            obs: Arc::clone(obs),
        });
        let w = Arc::clone(&worker);
        let pool = WorkerPool::new(
            ctx.clone(),
            format!("{}_{}", host.display_name(), conn.unique_id()),
            MAX_WORKERS,
            Arc::new(move |(frame, cid): (Frame, String)| {
                let w = Arc::clone(&w);
                async move { w.handle(frame, cid).await }.boxed()
            }),
        );
        Self { worker, pool }
    }

    fn publish(&self, frame: &Frame) {
        let cid = new_correlation_id("gs:up:host");
        if let Err(e) = self.pool.publish((frame.clone(), cid)) {
            warn!(
                gateway_uid = %self.worker.uid,
                host = self.worker.name(),
                error = %e,
                "Failed to publish to upstream host"
            );
            self.worker.register_drop(frame, &e);
        }
    }
}

struct FanOut<'a> {
    conn: &'a Connection,
    pools: Vec<HostPool>,
    obs: &'a Observability,
}

impl FanOut<'_> {
    fn uplink(&self, mut msg: GatewayUplinkMessage) {
        let uid = self.conn.unique_id();
        let protocol = self.conn.frontend().protocol();
        msg.message.correlation_ids.push(new_correlation_id("gs:uplink"));
        if msg.message.payload.is_none() {
            match parse_message(&msg.message.raw_payload) {
                Ok(payload) => msg.message.payload = Some(payload),
                Err(e) => {
                    debug!(gateway_uid = %uid, error = %e, "Failed to decode uplink payload");
                    self.obs.register_drop_uplink(uid, &msg, VALIDATION, &e);
                    return;
                }
            }
        }
        self.obs.register_receive_uplink(uid, &msg, protocol);
        self.publish(Frame::Uplink(Arc::new(msg)));
    }

    fn status(&self, mut status: GatewayStatus) {
        status.correlation_ids.push(new_correlation_id("gs:status"));
        let protocol = self.conn.frontend().protocol();
        self.obs
            .register_receive_status(self.conn.unique_id(), &status, protocol);
        self.publish(Frame::Status(Arc::new(status)));
    }

    fn tx_ack(&self, mut ack: TxAcknowledgment) {
        let uid = self.conn.unique_id();
        let protocol = self.conn.frontend().protocol();
        ack.correlation_ids.push(new_correlation_id("gs:txack"));
        self.obs.register_receive_tx_ack(uid, &ack, protocol);
        self.obs.register_tx_ack_result(uid, &ack, protocol);
        self.publish(Frame::TxAck(Arc::new(ack)));
    }

    fn publish(&self, frame: Frame) {
        for p in &self.pools {
            p.publish(&frame);
        }
    }

    async fn run(&self, ctx: &RequestContext) -> GSResult<()> {
        let (Some(mut up), Some(mut status), Some(mut tx_ack)) =
            (self.conn.up(), self.conn.status(), self.conn.tx_ack())
        else {
            return Err(GSError::Internal("connection channels already taken".into()));
        };
        loop {
            tokio::select! {
                biased;
                _ = ctx.done() => return Ok(()),
                Some(msg) = up.recv() => self.uplink(msg),
                Some(st) = status.recv() => self.status(st),
                Some(ack) = tx_ack.recv() => self.tx_ack(ack),
            }
        }
    }
}

/// Forwards the frames of `conn` until its context is done.
///
/// On exit the host pools are drained, the other connection tasks are awaited
/// and the connection stats are marked disconnected. Removing the registry
/// entry is left to the task's done callback, which runs after this task
/// released its slot in the connection barrier.
pub(crate) async fn handle_upstream(
    ctx: RequestContext,
    conn: Arc<Connection>,
    hosts: Vec<Arc<UpstreamHost>>,
    obs: Arc<Observability>,
) -> GSResult<()> {
    let skip_packet_broker = conn.gateway().disable_packet_broker_forwarding;
    let pools = hosts
        .iter()
        .filter(|h| !(skip_packet_broker && h.name == PACKET_BROKER_HOST))
        .map(|h| HostPool::new(&ctx, &conn, h, &obs))
        .collect();
    let fan_out = FanOut {
        conn: &conn,
        pools,
        obs: &obs,
    };

    let result = fan_out.run(&ctx).await;
    if let Err(e) = &result {
        conn.disconnect(e.clone());
    }

    for p in &fan_out.pools {
        p.pool.wait().await;
    }
    conn.aux_tasks().wait().await;
    conn.mark_disconnected();
    debug!(gateway_uid = %conn.unique_id(), "Upstream fan-out stopped");
    result
}
