//! Runtime state of one connected gateway.

mod frontend;
mod rtt;

pub use frontend::Frontend;

use crate::{
    clock::Clock,
    context::RequestContext,
    scheduling::{airtime, Emission, ScheduleRequest, Scheduler},
};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use lora_gs_error::{GSError, GSResult};
use lora_gs_models::{
    stats::paths, DownlinkMessage, FrequencyPlan, Gateway, GatewayConnectionStats, GatewayStatus,
    GatewayUplinkMessage, TxAcknowledgment,
};
use rtt::RttWindow;
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::Duration,
};
use tokio::sync::{
    futures::Notified,
    mpsc::{self, error::TrySendError},
    Notify,
};
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn try_send<T>(tx: &mpsc::Sender<T>, item: T, channel: &str) -> GSResult<()> {
    tx.try_send(item).map_err(|e| match e {
        TrySendError::Full(_) => GSError::BufferFull {
            channel: channel.to_string(),
        },
        TrySendError::Closed(_) => GSError::Canceled,
    })
}

/// Everything a [`Connection`] is built from.
pub struct ConnectionParams {
    pub ctx: RequestContext,
    pub unique_id: String,
    pub frontend: Arc<dyn Frontend>,
    pub gateway: Gateway,
    pub frequency_plans: Vec<FrequencyPlan>,
    pub enforce_duty_cycle: bool,
    pub schedule_anytime_delay: Duration,
    pub buffer_size: usize,
    pub clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct StatsState {
    stats: GatewayConnectionStats,
    changed: BTreeSet<&'static str>,
}

/// A live gateway connection.
///
/// Owns the bounded uplink, status and Tx acknowledgment queues filled by the
/// frontend, the connection stats, and the downlink scheduler. The connection
/// lives until its context is cancelled, see [`Connection::disconnect`].
pub struct Connection {
    ctx: RequestContext,
    unique_id: String,
    gateway: Gateway,
    frontend: Arc<dyn Frontend>,
    connect_time: DateTime<Utc>,
    clock: Arc<dyn Clock>,
    cause: OnceLock<GSError>,

    up_tx: mpsc::Sender<GatewayUplinkMessage>,
    up_rx: Mutex<Option<mpsc::Receiver<GatewayUplinkMessage>>>,
    status_tx: mpsc::Sender<GatewayStatus>,
    status_rx: Mutex<Option<mpsc::Receiver<GatewayStatus>>>,
    tx_ack_tx: mpsc::Sender<TxAcknowledgment>,
    tx_ack_rx: Mutex<Option<mpsc::Receiver<TxAcknowledgment>>>,

    stats_changed: Notify,
    location_changed: Notify,
    version_info_changed: Notify,

    stats: Mutex<StatsState>,
    last_status: ArcSwapOption<(GatewayStatus, DateTime<Utc>)>,
    rtts: Mutex<RttWindow>,
    scheduler: Mutex<Scheduler>,

    /// Every background task of the connection.
    tasks: TaskTracker,
    /// Every background task except the upstream fan-out.
    aux_tasks: TaskTracker,
}

impl Connection {
    /// Creates the connection and its queues.
    ///
    /// # Arguments
    /// * `params` - Context, identity and frontend of the connection; queues are
    ///   sized by `buffer_size`, at least one slot each
    pub fn new(params: ConnectionParams) -> Self {
        let ConnectionParams {
            ctx,
            unique_id,
            frontend,
            gateway,
            frequency_plans,
            enforce_duty_cycle,
            schedule_anytime_delay,
            buffer_size,
            clock,
        } = params;

        let buffer_size = buffer_size.max(1);
        let (up_tx, up_rx) = mpsc::channel(buffer_size);
        let (status_tx, status_rx) = mpsc::channel(buffer_size);
        let (tx_ack_tx, tx_ack_rx) = mpsc::channel(buffer_size);
        let connect_time = clock.now();
        let scheduler = Scheduler::new(
            Arc::clone(&clock),
            &frequency_plans,
            enforce_duty_cycle,
            schedule_anytime_delay,
        );
        let stats = StatsState {
            stats: GatewayConnectionStats {
                connected_at: Some(connect_time),
                protocol: frontend.protocol().to_string(),
                ..Default::default()
            },
            changed: BTreeSet::new(),
        };

        Self {
            ctx,
            unique_id,
            gateway,
            frontend,
            connect_time,
            clock,
            cause: OnceLock::new(),
            up_tx,
            up_rx: Mutex::new(Some(up_rx)),
            status_tx,
            status_rx: Mutex::new(Some(status_rx)),
            tx_ack_tx,
            tx_ack_rx: Mutex::new(Some(tx_ack_rx)),
            stats_changed: Notify::new(),
            location_changed: Notify::new(),
            version_info_changed: Notify::new(),
            stats: Mutex::new(stats),
            last_status: ArcSwapOption::empty(),
            rtts: Mutex::new(RttWindow::default()),
            scheduler: Mutex::new(scheduler),
            tasks: TaskTracker::new(),
            aux_tasks: TaskTracker::new(),
        }
    }

    /// Context cancelled when the connection ends.
    #[inline]
    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    /// Tenant-scoped unique id of the gateway.
    #[inline]
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    /// Registry record the connection was made with.
    #[inline]
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    #[inline]
    pub fn frontend(&self) -> &Arc<dyn Frontend> {
        &self.frontend
    }

    #[inline]
    pub fn connect_time(&self) -> DateTime<Utc> {
        self.connect_time
    }

    /// Uplink receiver; handed out once, to the fan-out loop.
    pub fn up(&self) -> Option<mpsc::Receiver<GatewayUplinkMessage>> {
        lock(&self.up_rx).take()
    }

    /// Status receiver; handed out once, to the fan-out loop.
    pub fn status(&self) -> Option<mpsc::Receiver<GatewayStatus>> {
        lock(&self.status_rx).take()
    }

    /// Tx acknowledgment receiver; handed out once, to the fan-out loop.
    pub fn tx_ack(&self) -> Option<mpsc::Receiver<TxAcknowledgment>> {
        lock(&self.tx_ack_rx).take()
    }

    /// Cancels the connection. The first cause wins.
    pub fn disconnect(&self, err: GSError) {
        if self.cause.set(err.clone()).is_ok() {
            info!(gateway_uid = %self.unique_id, cause = %err, "Disconnecting gateway");
        }
        self.ctx.cancel();
    }

    /// Cause passed to the first [`Connection::disconnect`], if any.
    pub fn disconnect_cause(&self) -> Option<&GSError> {
        self.cause.get()
    }

    // Wake-ups are coalesced: a pending notification absorbs further ones.

    /// Resolves after the connection stats changed.
    pub fn stats_changed(&self) -> Notified<'_> {
        self.stats_changed.notified()
    }

    pub fn location_changed(&self) -> Notified<'_> {
        self.location_changed.notified()
    }

    pub fn version_info_changed(&self) -> Notified<'_> {
        self.version_info_changed.notified()
    }

    fn update_stats(&self, changed: &[&'static str], f: impl FnOnce(&mut GatewayConnectionStats)) {
        {
            let mut state = lock(&self.stats);
            f(&mut state.stats);
            state.changed.extend(changed.iter().copied());
        }
        self.stats_changed.notify_one();
    }

    fn ensure_live(&self) -> GSResult<()> {
        if self.ctx.is_done() {
            return Err(self.cause.get().cloned().unwrap_or(GSError::Canceled));
        }
        Ok(())
    }

    /// Queues an uplink received by the transport.
    pub fn handle_up(&self, msg: GatewayUplinkMessage) -> GSResult<()> {
        self.ensure_live()?;
        try_send(&self.up_tx, msg, "uplink")?;
        let now = self.clock.now();
        self.update_stats(paths::UPLINK, |s| {
            s.last_uplink_received_at = Some(now);
            s.uplink_count += 1;
        });
        Ok(())
    }

    /// Queues a status message received by the transport.
    pub fn handle_status(&self, status: GatewayStatus) -> GSResult<()> {
        self.ensure_live()?;
        let has_locations = !status.antenna_locations.is_empty();
        try_send(&self.status_tx, status.clone(), "status")?;
        let now = self.clock.now();
        self.last_status.store(Some(Arc::new((status.clone(), now))));
        self.update_stats(paths::STATUS, |s| {
            s.last_status_received_at = Some(now);
            s.last_status = Some(status);
            s.status_count += 1;
        });
        if has_locations {
            self.location_changed.notify_one();
        }
        self.version_info_changed.notify_one();
        Ok(())
    }

    /// Queues a tx acknowledgment received by the transport.
    pub fn handle_tx_ack(&self, ack: TxAcknowledgment) -> GSResult<()> {
        self.ensure_live()?;
        try_send(&self.tx_ack_tx, ack, "tx_acknowledgment")?;
        let now = self.clock.now();
        self.update_stats(paths::TX_ACKNOWLEDGMENT, |s| {
            s.last_tx_acknowledgment_received_at = Some(now);
            s.tx_acknowledgment_count += 1;
        });
        Ok(())
    }

    /// Records a transport round-trip measurement.
    pub fn record_rtt(&self, d: Duration) {
        lock(&self.rtts).record(d);
        self.update_stats(&[paths::ROUND_TRIP_TIMES], |_| {});
    }

    /// Admits the downlink on the gateway scheduler and hands it to the transport.
    pub async fn send_down(&self, msg: &DownlinkMessage) -> GSResult<Emission> {
        self.ensure_live()?;
        let duration = airtime::compute_downlink(msg.raw_payload.len(), &msg.settings)?;
        let emission = lock(&self.scheduler).schedule(ScheduleRequest {
            time: msg.settings.time,
            duration,
            frequency: msg.settings.frequency,
        })?;
        debug!(
            gateway_uid = %self.unique_id,
            start = %emission.start,
            airtime_ms = duration.as_millis() as u64,
            frequency = msg.settings.frequency,
            "Downlink admitted"
        );
        self.frontend.send_down(msg).await?;
        let now = self.clock.now();
        self.update_stats(paths::DOWNLINK, |s| {
            s.last_downlink_received_at = Some(now);
            s.downlink_count += 1;
        });
        Ok(emission)
    }

    /// Most recent status and its arrival time.
    pub fn status_stats(&self) -> Option<(GatewayStatus, DateTime<Utc>)> {
        self.last_status.load_full().map(|s| (*s).clone())
    }

    fn compose(&self, mut stats: GatewayConnectionStats) -> GatewayConnectionStats {
        stats.round_trip_times = lock(&self.rtts).stats();
        stats.sub_bands = lock(&self.scheduler).sub_band_stats();
        stats
    }

    /// Stats snapshot and the paths changed since the previous call.
    pub fn stats(&self) -> (GatewayConnectionStats, Vec<&'static str>) {
        let (stats, changed) = {
            let mut state = lock(&self.stats);
            (state.stats.clone(), std::mem::take(&mut state.changed))
        };
        (self.compose(stats), changed.into_iter().collect())
    }

    /// Stats snapshot leaving the change mask untouched.
    pub fn snapshot_stats(&self) -> GatewayConnectionStats {
        let stats = lock(&self.stats).stats.clone();
        self.compose(stats)
    }

    pub(crate) fn mark_disconnected(&self) {
        let now = self.clock.now();
        self.update_stats(&[paths::CONNECTED_AT, paths::DISCONNECTED_AT], |s| {
            s.connected_at = None;
            s.disconnected_at = Some(now);
        });
    }

    #[inline]
    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    #[inline]
    pub(crate) fn aux_tasks(&self) -> &TaskTracker {
        &self.aux_tasks
    }

    /// No more tasks will be added; the barriers can drain.
    pub(crate) fn seal_tasks(&self) {
        self.aux_tasks.close();
        self.tasks.close();
    }

    /// Number of background tasks still running.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Resolves once every background task of the connection has exited.
    pub async fn wait_tasks(&self) {
        self.tasks.wait().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("unique_id", &self.unique_id)
            .field("protocol", &self.frontend.protocol())
            .field("connect_time", &self.connect_time)
            .field("done", &self.ctx.is_done())
            .finish()
    }
}
