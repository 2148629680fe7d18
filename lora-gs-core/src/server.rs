//! Gateway Server: connects gateways and serves the control-plane RPCs.

use crate::{
    clock::{Clock, SystemClock},
    connection::{Connection, ConnectionParams, Frontend},
    context::RequestContext,
    entity::{EntityRegistry, EntityRegistryClient},
    frequency_plans::FrequencyPlansStore,
    lifecycle::{drift, location, stats, version_info},
    observability::Observability,
    registry::ConnectionRegistry,
    scheduling::Emission,
    stats_registry::GatewayConnectionStatsRegistry,
    task::{start_task, BackoffConfig, RestartPolicy, TaskConfig},
    upstream::{
        build_hosts, fanout::handle_upstream, NetworkServerClient, PacketBrokerClient,
        UpstreamHost, PACKET_BROKER_HOST,
    },
};
use lora_gs_error::{GSError, GSResult};
use lora_gs_models::{
    gateway::{CONNECT_FIELD_MASK, FREQUENCY_PLAN_FIELD_MASK},
    DownlinkMessage, FrequencyPlan, Gateway, GatewayConnectionStats, GatewayIdentifiers, Right,
    Settings,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, info, instrument};

/// Used when the gateway record does not set one.
pub const DEFAULT_SCHEDULE_ANYTIME_DELAY: Duration = Duration::from_millis(530);

/// Collaborators of a [`GatewayServer`].
///
/// `network_server` and `packet_broker` are only required when the forward
/// table of the settings names them.
pub struct GatewayServerParams {
    pub settings: Settings,
    pub entity_registry: Arc<dyn EntityRegistryClient>,
    /// Shared stats storage; connection stats stay in memory without it.
    pub stats_registry: Option<Arc<dyn GatewayConnectionStatsRegistry>>,
    pub frequency_plans: Arc<dyn FrequencyPlansStore>,
    pub network_server: Option<Arc<dyn NetworkServerClient>>,
    pub packet_broker: Option<Arc<dyn PacketBrokerClient>>,
    pub clock: Option<Arc<dyn Clock>>,
}

struct Inner {
    settings: Settings,
    /// Root of every connection context.
    ctx: RequestContext,
    clock: Arc<dyn Clock>,
    entity_registry: Arc<EntityRegistry>,
    stats_registry: Option<Arc<dyn GatewayConnectionStatsRegistry>>,
    stats_params: Option<Arc<stats::StatsParams>>,
    frequency_plans: Arc<dyn FrequencyPlansStore>,
    upstreams: Vec<Arc<UpstreamHost>>,
    connections: Arc<ConnectionRegistry>,
    observability: Arc<Observability>,
}

/// Entry point for gateway frontends and cluster RPCs.
///
/// Cheap to clone; all clones share the connection registry.
#[derive(Clone)]
pub struct GatewayServer {
    inner: Arc<Inner>,
}

/// Registers the task with both connection barriers.
fn track_aux(conn: &Connection, cfg: TaskConfig) -> TaskConfig {
    let tokens = (conn.tasks().token(), conn.aux_tasks().token());
    cfg.on_done(move || drop(tokens))
}

impl GatewayServer {
    /// Builds the server and sets up every configured upstream host.
    ///
    /// # Arguments
    /// * `params` - Settings and clients; `clock` defaults to the system clock
    ///
    /// # Errors
    /// Fails when the forward table names an unknown host, a host whose client is
    /// missing, or an invalid DevAddr prefix, or when a host setup fails.
    #[instrument(name = "gs-init", skip_all)]
    pub async fn new(params: GatewayServerParams) -> GSResult<Self> {
        let GatewayServerParams {
            settings,
            entity_registry,
            stats_registry,
            frequency_plans,
            network_server,
            packet_broker,
            clock,
        } = params;
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ctx = RequestContext::background();
        let cfg = &settings.gateway_server;

        let upstreams = build_hosts(&ctx, &cfg.forward, network_server, packet_broker).await?;
        let entity_registry = Arc::new(EntityRegistry::new(
            entity_registry,
            Arc::clone(&clock),
            cfg.entity_registry_cache_ttl(),
        ));
        let stats_params = stats_registry.as_ref().map(|registry| {
            Arc::new(stats::StatsParams {
                registry: Arc::clone(registry),
                clock: Arc::clone(&clock),
                debounce: cfg.update_connection_stats_debounce_time(),
                ttl: cfg.connection_stats_ttl(),
                disconnect_ttl: cfg.connection_stats_disconnect_ttl(),
            })
        });
        info!(
            upstreams = upstreams.len(),
            stats_registry = stats_registry.is_some(),
            "Gateway Server initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                ctx,
                clock,
                entity_registry,
                stats_registry,
                stats_params,
                frequency_plans,
                upstreams,
                connections: Arc::new(ConnectionRegistry::new()),
                observability: Arc::new(Observability::new()),
            }),
        })
    }

    /// Event stream of gateway and traffic events.
    #[inline]
    pub fn observability(&self) -> &Arc<Observability> {
        &self.inner.observability
    }

    #[inline]
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Resolves EUI-only identifiers to a gateway id.
    ///
    /// Unknown EUIs get the `eui-<hex>` id unless registered gateways are required.
    pub async fn fill_gateway_context(
        &self,
        ctx: &RequestContext,
        ids: GatewayIdentifiers,
    ) -> GSResult<GatewayIdentifiers> {
        if !ids.gateway_id.is_empty() {
            return Ok(ids);
        }
        let Some(eui) = ids.eui else {
            return Err(GSError::InvalidArgument("empty gateway identifiers".into()));
        };
        match self.inner.entity_registry.get_identifiers_for_eui(ctx, &eui).await {
            Ok(found) => Ok(GatewayIdentifiers {
                gateway_id: found.gateway_id,
                eui: Some(eui),
            }),
            Err(e) if e.is_not_found() => {
                if self.inner.settings.gateway_server.require_registered_gateways {
                    return Err(GSError::EuiNotRegistered {
                        eui: eui.to_string(),
                    });
                }
                Ok(GatewayIdentifiers::new(GatewayIdentifiers::eui_fallback_id(&eui)).with_eui(eui))
            }
            Err(e) => Err(e),
        }
    }

    /// Gateway record for a new connection, or the unregistered fallback.
    async fn connect_gateway_record(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
        uid: &str,
    ) -> GSResult<Gateway> {
        match self.inner.entity_registry.get(ctx, ids, CONNECT_FIELD_MASK).await {
            Ok(mut gtw) => {
                gtw.ids.gateway_id = ids.gateway_id.clone();
                if gtw.ids.eui.is_none() {
                    gtw.ids.eui = ids.eui;
                }
                Ok(gtw)
            }
            Err(e) if e.is_not_found() => {
                if self.inner.settings.gateway_server.require_registered_gateways {
                    return Err(GSError::GatewayNotRegistered {
                        gateway_uid: uid.to_string(),
                    });
                }
                let fp = ctx.values().fallback_frequency_plan_id.clone().ok_or_else(|| {
                    GSError::NoFallbackFrequencyPlan {
                        gateway_uid: uid.to_string(),
                    }
                })?;
                debug!(
                    gateway_uid = %uid,
                    frequency_plan_id = %fp,
                    "Connecting unregistered gateway"
                );
                Ok(Gateway::unregistered(ids.clone(), fp))
            }
            Err(e) => Err(e),
        }
    }

    /// Connects a gateway through `frontend` and starts its background tasks.
    ///
    /// An existing connection of the same gateway is displaced, and its tasks
    /// are awaited before the new one is registered.
    #[instrument(
        name = "gs-connect",
        skip_all,
        fields(gateway_id = %ids.gateway_id, protocol = frontend.protocol())
    )]
    pub async fn connect(
        &self,
        ctx: &RequestContext,
        frontend: Arc<dyn Frontend>,
        ids: GatewayIdentifiers,
    ) -> GSResult<Arc<Connection>> {
        let ids = self.fill_gateway_context(ctx, ids).await?;
        ids.validate()?;
        self.inner
            .entity_registry
            .assert_gateway_rights(ctx, &ids, &[Right::GatewayLink])
            .await?;

        let uid = ids.unique_id(ctx.tenant_id());
        let gateway = self.connect_gateway_record(ctx, &ids, &uid).await?;
        if gateway.require_authenticated_connection && !ctx.is_authenticated() {
            return Err(GSError::UnauthenticatedGatewayConnection { gateway_uid: uid });
        }
        let frequency_plans = self
            .inner
            .frequency_plans
            .get_all(&gateway.frequency_plan_ids())
            .await?;

        let cfg = &self.inner.settings.gateway_server;
        let conn = Arc::new(Connection::new(ConnectionParams {
            ctx: RequestContext::decouple(&self.inner.ctx, ctx).child(),
            unique_id: uid.clone(),
            frontend,
            enforce_duty_cycle: gateway.enforce_duty_cycle,
            schedule_anytime_delay: gateway
                .schedule_anytime_delay
                .unwrap_or(DEFAULT_SCHEDULE_ANYTIME_DELAY),
            gateway,
            frequency_plans,
            buffer_size: cfg.connection_buffer_size,
            clock: Arc::clone(&self.inner.clock),
        }));

        self.inner.connections.install(&conn).await?;
        self.inner
            .observability
            .register_gateway_connect(&uid, conn.frontend().protocol());
        self.start_tasks(&conn);
        conn.seal_tasks();
        Ok(conn)
    }

    fn start_tasks(&self, conn: &Arc<Connection>) {
        let inner = &self.inner;
        let cfg = &inner.settings.gateway_server;
        let ctx = conn.context().clone();
        let gateway_id = conn.gateway().ids.gateway_id.clone();
        let skip_packet_broker = conn.gateway().disable_packet_broker_forwarding;

        if let Some(params) = &inner.stats_params {
            let (c, p) = (Arc::clone(conn), Arc::clone(params));
            let name = format!("update_connection_stats_{gateway_id}");
            let task = TaskConfig::new(ctx.clone(), name, move |ctx| {
                stats::update_connection_stats(ctx, Arc::clone(&c), Arc::clone(&p))
            });
            start_task(track_aux(conn, task));
        }

        {
            let (c, er) = (Arc::clone(conn), Arc::clone(&inner.entity_registry));
            let (interval, jitter) = (cfg.fetch_gateway_interval(), cfg.fetch_gateway_jitter);
            let name = format!("detect_gateway_drift_{gateway_id}");
            let task = TaskConfig::new(ctx.clone(), name, move |ctx| {
                drift::detect_drift(ctx, Arc::clone(&c), Arc::clone(&er), interval, jitter)
            })
            .restart(RestartPolicy::Always)
            .backoff(BackoffConfig::dial());
            start_task(track_aux(conn, task));
        }

        if conn.gateway().update_location_from_status {
            let (c, er) = (Arc::clone(conn), Arc::clone(&inner.entity_registry));
            let debounce = cfg.update_gateway_location_debounce_time();
            let name = format!("update_location_{gateway_id}");
            let task = TaskConfig::new(ctx.clone(), name, move |ctx| {
                location::update_location(ctx, Arc::clone(&c), Arc::clone(&er), debounce)
            });
            start_task(track_aux(conn, task));
        }

        {
            let (c, er) = (Arc::clone(conn), Arc::clone(&inner.entity_registry));
            let delay = cfg.update_version_info_delay();
            let name = format!("update_version_info_{gateway_id}");
            let task = TaskConfig::new(ctx.clone(), name, move |ctx| {
                version_info::update_version_info(ctx, Arc::clone(&c), Arc::clone(&er), delay)
            });
            start_task(track_aux(conn, task));
        }

        for host in &inner.upstreams {
            if skip_packet_broker && host.name == PACKET_BROKER_HOST {
                continue;
            }
            let (c, h) = (Arc::clone(conn), Arc::clone(host));
            let id = format!("{}_connect_gateway_{gateway_id}", host.display_name());
            let task = TaskConfig::new(ctx.clone(), id, move |ctx| {
                let (c, h) = (Arc::clone(&c), Arc::clone(&h));
                async move {
                    let ids = &c.gateway().ids;
                    h.handler.connect_gateway(&ctx, ids, Arc::clone(&c)).await
                }
            })
            .restart(RestartPolicy::OnFailure)
            .backoff(BackoffConfig::dial());
            start_task(track_aux(conn, task));
        }

        // The fan-out holds the last slot of the barrier and removes the entry
        // once it released it.
        let token = conn.tasks().token();
        let (c, upstreams, obs) = (
            Arc::clone(conn),
            inner.upstreams.clone(),
            Arc::clone(&inner.observability),
        );
        let (done_conn, connections, done_obs) = (
            Arc::clone(conn),
            Arc::clone(&inner.connections),
            Arc::clone(&inner.observability),
        );
        let task = TaskConfig::new(ctx, format!("upstream_fan_out_{gateway_id}"), move |ctx| {
            handle_upstream(ctx, Arc::clone(&c), upstreams.clone(), Arc::clone(&obs))
        })
        .on_done(move || {
            done_obs.register_gateway_disconnect(
                done_conn.unique_id(),
                done_conn.frontend().protocol(),
                done_conn.disconnect_cause(),
            );
            drop(token);
            connections.remove(&done_conn);
        });
        start_task(task);
    }

    /// Live connection of the gateway, if any.
    pub fn get_connection(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
    ) -> Option<Arc<Connection>> {
        self.inner.connections.get(&ids.unique_id(ctx.tenant_id()))
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Admits the downlink on the gateway's scheduler and sends it.
    ///
    /// Only callers from within the cluster may schedule downlinks.
    #[instrument(
        name = "gs-schedule-downlink",
        skip_all,
        fields(gateway_id = %msg.gateway_ids.gateway_id)
    )]
    pub async fn schedule_downlink(
        &self,
        ctx: &RequestContext,
        msg: &DownlinkMessage,
    ) -> GSResult<Emission> {
        if !ctx.values().cluster_peer {
            return Err(GSError::Unauthenticated);
        }
        let uid = msg.gateway_ids.unique_id(ctx.tenant_id());
        let conn = self
            .inner
            .connections
            .get(&uid)
            .ok_or(GSError::NotConnected { gateway_uid: uid })?;
        conn.send_down(msg).await
    }

    /// Connection stats of one gateway.
    ///
    /// Served from the stats registry when one is configured, which also keeps the
    /// stats of disconnected gateways. Without it only connected gateways have stats.
    ///
    /// # Returns
    /// `NotConnected` when no stats are known for the gateway.
    #[instrument(name = "gs-get-stats", skip_all, fields(gateway_id = %ids.gateway_id))]
    pub async fn get_gateway_connection_stats(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
    ) -> GSResult<GatewayConnectionStats> {
        self.inner
            .entity_registry
            .assert_gateway_rights(ctx, ids, &[Right::GatewayStatusRead])
            .await?;
        let uid = ids.unique_id(ctx.tenant_id());
        if let Some(registry) = &self.inner.stats_registry {
            return registry.get(ctx, ids).await.map_err(|e| {
                if e.is_not_found() {
                    GSError::NotConnected { gateway_uid: uid }
                } else {
                    e
                }
            });
        }
        self.inner
            .connections
            .get(&uid)
            .map(|conn| conn.snapshot_stats())
            .ok_or(GSError::NotConnected { gateway_uid: uid })
    }

    /// Stats of the gateways that have any, keyed by gateway id.
    #[instrument(name = "gs-batch-get-stats", skip_all, fields(gateways = ids.len()))]
    pub async fn batch_get_gateway_connection_stats(
        &self,
        ctx: &RequestContext,
        ids: &[GatewayIdentifiers],
    ) -> GSResult<HashMap<String, GatewayConnectionStats>> {
        self.inner
            .entity_registry
            .assert_gateway_batch_rights(ctx, ids, &[Right::GatewayStatusRead])
            .await?;
        if let Some(registry) = &self.inner.stats_registry {
            return registry.batch_get(ctx, ids).await;
        }
        Ok(ids
            .iter()
            .filter_map(|ids| {
                let conn = self.inner.connections.get(&ids.unique_id(ctx.tenant_id()))?;
                Some((ids.gateway_id.clone(), conn.snapshot_stats()))
            })
            .collect())
    }

    /// Frequency plans of the gateway keyed by plan id.
    pub async fn get_frequency_plans(
        &self,
        ctx: &RequestContext,
        ids: &GatewayIdentifiers,
    ) -> GSResult<HashMap<String, FrequencyPlan>> {
        let plan_ids = match self
            .inner
            .entity_registry
            .get(ctx, ids, FREQUENCY_PLAN_FIELD_MASK)
            .await
        {
            Ok(gtw) => gtw.frequency_plan_ids(),
            Err(e) if e.is_not_found() => {
                let fp = ctx.values().fallback_frequency_plan_id.clone().ok_or_else(|| {
                    GSError::NoFallbackFrequencyPlan {
                        gateway_uid: ids.unique_id(ctx.tenant_id()),
                    }
                })?;
                vec![fp]
            }
            Err(e) => return Err(e),
        };
        let plans = self.inner.frequency_plans.get_all(&plan_ids).await?;
        Ok(plans.into_iter().map(|p| (p.id.clone(), p)).collect())
    }

    /// Cancels every connection and waits for their tasks.
    #[instrument(name = "gs-shutdown", skip_all)]
    pub async fn shutdown(&self) {
        self.inner.ctx.cancel();
        let connections = self.inner.connections.all();
        info!(connections = connections.len(), "Shutting down Gateway Server");
        for conn in connections {
            conn.wait_tasks().await;
        }
    }
}
