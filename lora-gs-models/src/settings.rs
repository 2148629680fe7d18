use config::{Config, File};
use lora_gs_error::GSResult;
use serde::{self, Deserialize};
use std::{collections::HashMap, ops::Deref, sync::Arc, time::Duration};

/// Process settings, cheap to clone.
///
/// Loaded once at startup; dereferences to [`Inner`].
#[derive(Debug, Clone)]
pub struct Settings(Arc<Inner>);

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    /// Loads settings from the file at `config_path`, overridden by environment
    /// variables.
    ///
    /// # Arguments
    /// * `config_path` - Config file path without extension; a missing file is not
    ///   an error
    ///
    /// # Returns
    /// Settings where `GS__GATEWAY_SERVER__<FIELD>` variables override the file, e.g.
    /// `GS__GATEWAY_SERVER__FETCH_GATEWAY_INTERVAL_MS=60000`.
    pub fn new(config_path: String) -> GSResult<Self> {
        let builder = Config::builder()
            .add_source(File::with_name(config_path.as_str()).required(false))
            .add_source(
                config::Environment::with_prefix("GS")
                    .separator("__")
                    .try_parsing(true),
            );
        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }

    /// Settings made of defaults only.
    pub fn from_inner(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_inner(Inner::default())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub gateway_server: GatewayServerConfig,
}

/// Gateway Server settings. Durations are given in milliseconds, in fields
/// suffixed `_ms`, and read through the accessors of the same name.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayServerConfig {
    /// Deny gateways that are not present in the entity registry.
    #[serde(default)]
    pub require_registered_gateways: bool,
    /// Base period of the registry-drift check (in milliseconds)
    #[serde(default = "GatewayServerConfig::fetch_gateway_interval_ms_default")]
    pub fetch_gateway_interval_ms: u64,
    /// Fraction of `fetch_gateway_interval_ms` used as uniform jitter
    #[serde(default = "GatewayServerConfig::fetch_gateway_jitter_default")]
    pub fetch_gateway_jitter: f64,
    #[serde(default = "GatewayServerConfig::update_gateway_location_debounce_time_ms_default")]
    pub update_gateway_location_debounce_time_ms: u64,
    #[serde(default = "GatewayServerConfig::update_connection_stats_debounce_time_ms_default")]
    pub update_connection_stats_debounce_time_ms: u64,
    #[serde(default = "GatewayServerConfig::update_version_info_delay_ms_default")]
    pub update_version_info_delay_ms: u64,
    /// TTL of stats records of live connections (in milliseconds)
    #[serde(default = "GatewayServerConfig::connection_stats_ttl_ms_default")]
    pub connection_stats_ttl_ms: u64,
    /// TTL of stats records after disconnect (in milliseconds)
    #[serde(default = "GatewayServerConfig::connection_stats_disconnect_ttl_ms_default")]
    pub connection_stats_disconnect_ttl_ms: u64,
    /// Depth of each uplink, status and tx-ack channel of a connection
    #[serde(default = "GatewayServerConfig::connection_buffer_size_default")]
    pub connection_buffer_size: usize,
    /// TTL of entity registry lookups; `0` disables the cache
    #[serde(default = "GatewayServerConfig::entity_registry_cache_ttl_ms_default")]
    pub entity_registry_cache_ttl_ms: u64,
    /// Upstream host name to DevAddr prefixes.
    ///
    /// The empty name is the cluster Network Server and `packetbroker` the
    /// Packet Broker peer. Any other name is rejected when hosts are built.
    #[serde(default = "GatewayServerConfig::forward_default")]
    pub forward: HashMap<String, Vec<String>>,
}

impl Default for GatewayServerConfig {
    fn default() -> Self {
        GatewayServerConfig {
            require_registered_gateways: false,
            fetch_gateway_interval_ms: Self::fetch_gateway_interval_ms_default(),
            fetch_gateway_jitter: Self::fetch_gateway_jitter_default(),
            update_gateway_location_debounce_time_ms:
                Self::update_gateway_location_debounce_time_ms_default(),
            update_connection_stats_debounce_time_ms:
                Self::update_connection_stats_debounce_time_ms_default(),
            update_version_info_delay_ms: Self::update_version_info_delay_ms_default(),
            connection_stats_ttl_ms: Self::connection_stats_ttl_ms_default(),
            connection_stats_disconnect_ttl_ms: Self::connection_stats_disconnect_ttl_ms_default(),
            connection_buffer_size: Self::connection_buffer_size_default(),
            entity_registry_cache_ttl_ms: Self::entity_registry_cache_ttl_ms_default(),
            forward: Self::forward_default(),
        }
    }
}

impl GatewayServerConfig {
    fn fetch_gateway_interval_ms_default() -> u64 {
        10 * 60 * 1000
    }

    fn fetch_gateway_jitter_default() -> f64 {
        0.2
    }

    fn update_gateway_location_debounce_time_ms_default() -> u64 {
        60 * 60 * 1000
    }

    fn update_connection_stats_debounce_time_ms_default() -> u64 {
        3000
    }

    fn update_version_info_delay_ms_default() -> u64 {
        5000
    }

    fn connection_stats_ttl_ms_default() -> u64 {
        12 * 60 * 60 * 1000
    }

    fn connection_stats_disconnect_ttl_ms_default() -> u64 {
        48 * 60 * 60 * 1000
    }

    fn connection_buffer_size_default() -> usize {
        10
    }

    fn entity_registry_cache_ttl_ms_default() -> u64 {
        60_000
    }

    fn forward_default() -> HashMap<String, Vec<String>> {
        HashMap::from([(String::new(), vec!["00000000/0".to_string()])])
    }

    #[inline]
    pub fn fetch_gateway_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_gateway_interval_ms)
    }

    #[inline]
    pub fn update_gateway_location_debounce_time(&self) -> Duration {
        Duration::from_millis(self.update_gateway_location_debounce_time_ms)
    }

    #[inline]
    pub fn update_connection_stats_debounce_time(&self) -> Duration {
        Duration::from_millis(self.update_connection_stats_debounce_time_ms)
    }

    #[inline]
    pub fn update_version_info_delay(&self) -> Duration {
        Duration::from_millis(self.update_version_info_delay_ms)
    }

    #[inline]
    pub fn connection_stats_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_stats_ttl_ms)
    }

    #[inline]
    pub fn connection_stats_disconnect_ttl(&self) -> Duration {
        Duration::from_millis(self.connection_stats_disconnect_ttl_ms)
    }

    #[inline]
    pub fn entity_registry_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.entity_registry_cache_ttl_ms)
    }
}
