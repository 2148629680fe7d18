use crate::messages::GatewayStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Field paths of `GatewayConnectionStats`, used as set masks.
pub mod paths {
    pub const CONNECTED_AT: &str = "connected_at";
    pub const DISCONNECTED_AT: &str = "disconnected_at";
    pub const PROTOCOL: &str = "protocol";
    pub const LAST_UPLINK_RECEIVED_AT: &str = "last_uplink_received_at";
    pub const UPLINK_COUNT: &str = "uplink_count";
    pub const LAST_STATUS_RECEIVED_AT: &str = "last_status_received_at";
    pub const LAST_STATUS: &str = "last_status";
    pub const STATUS_COUNT: &str = "status_count";
    pub const LAST_DOWNLINK_RECEIVED_AT: &str = "last_downlink_received_at";
    pub const DOWNLINK_COUNT: &str = "downlink_count";
    pub const LAST_TX_ACKNOWLEDGMENT_RECEIVED_AT: &str = "last_tx_acknowledgment_received_at";
    pub const TX_ACKNOWLEDGMENT_COUNT: &str = "tx_acknowledgment_count";
    pub const ROUND_TRIP_TIMES: &str = "round_trip_times";
    pub const SUB_BANDS: &str = "sub_bands";

    pub const UPLINK: &[&str] = &[LAST_UPLINK_RECEIVED_AT, UPLINK_COUNT];
    pub const STATUS: &[&str] = &[LAST_STATUS_RECEIVED_AT, LAST_STATUS, STATUS_COUNT];
    pub const DOWNLINK: &[&str] = &[LAST_DOWNLINK_RECEIVED_AT, DOWNLINK_COUNT, SUB_BANDS];
    pub const TX_ACKNOWLEDGMENT: &[&str] =
        &[LAST_TX_ACKNOWLEDGMENT_RECEIVED_AT, TX_ACKNOWLEDGMENT_COUNT];

    pub const ALL: &[&str] = &[
        CONNECTED_AT,
        DISCONNECTED_AT,
        PROTOCOL,
        LAST_UPLINK_RECEIVED_AT,
        UPLINK_COUNT,
        LAST_STATUS_RECEIVED_AT,
        LAST_STATUS,
        STATUS_COUNT,
        LAST_DOWNLINK_RECEIVED_AT,
        DOWNLINK_COUNT,
        LAST_TX_ACKNOWLEDGMENT_RECEIVED_AT,
        TX_ACKNOWLEDGMENT_COUNT,
        ROUND_TRIP_TIMES,
        SUB_BANDS,
    ];
}

/// Round-trip time summary over the recent downlink window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundTripTimes {
    pub min: Duration,
    pub max: Duration,
    pub median: Duration,
    pub count: u32,
}

/// Downlink utilization of one sub-band, as fractions of airtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubBandStats {
    pub min_frequency: u64,
    pub max_frequency: u64,
    pub downlink_utilization_limit: f32,
    pub downlink_utilization: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConnectionStats {
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub protocol: String,
    pub last_uplink_received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub uplink_count: u64,
    pub last_status_received_at: Option<DateTime<Utc>>,
    pub last_status: Option<GatewayStatus>,
    #[serde(default)]
    pub status_count: u64,
    pub last_downlink_received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub downlink_count: u64,
    pub last_tx_acknowledgment_received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tx_acknowledgment_count: u64,
    pub round_trip_times: Option<RoundTripTimes>,
    #[serde(default)]
    pub sub_bands: Vec<SubBandStats>,
}

impl GatewayConnectionStats {
    /// Copies the fields named by `mask` from `src`. Unknown paths are ignored.
    pub fn set_fields(&mut self, src: &GatewayConnectionStats, mask: &[&str]) {
        for path in mask {
            match *path {
                paths::CONNECTED_AT => self.connected_at = src.connected_at,
                paths::DISCONNECTED_AT => self.disconnected_at = src.disconnected_at,
                paths::PROTOCOL => self.protocol = src.protocol.clone(),
                paths::LAST_UPLINK_RECEIVED_AT => {
                    self.last_uplink_received_at = src.last_uplink_received_at
                }
                paths::UPLINK_COUNT => self.uplink_count = src.uplink_count,
                paths::LAST_STATUS_RECEIVED_AT => {
                    self.last_status_received_at = src.last_status_received_at
                }
                paths::LAST_STATUS => self.last_status = src.last_status.clone(),
                paths::STATUS_COUNT => self.status_count = src.status_count,
                paths::LAST_DOWNLINK_RECEIVED_AT => {
                    self.last_downlink_received_at = src.last_downlink_received_at
                }
                paths::DOWNLINK_COUNT => self.downlink_count = src.downlink_count,
                paths::LAST_TX_ACKNOWLEDGMENT_RECEIVED_AT => {
                    self.last_tx_acknowledgment_received_at =
                        src.last_tx_acknowledgment_received_at
                }
                paths::TX_ACKNOWLEDGMENT_COUNT => {
                    self.tx_acknowledgment_count = src.tx_acknowledgment_count
                }
                paths::ROUND_TRIP_TIMES => self.round_trip_times = src.round_trip_times.clone(),
                paths::SUB_BANDS => self.sub_bands = src.sub_bands.clone(),
                _ => {}
            }
        }
    }
}
