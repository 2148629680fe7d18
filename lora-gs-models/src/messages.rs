use crate::{gateway::Location, ids::GatewayIdentifiers, lorawan::Message};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Version keys carried in `GatewayStatus::versions`.
pub const VERSION_MODEL: &str = "model";
pub const VERSION_FIRMWARE: &str = "firmware";

/// Modulation and data rate of a transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "modulation", rename_all = "snake_case")]
pub enum DataRate {
    Lora {
        spreading_factor: u8,
        /// Bandwidth in Hz.
        bandwidth: u32,
        /// Coding rate as `4/5` to `4/8`.
        coding_rate: String,
    },
    Fsk {
        /// Bit rate in bits per second.
        bit_rate: u32,
    },
}

/// Radio settings of an uplink reception or a downlink transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxSettings {
    pub data_rate: DataRate,
    /// Center frequency in Hz.
    pub frequency: u64,
    /// Absolute emission time; absent means "as soon as possible".
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    /// Concentrator timestamp in microseconds, transport specific.
    #[serde(default)]
    pub timestamp: Option<u32>,
    #[serde(default)]
    pub enable_crc: bool,
}

/// Reception details of one gateway antenna.
#[derive(Debug, Clone, PartialEq)]
pub struct RxMetadata {
    pub gateway_ids: GatewayIdentifiers,
    pub antenna_index: u32,
    pub rssi: f32,
    pub snr: f32,
    pub timestamp: u32,
}

/// An uplink frame as received by a gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkMessage {
    pub raw_payload: Vec<u8>,
    /// Decoded header, filled in by the fan-out loop when the transport did not.
    pub payload: Option<Message>,
    pub settings: TxSettings,
    pub rx_metadata: Vec<RxMetadata>,
    pub received_at: DateTime<Utc>,
    pub correlation_ids: Vec<String>,
}

/// Uplink with the band of the frequency plan it was received under, as queued
/// by a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayUplinkMessage {
    pub message: UplinkMessage,
    pub band_id: String,
}

/// Periodic gateway status.
///
/// `antenna_locations` feed the registry location when the gateway record opts
/// in; `versions` feed the version info attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayStatus {
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub boot_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub versions: HashMap<String, String>,
    #[serde(default)]
    pub antenna_locations: Vec<Location>,
    #[serde(default)]
    pub ip: Vec<String>,
    #[serde(default)]
    pub metrics: HashMap<String, f32>,
    /// Free-form platform description, e.g. from a packet forwarder.
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub correlation_ids: Vec<String>,
}

/// Outcome of a downlink transmission as reported by the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TxAckResult {
    #[default]
    Success,
    UnknownError,
    TooLate,
    TooEarly,
    CollisionPacket,
    CollisionBeacon,
    TxFrequency,
    TxPower,
    GpsUnlocked,
}

/// Acknowledgment of a downlink transmission.
///
/// `downlink_message` is set when the frontend could match the acknowledgment to
/// the downlink it sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxAcknowledgment {
    pub result: TxAckResult,
    pub correlation_ids: Vec<String>,
    pub downlink_message: Option<DownlinkMessage>,
}

/// Downlink to transmit through the gateway in `gateway_ids`.
#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkMessage {
    pub raw_payload: Vec<u8>,
    pub gateway_ids: GatewayIdentifiers,
    pub settings: TxSettings,
    pub correlation_ids: Vec<String>,
}
