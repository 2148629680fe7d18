use crate::ids::GatewayIdentifiers;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

/// Fields read from the entity registry when a gateway connects, and again on
/// every registry-drift check.
pub const CONNECT_FIELD_MASK: &[&str] = &[
    "antennas",
    "attributes",
    "disable_packet_broker_forwarding",
    "downlink_path_constraint",
    "enforce_duty_cycle",
    "frequency_plan_id",
    "frequency_plan_ids",
    "location_public",
    "require_authenticated_connection",
    "schedule_anytime_delay",
    "schedule_downlink_late",
    "status_public",
    "update_location_from_status",
];

/// Fields needed to resolve the frequency plans of a gateway.
pub const FREQUENCY_PLAN_FIELD_MASK: &[&str] = &["frequency_plan_id", "frequency_plan_ids"];

/// Whether the Network Server may route downlinks through the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownlinkPathConstraint {
    #[default]
    None,
    PreferOther,
    Never,
}

/// How a location was obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationSource {
    #[default]
    Unknown,
    Gps,
    RegistrySetByUser,
    IpGeolocation,
    Wifi,
}

/// Geographic location in WGS84 degrees; `altitude` and `accuracy` in
/// meters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: i32,
    #[serde(default)]
    pub accuracy: i32,
    #[serde(default)]
    pub source: LocationSource,
}

/// Antenna gain in dBi and location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayAntenna {
    #[serde(default)]
    pub gain: f32,
    #[serde(default)]
    pub location: Option<Location>,
}

/// Gateway record as stored in the entity registry. Read-only to the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Gateway {
    pub ids: GatewayIdentifiers,
    #[serde(default)]
    pub frequency_plan_id: String,
    #[serde(default)]
    pub frequency_plan_ids: Vec<String>,
    #[serde(default)]
    pub enforce_duty_cycle: bool,
    #[serde(default)]
    pub downlink_path_constraint: DownlinkPathConstraint,
    #[serde(default)]
    pub schedule_anytime_delay: Option<Duration>,
    #[serde(default)]
    pub schedule_downlink_late: bool,
    #[serde(default)]
    pub antennas: Vec<GatewayAntenna>,
    #[serde(default)]
    pub location_public: bool,
    #[serde(default)]
    pub status_public: bool,
    #[serde(default)]
    pub require_authenticated_connection: bool,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub update_location_from_status: bool,
    #[serde(default)]
    pub disable_packet_broker_forwarding: bool,
}

impl Gateway {
    /// Minimal record for a gateway missing from the entity registry.
    pub fn unregistered(ids: GatewayIdentifiers, frequency_plan_id: impl Into<String>) -> Self {
        let fp = frequency_plan_id.into();
        Gateway {
            ids,
            frequency_plan_ids: vec![fp.clone()],
            frequency_plan_id: fp,
            enforce_duty_cycle: true,
            downlink_path_constraint: DownlinkPathConstraint::None,
            ..Default::default()
        }
    }

    /// Frequency plan ids in priority order, the legacy single id first.
    pub fn frequency_plan_ids(&self) -> Vec<String> {
        if !self.frequency_plan_ids.is_empty() {
            return self.frequency_plan_ids.clone();
        }
        if self.frequency_plan_id.is_empty() {
            return Vec::new();
        }
        vec![self.frequency_plan_id.clone()]
    }

    /// Keeps only the fields named in `mask`; identifiers are always kept.
    pub fn masked(&self, mask: &[&str]) -> Self {
        let mut out = Gateway {
            ids: self.ids.clone(),
            ..Default::default()
        };
        for field in mask {
            match *field {
                "antennas" => out.antennas = self.antennas.clone(),
                "attributes" => out.attributes = self.attributes.clone(),
                "disable_packet_broker_forwarding" => {
                    out.disable_packet_broker_forwarding = self.disable_packet_broker_forwarding
                }
                "downlink_path_constraint" => {
                    out.downlink_path_constraint = self.downlink_path_constraint
                }
                "enforce_duty_cycle" => out.enforce_duty_cycle = self.enforce_duty_cycle,
                "frequency_plan_id" => out.frequency_plan_id = self.frequency_plan_id.clone(),
                "frequency_plan_ids" => out.frequency_plan_ids = self.frequency_plan_ids.clone(),
                "location_public" => out.location_public = self.location_public,
                "require_authenticated_connection" => {
                    out.require_authenticated_connection = self.require_authenticated_connection
                }
                "schedule_anytime_delay" => {
                    out.schedule_anytime_delay = self.schedule_anytime_delay
                }
                "schedule_downlink_late" => {
                    out.schedule_downlink_late = self.schedule_downlink_late
                }
                "status_public" => out.status_public = self.status_public,
                "update_location_from_status" => {
                    out.update_location_from_status = self.update_location_from_status
                }
                _ => {}
            }
        }
        out
    }
}
