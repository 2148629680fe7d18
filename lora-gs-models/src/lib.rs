//! Data model of the LoRaWAN Gateway Server core.
//!
//! Identifiers, gateway records, gateway-facing messages, connection statistics,
//! frequency plans, rights and the layered `Settings`.

pub mod frequency_plan;
pub mod gateway;
pub mod ids;
pub mod lorawan;
pub mod messages;
pub mod rights;
pub mod settings;
pub mod stats;

pub use frequency_plan::{FrequencyPlan, SubBand};
pub use gateway::{DownlinkPathConstraint, Gateway, GatewayAntenna, Location, LocationSource};
pub use ids::{DevAddr, DevAddrPrefix, EndDeviceIdentifiers, Eui64, GatewayIdentifiers};
pub use messages::{
    DataRate, DownlinkMessage, GatewayStatus, GatewayUplinkMessage, RxMetadata, TxAckResult,
    TxAcknowledgment, TxSettings, UplinkMessage,
};
pub use rights::Right;
pub use settings::{GatewayServerConfig, Settings};
pub use stats::{GatewayConnectionStats, RoundTripTimes, SubBandStats};
