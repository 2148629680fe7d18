use serde::{Deserialize, Serialize};
use std::fmt;

/// Gateway rights understood by the entity registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Right {
    GatewayInfo,
    GatewayLink,
    GatewaySettingsBasic,
    GatewayStatusRead,
    GatewayLocationRead,
    GatewayAll,
}

impl Right {
    /// Whether holding `self` satisfies a requirement for `required`.
    #[inline]
    pub fn implies(&self, required: Right) -> bool {
        *self == required || *self == Right::GatewayAll
    }
}

impl fmt::Display for Right {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Right::GatewayInfo => "RIGHT_GATEWAY_INFO",
            Right::GatewayLink => "RIGHT_GATEWAY_LINK",
            Right::GatewaySettingsBasic => "RIGHT_GATEWAY_SETTINGS_BASIC",
            Right::GatewayStatusRead => "RIGHT_GATEWAY_STATUS_READ",
            Right::GatewayLocationRead => "RIGHT_GATEWAY_LOCATION_READ",
            Right::GatewayAll => "RIGHT_GATEWAY_ALL",
        };
        f.write_str(s)
    }
}
