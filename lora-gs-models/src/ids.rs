use lora_gs_error::{GSError, GSResult};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

const GATEWAY_ID_MAX_LEN: usize = 36;

#[inline]
fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Value of an ASCII hex digit; callers check [`is_hex`] first.
#[inline]
fn hex_nibble(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    }
}

/// 64-bit extended unique identifier, stored big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Eui64(pub [u8; 8]);

impl Eui64 {
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 8]
    }

    /// Lowercase hex form used in synthesised gateway ids.
    pub fn to_lower_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Reads an EUI transmitted little-endian on air.
    pub fn from_le_slice(b: &[u8]) -> Option<Self> {
        let mut out: [u8; 8] = b.get(..8)?.try_into().ok()?;
        out.reverse();
        Some(Eui64(out))
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

impl FromStr for Eui64 {
    type Err = GSError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || GSError::InvalidArgument(format!("invalid EUI `{s}`"));
        if s.len() != 16 || !is_hex(s) {
            return Err(invalid());
        }
        let mut out = [0u8; 8];
        for (byte, pair) in out.iter_mut().zip(s.as_bytes().chunks_exact(2)) {
            *byte = (hex_nibble(pair[0]) << 4) | hex_nibble(pair[1]);
        }
        Ok(Eui64(out))
    }
}

/// 32-bit end-device network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevAddr(pub u32);

impl DevAddr {
    /// Reads a DevAddr transmitted little-endian on air.
    pub fn from_le_slice(b: &[u8]) -> Option<Self> {
        let bytes: [u8; 4] = b.get(..4)?.try_into().ok()?;
        Some(DevAddr(u32::from_le_bytes(bytes)))
    }

    /// Whether the address falls within any of the prefixes.
    pub fn has_prefix(&self, prefixes: &[DevAddrPrefix]) -> bool {
        prefixes.iter().any(|p| p.matches(*self))
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl FromStr for DevAddr {
    type Err = GSError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 8 || !is_hex(s) {
            return Err(GSError::InvalidArgument(format!("invalid DevAddr `{s}`")));
        }
        u32::from_str_radix(s, 16)
            .map(DevAddr)
            .map_err(|_| GSError::InvalidArgument(format!("invalid DevAddr `{s}`")))
    }
}

/// Bit-mask filter over the DevAddr space, written as `26000000/7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevAddrPrefix {
    pub dev_addr: DevAddr,
    pub length: u8,
}

impl DevAddrPrefix {
    /// Prefix matching every address.
    pub const ANY: DevAddrPrefix = DevAddrPrefix {
        dev_addr: DevAddr(0),
        length: 0,
    };

    #[inline]
    fn mask(&self) -> u32 {
        match self.length {
            0 => 0,
            n => u32::MAX << (32 - u32::from(n.min(32))),
        }
    }

    /// Whether the first `length` bits of `addr` equal those of the prefix.
    #[inline]
    pub fn matches(&self, addr: DevAddr) -> bool {
        let mask = self.mask();
        addr.0 & mask == self.dev_addr.0 & mask
    }
}

impl fmt::Display for DevAddrPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dev_addr, self.length)
    }
}

impl FromStr for DevAddrPrefix {
    type Err = GSError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GSError::InvalidArgument(format!("invalid DevAddr prefix `{s}`"));
        let (addr, len) = s.trim().split_once('/').ok_or_else(invalid)?;
        let length: u8 = len.parse().map_err(|_| invalid())?;
        if length > 32 {
            return Err(invalid());
        }
        Ok(DevAddrPrefix {
            dev_addr: addr.parse().map_err(|_| invalid())?,
            length,
        })
    }
}

/// Compound gateway identifier: the registered id and, optionally, its EUI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayIdentifiers {
    #[serde(default)]
    pub gateway_id: String,
    #[serde(default)]
    pub eui: Option<Eui64>,
}

impl GatewayIdentifiers {
    /// Identifiers without EUI.
    pub fn new(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            eui: None,
        }
    }

    pub fn with_eui(mut self, eui: Eui64) -> Self {
        self.eui = Some(eui);
        self
    }

    /// Fallback id for gateways that are only known by their EUI.
    pub fn eui_fallback_id(eui: &Eui64) -> String {
        format!("eui-{}", eui.to_lower_hex())
    }

    /// Deterministic registry key within an optional tenancy context.
    pub fn unique_id(&self, tenant_id: Option<&str>) -> String {
        match tenant_id {
            Some(tenant) if !tenant.is_empty() => format!("{tenant}.{}", self.gateway_id),
            _ => self.gateway_id.clone(),
        }
    }

    /// Validates the gateway id: lowercase alphanumerics separated by single
    /// dashes, 3 to 36 characters.
    pub fn validate(&self) -> GSResult<()> {
        let id = self.gateway_id.as_str();
        let invalid = || GSError::InvalidArgument(format!("invalid gateway id `{id}`"));
        if id.len() < 3 || id.len() > GATEWAY_ID_MAX_LEN {
            return Err(invalid());
        }
        if id.starts_with('-') || id.ends_with('-') || id.contains("--") {
            return Err(invalid());
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(invalid());
        }
        Ok(())
    }
}

impl fmt::Display for GatewayIdentifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.gateway_id, &self.eui) {
            (id, _) if !id.is_empty() => f.write_str(id),
            (_, Some(eui)) => write!(f, "eui:{eui}"),
            _ => f.write_str("<empty>"),
        }
    }
}

/// End-device identifiers that can be recovered from an uplink header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndDeviceIdentifiers {
    pub dev_addr: Option<DevAddr>,
    pub dev_eui: Option<Eui64>,
    pub join_eui: Option<Eui64>,
}
