//! LoRaWAN PHYPayload header inspection.
//!
//! Only what routing needs is decoded: the message type and the device
//! identifiers carried in clear. FRMPayload and MIC are never interpreted.

use crate::ids::{DevAddr, EndDeviceIdentifiers, Eui64};
use lora_gs_error::{GSError, GSResult};

const MIC_LEN: usize = 4;
const JOIN_REQUEST_LEN: usize = 23;
const REJOIN_TYPE_0_2_LEN: usize = 19;
const REJOIN_TYPE_1_LEN: usize = 24;
const DATA_MIN_LEN: usize = 12;

/// LoRaWAN message type, the top three bits of the MHDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedUp,
    UnconfirmedDown,
    ConfirmedUp,
    ConfirmedDown,
    RejoinRequest,
    Proprietary,
}

impl MType {
    fn from_mhdr(mhdr: u8) -> Self {
        match mhdr >> 5 {
            0 => MType::JoinRequest,
            1 => MType::JoinAccept,
            2 => MType::UnconfirmedUp,
            3 => MType::UnconfirmedDown,
            4 => MType::ConfirmedUp,
            5 => MType::ConfirmedDown,
            6 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }

    #[inline]
    pub fn is_uplink(&self) -> bool {
        matches!(
            self,
            MType::JoinRequest
                | MType::UnconfirmedUp
                | MType::ConfirmedUp
                | MType::RejoinRequest
                | MType::Proprietary
        )
    }
}

/// MAC header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MHdr {
    pub m_type: MType,
    pub major: u8,
}

/// Part of the MAC payload the server needs for routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacPayload {
    Data {
        dev_addr: DevAddr,
        f_ctrl: u8,
        f_cnt: u16,
        f_port: Option<u8>,
    },
    JoinRequest {
        join_eui: Eui64,
        dev_eui: Eui64,
        dev_nonce: u16,
    },
    RejoinRequest {
        rejoin_type: u8,
        join_eui: Option<Eui64>,
        dev_eui: Eui64,
    },
    /// Join-accept and proprietary frames: encrypted or opaque to the server.
    Opaque,
}

/// PHY payload decoded just enough to route it: header, join EUIs or the
/// DevAddr of data frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub m_hdr: MHdr,
    pub payload: MacPayload,
}

impl Message {
    /// Identifiers usable for routing the uplink to an upstream host.
    pub fn uplink_identifiers(&self) -> EndDeviceIdentifiers {
        match &self.payload {
            MacPayload::Data { dev_addr, .. } => EndDeviceIdentifiers {
                dev_addr: Some(*dev_addr),
                ..Default::default()
            },
            MacPayload::JoinRequest {
                join_eui, dev_eui, ..
            } => EndDeviceIdentifiers {
                dev_eui: Some(*dev_eui),
                join_eui: Some(*join_eui),
                ..Default::default()
            },
            MacPayload::RejoinRequest {
                join_eui, dev_eui, ..
            } => EndDeviceIdentifiers {
                dev_eui: Some(*dev_eui),
                join_eui: *join_eui,
                ..Default::default()
            },
            MacPayload::Opaque => EndDeviceIdentifiers::default(),
        }
    }

    /// DevAddr of data frames.
    #[inline]
    pub fn dev_addr(&self) -> Option<DevAddr> {
        match &self.payload {
            MacPayload::Data { dev_addr, .. } => Some(*dev_addr),
            _ => None,
        }
    }
}

/// Parses the MHDR and the clear-text parts of the MAC payload.
pub fn parse_message(raw: &[u8]) -> GSResult<Message> {
    let Some(&mhdr) = raw.first() else {
        return Err(GSError::Payload("empty PHYPayload".into()));
    };
    let m_hdr = MHdr {
        m_type: MType::from_mhdr(mhdr),
        major: mhdr & 0x03,
    };
    let payload = match m_hdr.m_type {
        MType::UnconfirmedUp
        | MType::ConfirmedUp
        | MType::UnconfirmedDown
        | MType::ConfirmedDown => {
            parse_data(raw)?
        }
        MType::JoinRequest => {
            if raw.len() != JOIN_REQUEST_LEN {
                return Err(GSError::Payload(format!(
                    "join-request must be {JOIN_REQUEST_LEN} bytes, got {}",
                    raw.len()
                )));
            }
            MacPayload::JoinRequest {
                join_eui: read_eui(raw, 1)?,
                dev_eui: read_eui(raw, 9)?,
                dev_nonce: u16::from_le_bytes([raw[17], raw[18]]),
            }
        }
        MType::RejoinRequest => parse_rejoin(raw)?,
        MType::JoinAccept | MType::Proprietary => MacPayload::Opaque,
    };
    Ok(Message { m_hdr, payload })
}

fn parse_data(raw: &[u8]) -> GSResult<MacPayload> {
    if raw.len() < DATA_MIN_LEN {
        return Err(GSError::Payload(format!(
            "data frame must be at least {DATA_MIN_LEN} bytes, got {}",
            raw.len()
        )));
    }
    let dev_addr = DevAddr::from_le_slice(&raw[1..5])
        .ok_or_else(|| GSError::Payload("truncated DevAddr".into()))?;
    let f_ctrl = raw[5];
    let f_cnt = u16::from_le_bytes([raw[6], raw[7]]);
    let f_opts_len = usize::from(f_ctrl & 0x0f);
    let fhdr_end = 8 + f_opts_len;
    let mic_start = raw.len() - MIC_LEN;
    if fhdr_end > mic_start {
        return Err(GSError::Payload("FOpts exceed frame length".into()));
    }
    let f_port = (fhdr_end < mic_start).then(|| raw[fhdr_end]);
    Ok(MacPayload::Data {
        dev_addr,
        f_ctrl,
        f_cnt,
        f_port,
    })
}

fn parse_rejoin(raw: &[u8]) -> GSResult<MacPayload> {
    let rejoin_type = *raw
        .get(1)
        .ok_or_else(|| GSError::Payload("truncated rejoin-request".into()))?;
    match rejoin_type {
        0 | 2 if raw.len() == REJOIN_TYPE_0_2_LEN => Ok(MacPayload::RejoinRequest {
            rejoin_type,
            join_eui: None,
            dev_eui: read_eui(raw, 5)?,
        }),
        1 if raw.len() == REJOIN_TYPE_1_LEN => Ok(MacPayload::RejoinRequest {
            rejoin_type,
            join_eui: Some(read_eui(raw, 2)?),
            dev_eui: read_eui(raw, 10)?,
        }),
        _ => Err(GSError::Payload(format!(
            "invalid rejoin-request type {rejoin_type} of {} bytes",
            raw.len()
        ))),
    }
}

fn read_eui(raw: &[u8], at: usize) -> GSResult<Eui64> {
    raw.get(at..)
        .and_then(Eui64::from_le_slice)
        .ok_or_else(|| GSError::Payload("truncated EUI".into()))
}
